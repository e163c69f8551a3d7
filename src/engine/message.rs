//! Platform-neutral message and event shapes
//!
//! The engine produces [`OutboundMessage`] values; platform adapters render
//! them to their wire format. Inbound events are logged as [`Receipt`]
//! records before dispatch, and emit-event instructions produce
//! [`UserEvent`] records for the event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::program::{Button, GalleryCard};

/// An outbound message in platform-neutral shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Plain text.
    Text {
        /// Message text.
        text: String,
    },
    /// Text with persistent buttons.
    TextWithButtons {
        /// Message text.
        text: String,
        /// Attached buttons.
        buttons: Vec<Button>,
    },
    /// Text with one-shot quick replies.
    TextWithQuickReplies {
        /// Message text.
        text: String,
        /// Attached quick replies.
        quick_replies: Vec<Button>,
    },
    /// A single image.
    Image {
        /// Image URL.
        url: String,
    },
    /// A horizontally scrollable card gallery.
    Gallery {
        /// Resolved cards, in display order.
        cards: Vec<GalleryCard>,
        /// Platform rendering hint for card images.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_aspect_ratio: Option<String>,
    },
    /// Typing indicator action.
    TypingOn,
}

/// Channel an inbound event arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Free-text user message.
    Text,
    /// Button press payload.
    Button,
    /// Quick-reply selection payload.
    QuickReply,
    /// Human-operator message.
    Operator,
    /// Referral deep-link tag.
    Referral,
    /// Scheduled-trigger callback.
    ScheduledTask,
}

/// Receipt log entry appended before an inbound event is dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    /// Channel the event arrived on.
    pub source: EventSource,
    /// Raw text, for text and operator events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Structured payload, for button/quick-reply/referral/trigger events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Time of receipt.
    pub at: DateTime<Utc>,
}

impl Receipt {
    /// Receipt for a free-text message.
    pub fn text(text: &str) -> Self {
        Self {
            source: EventSource::Text,
            text: Some(text.to_string()),
            payload: None,
            at: Utc::now(),
        }
    }

    /// Receipt for an operator message.
    pub fn operator(text: &str) -> Self {
        Self {
            source: EventSource::Operator,
            text: Some(text.to_string()),
            payload: None,
            at: Utc::now(),
        }
    }

    /// Receipt carrying a structured payload.
    pub fn payload(source: EventSource, payload: Value) -> Self {
        Self {
            source,
            text: None,
            payload: Some(payload),
            at: Utc::now(),
        }
    }
}

/// Payload attached to a button press or quick-reply selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ButtonPayload {
    /// Block to jump to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto: Option<String>,
    /// Caption of the pressed button, stored as `${last_button}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Payload carried by a scheduled trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Block to jump to when the trigger fires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto: Option<String>,
}

/// A structured user event emitted by an emit-event instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEvent {
    /// Platform-scoped user identifier.
    pub user_id: String,
    /// Event type name from the script.
    pub event_type: String,
    /// Block the instruction executed in.
    pub current_block: String,
    /// Optional substituted payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Dedupe by (user, type) at the store.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unique: bool,
    /// Marks the start of a fresh logical session.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub start_new_session: bool,
}

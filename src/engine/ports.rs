//! Collaborator ports
//!
//! The core depends on narrow async traits for everything it does not
//! implement itself: session persistence and append-only logs, the outbound
//! side of a conversation, the deferred-trigger service, and mail delivery.
//! Adapters report failures as `anyhow::Error`; the engine decides which are
//! fatal and which are logged and swallowed.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use super::message::{OutboundMessage, Receipt, TaskPayload, UserEvent};
use super::program::DelaySpec;
use super::session::Session;

/// Identifier of a recorded scheduled task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a fresh task id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A recorded deferred trigger, consumed once when it fires.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScheduledTask {
    /// Platform the task belongs to.
    pub platform: String,
    /// Platform-scoped user identifier.
    pub user_id: String,
    /// Delay before firing.
    pub delay: DelaySpec,
    /// Trigger name echoed back on firing.
    pub trigger: String,
    /// Payload delivered to the engine when the trigger fires.
    pub payload: TaskPayload,
}

/// Persistence port: one session document per (platform, user) pair plus
/// append-only message, event, and scheduled-task records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the session for a user, creating an empty one on first contact.
    /// Returns the session and whether it was newly created.
    async fn load_or_create(&self, platform: &str, user_id: &str)
    -> anyhow::Result<(Session, bool)>;

    /// Persist a session document, replacing any previous version.
    async fn save(&self, platform: &str, session: &Session) -> anyhow::Result<()>;

    /// Append an inbound receipt to the message log.
    async fn append_received(
        &self,
        platform: &str,
        user_id: &str,
        receipt: &Receipt,
    ) -> anyhow::Result<()>;

    /// Append an outbound message to the message log.
    async fn append_sent(
        &self,
        platform: &str,
        user_id: &str,
        message: &OutboundMessage,
    ) -> anyhow::Result<()>;

    /// Append a structured user event to the event log.
    async fn append_event(&self, event: &UserEvent) -> anyhow::Result<()>;

    /// Record a scheduled task and return its id.
    async fn record_scheduled_task(&self, task: &ScheduledTask) -> anyhow::Result<TaskId>;

    /// Consume a scheduled task by id. Returns `None` when the task was
    /// already consumed or never existed.
    async fn take_scheduled_task(&self, id: &TaskId) -> anyhow::Result<Option<ScheduledTask>>;
}

/// Outbound side of one user's conversation, provided per request by the
/// platform adapter.
#[async_trait]
pub trait Conversation: Send + Sync {
    /// Deliver a message to the user. Failures are logged, not fatal.
    async fn send(&self, message: &OutboundMessage) -> anyhow::Result<()>;

    /// Fetch profile variables for the user (first name, locale, ...),
    /// keyed by placeholder. `None` when the platform offers no profile.
    async fn fetch_user_variables(&self) -> anyhow::Result<Option<HashMap<String, Value>>>;
}

/// Deferred-trigger service port. The engine records the task with the
/// session store first; the scheduler only arms the timer.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Arm a timer for an already recorded task; on firing, the service
    /// calls back into the engine's scheduled-trigger entry point with the
    /// same task id and trigger name.
    async fn schedule(
        &self,
        task_id: &TaskId,
        platform: &str,
        user_id: &str,
        delay: &DelaySpec,
        trigger: &str,
    ) -> anyhow::Result<()>;
}

/// Outbound mail port.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver a plain-text email. Failures are logged, not fatal.
    async fn send_email(&self, to: &[String], subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Platform-level initialization port, driven once at engine startup with
/// the platform-directive entries of the initialize block.
#[async_trait]
pub trait PlatformInit: Send + Sync {
    /// Name of the platform, matched against directive entries.
    fn platform(&self) -> &str;

    /// Apply one raw directive payload (greeting setup and similar).
    async fn process_init_directive(&self, payload: &Value) -> anyhow::Result<()>;
}

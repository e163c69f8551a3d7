//! In-memory session store
//!
//! A complete [`SessionStore`] backed by maps, used by the integration tests
//! and handy for embedding the engine without external storage. Mirrors the
//! document layout of a real store: sessions keyed by (platform, user),
//! append-only message and event logs, consume-once scheduled-task records.

use parking_lot::Mutex;
use std::collections::HashMap;

use async_trait::async_trait;

use super::message::{OutboundMessage, Receipt, UserEvent};
use super::ports::{ScheduledTask, SessionStore, TaskId};
use super::session::Session;

/// Direction of a logged message, from the bot's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sent by the bot to the user.
    Sent,
    /// Received by the bot from the user.
    Received,
}

/// One entry of the in-memory message log.
#[derive(Debug, Clone)]
pub struct LoggedMessage {
    /// Platform the message belongs to.
    pub platform: String,
    /// Platform-scoped user identifier.
    pub user_id: String,
    /// Sent or received.
    pub direction: Direction,
    /// Inbound receipt, for received entries.
    pub receipt: Option<Receipt>,
    /// Outbound message, for sent entries.
    pub message: Option<OutboundMessage>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<(String, String), Session>,
    message_log: Vec<LoggedMessage>,
    event_log: Vec<UserEvent>,
    tasks: HashMap<TaskId, ScheduledTask>,
}

/// In-memory [`SessionStore`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a user's session, if one exists.
    pub fn session(&self, platform: &str, user_id: &str) -> Option<Session> {
        self.inner
            .lock()
            .sessions
            .get(&(platform.to_string(), user_id.to_string()))
            .cloned()
    }

    /// Outbound messages logged for a user, in send order.
    pub fn sent_messages(&self, user_id: &str) -> Vec<OutboundMessage> {
        self.inner
            .lock()
            .message_log
            .iter()
            .filter(|entry| entry.direction == Direction::Sent && entry.user_id == user_id)
            .filter_map(|entry| entry.message.clone())
            .collect()
    }

    /// Inbound receipts logged for a user, in arrival order.
    pub fn received(&self, user_id: &str) -> Vec<Receipt> {
        self.inner
            .lock()
            .message_log
            .iter()
            .filter(|entry| entry.direction == Direction::Received && entry.user_id == user_id)
            .filter_map(|entry| entry.receipt.clone())
            .collect()
    }

    /// All logged user events, in emit order.
    pub fn events(&self) -> Vec<UserEvent> {
        self.inner.lock().event_log.clone()
    }

    /// Number of scheduled-task records not yet consumed.
    pub fn pending_task_count(&self) -> usize {
        self.inner.lock().tasks.len()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load_or_create(
        &self,
        platform: &str,
        user_id: &str,
    ) -> anyhow::Result<(Session, bool)> {
        let mut inner = self.inner.lock();
        let key = (platform.to_string(), user_id.to_string());
        if let Some(session) = inner.sessions.get(&key) {
            return Ok((session.clone(), false));
        }
        let session = Session::new(user_id);
        inner.sessions.insert(key, session.clone());
        Ok((session, true))
    }

    async fn save(&self, platform: &str, session: &Session) -> anyhow::Result<()> {
        self.inner
            .lock()
            .sessions
            .insert((platform.to_string(), session.id.clone()), session.clone());
        Ok(())
    }

    async fn append_received(
        &self,
        platform: &str,
        user_id: &str,
        receipt: &Receipt,
    ) -> anyhow::Result<()> {
        self.inner.lock().message_log.push(LoggedMessage {
            platform: platform.to_string(),
            user_id: user_id.to_string(),
            direction: Direction::Received,
            receipt: Some(receipt.clone()),
            message: None,
        });
        Ok(())
    }

    async fn append_sent(
        &self,
        platform: &str,
        user_id: &str,
        message: &OutboundMessage,
    ) -> anyhow::Result<()> {
        self.inner.lock().message_log.push(LoggedMessage {
            platform: platform.to_string(),
            user_id: user_id.to_string(),
            direction: Direction::Sent,
            receipt: None,
            message: Some(message.clone()),
        });
        Ok(())
    }

    async fn append_event(&self, event: &UserEvent) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if event.unique
            && inner
                .event_log
                .iter()
                .any(|logged| logged.user_id == event.user_id && logged.event_type == event.event_type)
        {
            return Ok(());
        }
        inner.event_log.push(event.clone());
        Ok(())
    }

    async fn record_scheduled_task(&self, task: &ScheduledTask) -> anyhow::Result<TaskId> {
        let id = TaskId::new();
        self.inner.lock().tasks.insert(id.clone(), task.clone());
        Ok(id)
    }

    async fn take_scheduled_task(&self, id: &TaskId) -> anyhow::Result<Option<ScheduledTask>> {
        Ok(self.inner.lock().tasks.remove(id))
    }
}

//! Per-user serialization of event handling
//!
//! Two webhook deliveries for the same user must not interleave their
//! load-run-save cycles, or one would overwrite the other's progress. The
//! engine holds the user's lock across the whole cycle; events for different
//! users proceed independently.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Lock table keyed by (platform, user id).
#[derive(Default)]
pub struct SessionLocks {
    inner: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the lock guarding one user's session.
    ///
    /// Entries nobody holds any more are evicted on the way, so the table
    /// tracks users with in-flight events rather than every user ever seen.
    pub fn lock_for(&self, platform: &str, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut table = self.inner.lock();
        table.retain(|_, lock| Arc::strong_count(lock) > 1);
        table
            .entry((platform.to_string(), user_id.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

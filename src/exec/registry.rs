//! Exec registry - concurrent index of live exec sessions
//!
//! Sessions register themselves at start and remove themselves in their
//! cleanup path; the shutdown drain polls this table until it empties.

use super::session::ExecSessionHandle;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// Registry entry for one live session.
#[derive(Clone)]
pub struct ExecSessionInfo {
    pub session_id: String,
    pub sprite_id: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub handle: ExecSessionHandle,
}

/// Concurrent lookup table keyed by session id.
#[derive(Clone, Default)]
pub struct ExecRegistry {
    sessions: Arc<DashMap<String, ExecSessionInfo>>,
}

impl ExecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: ExecSessionInfo) {
        self.sessions.insert(info.session_id.clone(), info);
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn get(&self, session_id: &str) -> Option<ExecSessionInfo> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    /// Ids of all live sessions, unordered.
    pub fn active_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ask every live session to close. Used by the forced drain path.
    pub async fn close_all(&self) {
        for entry in self.sessions.iter() {
            entry.handle.close().await;
        }
    }
}

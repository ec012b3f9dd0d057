//! Registry of live sessions.

use dashmap::DashMap;
use tracing::debug;

use super::{Session, SessionId};
use crate::config::SessionConfig;

/// Concurrent map of open sessions. Sessions share nothing but this map.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    /// Open a fresh session.
    pub fn open(&self) -> Session {
        self.open_with(|_| {})
    }

    /// Open a session and run `setup` (register outputs and observers)
    /// before it becomes visible to other callers.
    pub fn open_with(&self, setup: impl FnOnce(&Session)) -> Session {
        let session = Session::new(self.config.clone());
        setup(&session);
        self.sessions.insert(session.id(), session.clone());
        debug!(session = %session.id(), open = self.sessions.len(), "session registered");
        session
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Close and forget session `id`. Returns `false` if it was not open.
    pub fn close(&self, id: SessionId) -> bool {
        match self.sessions.remove(&id) {
            Some((_, session)) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

//! Fixed-capacity session registry.

use crate::error::ServerError;
use crate::session::ServerSession;
use dashmap::DashMap;
use relay_wire::SessionId;
use std::sync::Arc;

/// Map of live sessions keyed by session id.
///
/// Mutations are serialized per shard; reads are lock-free. Iteration for
/// the update sweep works on a snapshot, so a session removed mid-sweep may
/// still see one trailing tick (sessions no-op ticks after close).
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<ServerSession>>,
    max_session: usize,
}

impl SessionRegistry {
    /// Create a registry bounded at `max_session` live sessions.
    pub fn new(max_session: u16) -> Self {
        Self {
            sessions: DashMap::new(),
            max_session: max_session as usize,
        }
    }

    /// Insert a session. Fails with `CapacityExceeded` at the bound.
    pub fn insert(&self, session: Arc<ServerSession>) -> Result<(), ServerError> {
        if self.sessions.len() >= self.max_session {
            return Err(ServerError::CapacityExceeded);
        }
        let previous = self.sessions.insert(session.id(), session);
        debug_assert!(previous.is_none(), "session id reused while live");
        Ok(())
    }

    /// Remove a session by id.
    pub fn remove(&self, id: SessionId) -> Option<Arc<ServerSession>> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    /// Look up a live session.
    pub fn find(&self, id: SessionId) -> Option<Arc<ServerSession>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Copy of the live session set, safe to iterate under concurrent
    /// insert/remove.
    pub fn snapshot(&self) -> Vec<Arc<ServerSession>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Invoke `f` for every session in a snapshot of the registry.
    pub fn for_each<F: FnMut(&Arc<ServerSession>)>(&self, mut f: F) {
        for session in self.snapshot() {
            f(&session);
        }
    }
}

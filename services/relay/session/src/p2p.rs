//! P2P group membership tracking.

use relay_wire::{SessionId, SERVER_SESSION_ID};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

/// Tracks which sessions belong to which P2P group.
///
/// Group semantics beyond membership are reserved; the manager's load-bearing
/// contract is cleanup: a closing session leaves every group it joined.
#[derive(Debug, Default)]
pub struct P2pManager {
    groups: Mutex<HashMap<u16, HashSet<SessionId>>>,
}

impl P2pManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to a group. Group 0 is reserved and rejected.
    pub fn join(&self, group: u16, session: SessionId) -> bool {
        if group == SERVER_SESSION_ID {
            return false;
        }
        let Ok(mut groups) = self.groups.lock() else {
            return false;
        };
        let inserted = groups.entry(group).or_default().insert(session);
        if inserted {
            debug!(group, session, "session joined p2p group");
        }
        inserted
    }

    /// Remove a session from a group.
    pub fn leave(&self, group: u16, session: SessionId) -> bool {
        let Ok(mut groups) = self.groups.lock() else {
            return false;
        };
        let Some(members) = groups.get_mut(&group) else {
            return false;
        };
        let removed = members.remove(&session);
        if members.is_empty() {
            groups.remove(&group);
        }
        if removed {
            debug!(group, session, "session left p2p group");
        }
        removed
    }

    /// Members of a group.
    pub fn members(&self, group: u16) -> Vec<SessionId> {
        self.groups
            .lock()
            .map(|groups| {
                groups
                    .get(&group)
                    .map(|members| members.iter().copied().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Number of non-empty groups.
    pub fn group_count(&self) -> usize {
        self.groups.lock().map(|groups| groups.len()).unwrap_or(0)
    }

    /// Drop the departing session from every group it joined.
    pub(crate) fn on_session_closed(&self, session: SessionId) {
        let Ok(mut groups) = self.groups.lock() else {
            return;
        };
        groups.retain(|_, members| {
            members.remove(&session);
            !members.is_empty()
        });
    }

    /// Forget all membership. Called during server stop.
    pub fn clear(&self) {
        if let Ok(mut groups) = self.groups.lock() {
            groups.clear();
        }
    }
}

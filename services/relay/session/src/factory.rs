//! Session factory: bounded id allocation and recycling.

use crate::endpoint::UdpEndpoint;
use crate::session::ServerSession;
use relay_wire::SessionId;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

/// Allocates sessions for accepted sockets, up to `max_session` at a time.
///
/// The factory owns the id space `1..=max_session`; `create` returns `None`
/// once it is exhausted, which is how capacity rejection surfaces to the
/// accept path. Ids return to the pool when the session is released.
#[derive(Debug)]
pub struct SessionFactory {
    free_ids: Mutex<Vec<SessionId>>,
}

impl SessionFactory {
    /// Create a factory for the id space `1..=max_session`.
    pub fn new(max_session: u16) -> Self {
        // Stacked so that the lowest ids are handed out first.
        let free_ids = (1..=max_session).rev().collect();
        Self {
            free_ids: Mutex::new(free_ids),
        }
    }

    /// Build a session for an accepted socket, or `None` at capacity.
    ///
    /// Each session gets a fresh `ConnectId` nonce binding its later UDP
    /// rendezvous to this TCP identity.
    pub fn create(
        &self,
        stream: TcpStream,
        udp_endpoint: Option<Arc<UdpEndpoint>>,
    ) -> io::Result<Option<Arc<ServerSession>>> {
        let Some(id) = self.acquire_id() else {
            return Ok(None);
        };
        let connect_id = Uuid::new_v4().as_u128() as u64;
        match ServerSession::new(id, connect_id, stream, udp_endpoint) {
            Ok(session) => Ok(Some(session)),
            Err(err) => {
                self.release_id(id);
                Err(err)
            }
        }
    }

    /// Return a session's id to the pool. Final step of session teardown.
    pub fn release(&self, session: &ServerSession) {
        debug!(session = session.id(), "releasing session id");
        self.release_id(session.id());
    }

    /// Ids still available.
    pub fn available(&self) -> usize {
        self.free_ids.lock().map(|ids| ids.len()).unwrap_or(0)
    }

    fn acquire_id(&self) -> Option<SessionId> {
        self.free_ids.lock().map(|mut ids| ids.pop()).unwrap_or(None)
    }

    fn release_id(&self, id: SessionId) {
        if let Ok(mut ids) = self.free_ids.lock() {
            ids.push(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[tokio::test]
    async fn test_capacity_exhaustion_and_recycling() {
        let factory = SessionFactory::new(2);
        assert_eq!(factory.available(), 2);

        let (s1, _p1) = testutil::tcp_pair().await;
        let (s2, _p2) = testutil::tcp_pair().await;
        let (s3, _p3) = testutil::tcp_pair().await;

        let first = factory.create(s1, None).unwrap().unwrap();
        let second = factory.create(s2, None).unwrap().unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);

        // Exhausted: the factory returns nothing.
        assert!(factory.create(s3, None).unwrap().is_none());

        factory.release(&first);
        assert_eq!(factory.available(), 1);
        let (s4, _p4) = testutil::tcp_pair().await;
        let reused = factory.create(s4, None).unwrap().unwrap();
        assert_eq!(reused.id(), 1);
    }

    #[tokio::test]
    async fn test_fresh_connect_ids() {
        let factory = SessionFactory::new(4);
        let (s1, _p1) = testutil::tcp_pair().await;
        let (s2, _p2) = testutil::tcp_pair().await;
        let a = factory.create(s1, None).unwrap().unwrap();
        let b = factory.create(s2, None).unwrap().unwrap();
        assert_ne!(a.connect_id(), b.connect_id());
    }
}

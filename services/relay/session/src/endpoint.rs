//! The shared UDP endpoint: one bound socket, receive demux, relay counters.

use crate::error::ServerError;
use crate::preprocess::UdpPreProcessor;
use crate::server::ServerContext;
use crate::session::ServerSession;
use dashmap::DashMap;
use relay_wire::Packet;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Counters for the UDP plane.
#[derive(Debug, Default)]
pub struct UdpStats {
    received_count: AtomicU64,
    received_bytes: AtomicU64,
    relay_count: AtomicU64,
    relay_bytes: AtomicU64,
}

impl UdpStats {
    pub(crate) fn record_received(&self, len: usize) {
        self.received_count.fetch_add(1, Ordering::Relaxed);
        self.received_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_relay(&self, len: usize) {
        self.relay_count.fetch_add(1, Ordering::Relaxed);
        self.relay_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Datagrams received.
    pub fn received_count(&self) -> u64 {
        self.received_count.load(Ordering::Relaxed)
    }

    /// Bytes received.
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    /// Datagrams relayed between peers.
    pub fn relay_count(&self) -> u64 {
        self.relay_count.load(Ordering::Relaxed)
    }

    /// Bytes relayed between peers.
    pub fn relay_bytes(&self) -> u64 {
        self.relay_bytes.load(Ordering::Relaxed)
    }
}

/// Single OS-level UDP socket shared by every session.
///
/// Keeps the reverse index from punched endpoint to session so inbound
/// datagrams and relay senders can be attributed without touching the
/// registry.
#[derive(Debug)]
pub struct UdpEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    index: DashMap<SocketAddr, Arc<ServerSession>>,
    stats: UdpStats,
}

impl UdpEndpoint {
    /// Bind the endpoint socket. A failure here is fatal for server start.
    pub(crate) async fn bind(
        addr: SocketAddr,
        reuse_address: bool,
    ) -> Result<Arc<Self>, ServerError> {
        let socket = Self::bind_socket(addr, reuse_address)
            .await
            .map_err(|source| ServerError::BindFailed {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = socket.local_addr()?;
        if reuse_address {
            debug!("address reuse enabled on udp socket {local_addr}");
        }
        Ok(Arc::new(Self {
            socket,
            local_addr,
            index: DashMap::new(),
            stats: UdpStats::default(),
        }))
    }

    async fn bind_socket(addr: SocketAddr, reuse_address: bool) -> io::Result<UdpSocket> {
        if !reuse_address {
            return UdpSocket::bind(addr).await;
        }
        // SO_REUSEADDR has to be set before bind, which the runtime's own
        // bind cannot do.
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into())
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Index a session under its punched endpoint.
    pub(crate) fn add_session(&self, session: Arc<ServerSession>) {
        if let Some(endpoint) = session.udp().and_then(|udp| udp.punched_endpoint()) {
            debug!(session = session.id(), %endpoint, "udp session indexed");
            self.index.insert(endpoint, session);
        }
    }

    /// Drop a session from the reverse index.
    pub(crate) fn remove_session(&self, session: &ServerSession) {
        if let Some(endpoint) = session.udp().and_then(|udp| udp.punched_endpoint()) {
            self.index.remove(&endpoint);
        }
    }

    /// Resolve the session behind a remote endpoint, if any.
    pub fn try_get_session(&self, endpoint: &SocketAddr) -> Option<Arc<ServerSession>> {
        self.index.get(endpoint).map(|entry| entry.value().clone())
    }

    /// Non-suspending send used on the receive path.
    pub(crate) fn try_send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.try_send_to(data, target)
    }

    /// Awaitable send used by the per-session channels.
    pub(crate) async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, target).await
    }

    /// UDP plane counters.
    pub fn stats(&self) -> &UdpStats {
        &self.stats
    }

    /// Receive loop. Runs until shutdown; any single-datagram error is
    /// logged and the loop keeps receiving.
    pub(crate) async fn run(
        self: Arc<Self>,
        ctx: Arc<ServerContext>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        info!("udp endpoint listening on {}", self.local_addr);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,

                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, sender)) => {
                        self.stats.record_received(len);
                        self.handle_datagram(&ctx, &buf[..len], sender).await;
                    }
                    Err(err) => {
                        warn!("udp receive error: {err}");
                    }
                }
            }
        }

        debug!("udp receive loop stopped");
    }

    async fn handle_datagram(&self, ctx: &Arc<ServerContext>, data: &[u8], sender: SocketAddr) {
        let mut packet = match Packet::decode_datagram(&ctx.pool, data) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("dropping undecodable datagram from {sender}: {err}");
                return;
            }
        };

        // The preprocessor is synchronous: relays and rendezvous never
        // suspend the receive loop.
        if UdpPreProcessor::handle(ctx, self, &mut packet, sender) {
            return;
        }

        match self.try_get_session(&sender) {
            Some(session) => session.on_udp_packet(ctx, packet).await,
            None => debug!("dropping datagram from unknown endpoint {sender}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_with_reuse_address() {
        let endpoint = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), true)
            .await
            .unwrap();
        assert_ne!(endpoint.local_addr().port(), 0);

        // The socket is usable: a loopback datagram reaches it.
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(&[1], endpoint.local_addr()).await.unwrap();
        let mut buf = [0u8; 8];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            endpoint.socket.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(len, 1);
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_address() {
        let first = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), false)
            .await
            .unwrap();
        let taken = first.local_addr();

        let err = UdpEndpoint::bind(taken, false).await;
        assert!(matches!(err, Err(ServerError::BindFailed { .. })));
    }
}

//! Per-session TCP and UDP channels.

use crate::endpoint::UdpEndpoint;
use once_cell::sync::OnceCell;
use relay_wire::{Packet, SessionId};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Packet and byte counters owned by a channel.
#[derive(Debug, Default)]
pub struct ChannelStats {
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl ChannelStats {
    pub(crate) fn record_in(&self, len: usize) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_out(&self, len: usize) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Packets received on this channel.
    pub fn packets_in(&self) -> u64 {
        self.packets_in.load(Ordering::Relaxed)
    }

    /// Packets sent on this channel.
    pub fn packets_out(&self) -> u64 {
        self.packets_out.load(Ordering::Relaxed)
    }

    /// Bytes received on this channel.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Bytes sent on this channel.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

/// The session's TCP side: split stream, serialized writes, counters.
#[derive(Debug)]
pub struct TcpChannel {
    peer_addr: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    reader: StdMutex<Option<OwnedReadHalf>>,
    stats: ChannelStats,
}

impl TcpChannel {
    pub(crate) fn new(stream: TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            peer_addr,
            writer: Mutex::new(write_half),
            reader: StdMutex::new(Some(read_half)),
            stats: ChannelStats::default(),
        })
    }

    /// The read half, handed to the session's read loop exactly once.
    pub(crate) fn take_reader(&self) -> Option<OwnedReadHalf> {
        self.reader.lock().map(|mut reader| reader.take()).unwrap_or(None)
    }

    /// Send one packet; ownership of the packet ends here and its buffer
    /// returns to the pool.
    pub async fn send(&self, packet: Packet) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(packet.as_bytes()).await?;
        self.stats.record_out(packet.len());
        Ok(())
    }

    /// Flush and send FIN on the write side.
    pub(crate) async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Remote address of the connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Channel counters.
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }
}

/// The session's UDP side.
///
/// `punched_endpoint` is the externally observed address the client's
/// datagrams actually arrive from; it is set exactly once, during
/// rendezvous, and from then on the session is addressable on the UDP
/// plane.
#[derive(Debug)]
pub struct UdpChannel {
    session_id: SessionId,
    endpoint: Arc<UdpEndpoint>,
    local_endpoint: StdMutex<Option<SocketAddr>>,
    remote_endpoint: StdMutex<Option<SocketAddr>>,
    punched: OnceCell<SocketAddr>,
    last_seq: StdMutex<Option<u16>>,
    stats: ChannelStats,
}

impl UdpChannel {
    pub(crate) fn new(session_id: SessionId, endpoint: Arc<UdpEndpoint>) -> Self {
        Self {
            session_id,
            endpoint,
            local_endpoint: StdMutex::new(None),
            remote_endpoint: StdMutex::new(None),
            punched: OnceCell::new(),
            last_seq: StdMutex::new(None),
            stats: ChannelStats::default(),
        }
    }

    /// Record the punched endpoint. Returns true only on the first set.
    pub(crate) fn set_punched_endpoint(&self, addr: SocketAddr) -> bool {
        self.punched.set(addr).is_ok()
    }

    /// The authoritative reply address, once rendezvous completed.
    pub fn punched_endpoint(&self) -> Option<SocketAddr> {
        self.punched.get().copied()
    }

    /// The address the client claims on its own network.
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.local_endpoint.lock().map(|ep| *ep).unwrap_or(None)
    }

    pub(crate) fn set_local_endpoint(&self, addr: SocketAddr) {
        if let Ok(mut ep) = self.local_endpoint.lock() {
            *ep = Some(addr);
        }
    }

    /// The source address of the client's most recent rendezvous.
    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.remote_endpoint.lock().map(|ep| *ep).unwrap_or(None)
    }

    pub(crate) fn set_remote_endpoint(&self, addr: SocketAddr) {
        if let Ok(mut ep) = self.remote_endpoint.lock() {
            *ep = Some(addr);
        }
    }

    /// Send one packet to the punched endpoint.
    pub async fn send(&self, packet: Packet) -> io::Result<()> {
        let Some(target) = self.punched_endpoint() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "udp channel has no punched endpoint",
            ));
        };
        self.endpoint.send_to(packet.as_bytes(), target).await?;
        self.stats.record_out(packet.len());
        Ok(())
    }

    /// Sequenced-delivery filter: accept `seq` unless it is older than or
    /// equal to the last accepted sequence number.
    pub(crate) fn accept_sequenced(&self, seq: u16) -> bool {
        let Ok(mut last) = self.last_seq.lock() else {
            return true;
        };
        match *last {
            Some(prev) if !seq_newer(seq, prev) => false,
            _ => {
                *last = Some(seq);
                true
            }
        }
    }

    /// Session this channel belongs to.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Channel counters.
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }
}

/// Serial-number comparison over the u16 sequence space.
fn seq_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use relay_wire::HEADER_SIZE;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    #[test]
    fn test_seq_newer_wraps() {
        assert!(seq_newer(1, 0));
        assert!(!seq_newer(0, 1));
        assert!(!seq_newer(5, 5));
        // Wraparound: 2 is newer than 0xFFFE.
        assert!(seq_newer(2, 0xFFFE));
        assert!(!seq_newer(0xFFFE, 2));
    }

    #[tokio::test]
    async fn test_udp_channel_send_requires_punched_endpoint() {
        let ctx = testutil::udp_context().await;
        let (session, _peer) = testutil::udp_session(&ctx).await;
        let udp = session.udp().unwrap();

        let unsendable = ctx.pool.acquire();
        assert!(udp.send(unsendable).await.is_err());
        assert_eq!(ctx.pool.in_flight(), 0);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert!(udp.set_punched_endpoint(client.local_addr().unwrap()));
        // Second set is rejected; the first address stays authoritative.
        assert!(!udp.set_punched_endpoint("127.0.0.1:9".parse().unwrap()));

        let mut packet = ctx.pool.acquire();
        packet.set_payload(&[1, 2, 3]).unwrap();
        udp.send(packet).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(len, HEADER_SIZE + 3);
        assert_eq!(udp.stats().packets_out(), 1);
    }

    #[tokio::test]
    async fn test_sequenced_filter() {
        let ctx = testutil::udp_context().await;
        let (session, _peer) = testutil::udp_session(&ctx).await;
        let udp = session.udp().unwrap();

        assert!(udp.accept_sequenced(1));
        assert!(udp.accept_sequenced(5));
        assert!(!udp.accept_sequenced(5));
        assert!(!udp.accept_sequenced(3));
        assert!(udp.accept_sequenced(6));
    }
}

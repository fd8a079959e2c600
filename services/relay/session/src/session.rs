//! Per-connection session state and the TCP read/dispatch loop.
//!
//! A session owns its TCP channel (and a UDP channel when the UDP plane is
//! enabled), runs a framed read loop, and routes every received packet
//! through the TCP preprocessor before message dispatch. The update
//! scheduler calls [`ServerSession::update`] concurrently with the read
//! loop, so everything here is interior-mutable.

use crate::channel::{TcpChannel, UdpChannel};
use crate::endpoint::UdpEndpoint;
use crate::error::{Result, ServerError};
use crate::preprocess::TcpPreProcessor;
use crate::server::ServerContext;
use bytes::BytesMut;
use relay_wire::{
    DeliveryMethod, MessageKind, Packet, PacketDecoder, Property, RpcReader, RpcWriter, SessionId,
    ALIVE_PING,
};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

const READ_BUFFER_CAPACITY: usize = 16 * 1024;

/// Session lifecycle states
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet running
    Init = 0,
    /// Read loop running, events flowing
    Connected = 1,
    /// Close requested, flushing
    Closing = 2,
    /// Fully closed
    Closed = 3,
}

fn session_state_from(value: u8) -> SessionState {
    match value {
        0 => SessionState::Init,
        1 => SessionState::Connected,
        2 => SessionState::Closing,
        _ => SessionState::Closed,
    }
}

/// One connected client.
pub struct ServerSession {
    id: SessionId,
    connect_id: u64,
    state: AtomicU8,
    tcp: TcpChannel,
    udp: Option<UdpChannel>,
    last_activity: StdMutex<Instant>,
    last_ping: StdMutex<Instant>,
    close_notify: Notify,
}

impl ServerSession {
    pub(crate) fn new(
        id: SessionId,
        connect_id: u64,
        stream: TcpStream,
        udp_endpoint: Option<Arc<UdpEndpoint>>,
    ) -> io::Result<Arc<Self>> {
        let tcp = TcpChannel::new(stream)?;
        let udp = udp_endpoint.map(|endpoint| UdpChannel::new(id, endpoint));
        Ok(Arc::new(Self {
            id,
            connect_id,
            state: AtomicU8::new(SessionState::Init as u8),
            tcp,
            udp,
            last_activity: StdMutex::new(Instant::now()),
            last_ping: StdMutex::new(Instant::now()),
            close_notify: Notify::new(),
        }))
    }

    /// Session id (1..=max_session).
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The nonce binding UDP rendezvous to this TCP identity.
    pub fn connect_id(&self) -> u64 {
        self.connect_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        session_state_from(self.state.load(Ordering::Acquire))
    }

    /// Remote TCP address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.tcp.peer_addr()
    }

    /// The session's TCP channel.
    pub fn tcp(&self) -> &TcpChannel {
        &self.tcp
    }

    /// The session's UDP channel, when the UDP plane is enabled.
    pub fn udp(&self) -> Option<&UdpChannel> {
        self.udp.as_ref()
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn touch(&self) {
        if let Ok(mut at) = self.last_activity.lock() {
            *at = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    fn since_last_ping(&self) -> Duration {
        self.last_ping
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    fn mark_ping(&self) {
        if let Ok(mut at) = self.last_ping.lock() {
            *at = Instant::now();
        }
    }

    /// Drive the session to completion: connected event, read loop, close,
    /// cleanup. The session id returns to the factory in the final step no
    /// matter how the read loop ended.
    pub(crate) async fn run(self: Arc<Self>, ctx: Arc<ServerContext>) {
        self.set_state(SessionState::Connected);
        info!(session = self.id, peer = %self.tcp.peer_addr(), "session connected");
        ctx.handler.on_session_connected(&self).await;

        let result = match self.tcp.take_reader() {
            Some(reader) => Self::read_loop(&self, &ctx, reader).await,
            None => Err(ServerError::Fatal("tcp reader already taken".into())),
        };

        if let Err(err) = result {
            // A failure after close() was requested is just teardown noise.
            if !matches!(self.state(), SessionState::Closing | SessionState::Closed) {
                warn!(session = self.id, "session errored: {err}");
                ctx.handler.on_session_errored(&self, &err);
            }
        }

        self.close().await;

        // The closed hook fires before the registry removal: once the
        // registry drains during server stop, no callbacks are pending.
        ctx.p2p.on_session_closed(self.id);
        ctx.handler.on_session_closed(&self).await;
        info!(session = self.id, "session closed");

        ctx.registry.remove(self.id);
        if let Some(endpoint) = &ctx.udp {
            endpoint.remove_session(&self);
        }
        ctx.factory.release(&self);
    }

    async fn read_loop(
        session: &Arc<Self>,
        ctx: &Arc<ServerContext>,
        mut reader: OwnedReadHalf,
    ) -> Result<()> {
        let mut decoder = PacketDecoder::new(ctx.config.max_payload_size);
        let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);

        loop {
            while let Some(packet) = decoder.decode(&mut buf, &ctx.pool)? {
                session.touch();
                session.tcp.stats().record_in(packet.len());
                Self::handle_packet(session, ctx, packet).await?;
            }

            tokio::select! {
                _ = session.close_notify.notified() => return Ok(()),

                read = reader.read_buf(&mut buf) => {
                    if read? == 0 {
                        debug!(session = session.id, "peer closed connection");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_packet(
        session: &Arc<Self>,
        ctx: &Arc<ServerContext>,
        packet: Packet,
    ) -> Result<()> {
        if TcpPreProcessor::handle(session, ctx, &packet).await {
            return Ok(());
        }
        Self::dispatch(session, ctx, packet).await
    }

    /// Decode the message envelope and hand it to the RPC chain or the
    /// user-level hooks. Requests always get a response frame back, carrying
    /// whatever the consuming handler wrote.
    async fn dispatch(session: &Arc<Self>, ctx: &Arc<ServerContext>, packet: Packet) -> Result<()> {
        let mut reader = RpcReader::new(packet.payload());
        let kind = MessageKind::try_from(reader.read_u8()?)?;

        match kind {
            MessageKind::OneWay => {
                ctx.handler.on_session_received(session, &mut reader).await;
            }

            MessageKind::Request => {
                let request_id = reader.read_u32()?;
                let mut writer = RpcWriter::new();

                let handled = ctx
                    .dispatcher
                    .dispatch(session, &mut reader, &mut writer)
                    .await?;
                if !handled {
                    ctx.handler
                        .on_session_request_received(session, &mut reader, &mut writer)
                        .await;
                }

                let mut body = RpcWriter::new();
                body.write_u8(MessageKind::Response as u8);
                body.write_u32(request_id);
                body.write_bytes(writer.as_slice());

                let mut response = ctx.pool.acquire();
                response.set_property(Property::UserData);
                response.set_delivery(DeliveryMethod::Reliable);
                response.set_payload(body.as_slice())?;
                session.tcp.send(response).await?;
            }

            MessageKind::Response => {
                trace!(session = session.id, "unexpected response message ignored");
            }
        }

        Ok(())
    }

    /// Scheduler tick: keepalive and idle timers. No-ops unless the session
    /// is connected, so a trailing tick after close is harmless.
    pub(crate) async fn update(&self, ctx: &ServerContext, elapsed: Duration) -> Result<()> {
        if self.state() != SessionState::Connected {
            return Ok(());
        }
        trace!(
            session = self.id,
            elapsed_ms = elapsed.as_millis() as u64,
            "session update"
        );

        let idle = self.idle_for();
        if idle >= ctx.config.idle_timeout {
            info!(
                session = self.id,
                idle_ms = idle.as_millis() as u64,
                "closing idle session"
            );
            self.close().await;
            return Ok(());
        }

        if idle >= ctx.config.ping_interval && self.since_last_ping() >= ctx.config.ping_interval {
            self.mark_ping();
            let mut ping = ctx.pool.acquire();
            ping.set_property(Property::AliveCheck);
            ping.set_delivery(DeliveryMethod::Reliable);
            ping.set_payload(&[ALIVE_PING])?;
            self.tcp.send(ping).await?;
            trace!(session = self.id, "keepalive ping sent");
        }

        Ok(())
    }

    /// Close the session: wake the read loop, flush, and shut the stream
    /// down. Safe to call repeatedly and from any task.
    pub async fn close(&self) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= SessionState::Closing as u8 {
                return;
            }
            match self.state.compare_exchange(
                current,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.close_notify.notify_one();
        self.tcp.shutdown().await;
        self.set_state(SessionState::Closed);
    }

    /// A datagram addressed to this session (not consumed by the UDP
    /// preprocessor).
    pub(crate) async fn on_udp_packet(self: Arc<Self>, ctx: &Arc<ServerContext>, packet: Packet) {
        if matches!(self.state(), SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.touch();
        let Some(udp) = self.udp() else {
            return;
        };
        udp.stats().record_in(packet.len());

        if packet.delivery() == DeliveryMethod::UnreliableSequenced
            && !udp.accept_sequenced(packet.seq())
        {
            trace!(
                session = self.id,
                seq = packet.seq(),
                "stale sequenced datagram dropped"
            );
            return;
        }

        match packet.property() {
            Property::UserData | Property::ViewRequest => {
                let mut reader = RpcReader::new(packet.payload());
                ctx.handler.on_session_received(&self, &mut reader).await;
            }
            Property::Ack => {
                trace!(session = self.id, "ack left to the reliability layer");
            }
            other => {
                debug!(session = self.id, property = ?other, "unexpected udp property ignored");
            }
        }
    }
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("peer", &self.tcp.peer_addr())
            .finish()
    }
}

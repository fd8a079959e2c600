//! Session server core: TCP sessions, UDP relay plane, NAT rendezvous,
//! RPC dispatch.
//!
//! This crate implements a multiplayer session server. Clients hold a
//! long-lived TCP connection; an optional parallel UDP plane carries
//! latency-sensitive traffic, relays datagrams between peers that cannot
//! punch through NAT, and binds each client's external UDP address to its
//! TCP-established identity through a nonce-checked rendezvous.
//!
//! ## Features
//!
//! - **Session lifecycle**: bounded registry, id-recycling factory, framed
//!   per-session read loops, at-most-once connect/close events
//! - **Keepalive**: client ping/server pong interception plus server-side
//!   idle timers driven by a periodic update sweep
//! - **UDP relay**: sender-identity rewrite and forward between punched
//!   endpoints, with atomic plane counters
//! - **Rendezvous**: `RequestConnection`/`ResponseConnection` handshake
//!   gated on the per-session `ConnectId` nonce
//! - **RPC dispatch**: ordered service chain with position restore and
//!   fall-through to the embedder's request hook
//!
//! ## Example
//!
//! ```rust,no_run
//! use relay_session::{NoopHandler, ServerConfig, SessionServer};
//! use std::sync::Arc;
//!
//! # async fn example() -> relay_session::Result<()> {
//! let config = ServerConfig {
//!     service_udp: true,
//!     ..ServerConfig::default()
//! };
//! let server = SessionServer::new(config, Arc::new(NoopHandler));
//! server.start().await?;
//! // ... serve ...
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod factory;
mod listener;
pub mod p2p;
mod preprocess;
pub mod registry;
pub mod rpc;
mod scheduler;
pub mod server;
pub mod session;

pub use channel::{ChannelStats, TcpChannel, UdpChannel};
pub use config::ServerConfig;
pub use endpoint::{UdpEndpoint, UdpStats};
pub use error::{Result, ServerError};
pub use events::{NoopHandler, ServerHandler};
pub use factory::SessionFactory;
pub use p2p::P2pManager;
pub use registry::SessionRegistry;
pub use rpc::RpcService;
pub use server::{ServerState, SessionServer};
pub use session::{ServerSession, SessionState};

// The wire types embedders touch directly.
pub use relay_wire::{
    DeliveryMethod, MessageKind, Packet, PacketPool, Property, RpcReader, RpcWriter, SessionId,
    SERVER_SESSION_ID,
};

#[cfg(test)]
pub(crate) mod testutil {
    use crate::config::ServerConfig;
    use crate::endpoint::UdpEndpoint;
    use crate::events::{NoopHandler, ServerHandler};
    use crate::factory::SessionFactory;
    use crate::p2p::P2pManager;
    use crate::registry::SessionRegistry;
    use crate::rpc::RpcDispatcher;
    use crate::server::ServerContext;
    use crate::session::ServerSession;
    use relay_wire::PacketPool;
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};

    /// A connected (accepted, client) stream pair on loopback.
    pub(crate) async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accepted, client) = tokio::join!(listener.accept(), connect);
        (accepted.unwrap().0, client.unwrap())
    }

    pub(crate) async fn context_with(
        handler: Arc<dyn ServerHandler>,
        with_udp: bool,
    ) -> Arc<ServerContext> {
        let config = ServerConfig {
            service_udp: with_udp,
            ..ServerConfig::default()
        };
        let udp = if with_udp {
            Some(
                UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), false)
                    .await
                    .unwrap(),
            )
        } else {
            None
        };
        Arc::new(ServerContext {
            config: config.clone(),
            handler,
            registry: SessionRegistry::new(config.max_session),
            factory: SessionFactory::new(config.max_session),
            p2p: P2pManager::new(),
            pool: PacketPool::new(config.max_payload_size),
            dispatcher: RpcDispatcher::new(Vec::new()),
            udp,
        })
    }

    pub(crate) async fn context() -> Arc<ServerContext> {
        context_with(Arc::new(NoopHandler), false).await
    }

    pub(crate) async fn udp_context() -> Arc<ServerContext> {
        context_with(Arc::new(NoopHandler), true).await
    }

    /// A registered session wired to the context's UDP endpoint. The client
    /// end of the TCP pair is returned so the caller keeps it alive.
    pub(crate) async fn udp_session(
        ctx: &Arc<ServerContext>,
    ) -> (Arc<ServerSession>, TcpStream) {
        let (server_stream, client_stream) = tcp_pair().await;
        let session = ctx
            .factory
            .create(server_stream, ctx.udp.clone())
            .unwrap()
            .unwrap();
        ctx.registry.insert(session.clone()).unwrap();
        (session, client_stream)
    }
}

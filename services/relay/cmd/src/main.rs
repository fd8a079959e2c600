//! Relay session server binary.
//!
//! Runs a session server with the TCP plane always on and the UDP
//! relay/rendezvous plane enabled via configuration or `--udp-listen`.

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use relay_session::{
    RpcReader, RpcWriter, ServerError, ServerHandler, ServerSession, SessionServer,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

/// Multiplayer session server with UDP relay and NAT rendezvous
#[derive(Parser, Debug)]
#[command(name = "relayd", version, about = "Multiplayer session server with UDP relay and NAT rendezvous")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// TCP listen address, e.g. 0.0.0.0:9000
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// UDP listen address, e.g. 0.0.0.0:9001 (enables the UDP plane)
    #[arg(long)]
    udp_listen: Option<SocketAddr>,

    /// Maximum number of concurrent sessions
    #[arg(long)]
    max_session: Option<u16>,

    /// Session update interval, e.g. 20ms
    #[arg(long)]
    update_interval: Option<humantime::Duration>,

    /// Idle timeout before a session is closed, e.g. 30s
    #[arg(long)]
    idle_timeout: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error); defaults to
    /// RELAY_LOG_LEVEL or "info"
    #[arg(long)]
    log_level: Option<String>,
}

/// Default daemon behavior: log traffic, echo unhandled requests.
struct LoggingHandler;

#[async_trait]
impl ServerHandler for LoggingHandler {
    async fn on_session_connected(&self, session: &Arc<ServerSession>) {
        info!(
            session = session.id(),
            peer = %session.peer_addr(),
            "client connected"
        );
    }

    async fn on_session_closed(&self, session: &Arc<ServerSession>) {
        info!(session = session.id(), "client disconnected");
    }

    async fn on_session_received(&self, session: &Arc<ServerSession>, reader: &mut RpcReader<'_>) {
        debug!(
            session = session.id(),
            bytes = reader.remaining(),
            "message received"
        );
    }

    async fn on_session_request_received(
        &self,
        session: &Arc<ServerSession>,
        reader: &mut RpcReader<'_>,
        writer: &mut RpcWriter,
    ) {
        let body = reader.read_remaining();
        debug!(
            session = session.id(),
            bytes = body.len(),
            "unhandled request echoed"
        );
        writer.write_bytes(body);
    }

    fn on_session_errored(&self, session: &Arc<ServerSession>, error: &ServerError) {
        warn!(session = session.id(), "session error: {error}");
    }

    fn on_errored(&self, error: &ServerError) {
        warn!("server error: {error}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args
        .log_level
        .clone()
        .or_else(|| std::env::var("RELAY_LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = config::load_config(args.config.as_ref())?;
    if let Some(listen) = args.listen {
        config.tcp_address = listen.ip();
        config.tcp_port = listen.port();
    }
    if let Some(udp_listen) = args.udp_listen {
        config.service_udp = true;
        config.udp_address = udp_listen.ip();
        config.udp_port = udp_listen.port();
    }
    if let Some(max_session) = args.max_session {
        config.max_session = max_session;
    }
    if let Some(interval) = args.update_interval {
        config.session_update_interval = interval.into();
    }
    if let Some(idle) = args.idle_timeout {
        config.idle_timeout = idle.into();
    }

    let server = SessionServer::new(config, Arc::new(LoggingHandler));
    server.start().await?;
    info!("relayd running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    server.stop().await?;

    Ok(())
}

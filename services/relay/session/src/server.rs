//! Server assembly: state machine, lifecycle orchestration, shared context.

use crate::config::ServerConfig;
use crate::endpoint::UdpEndpoint;
use crate::error::{Result, ServerError};
use crate::events::ServerHandler;
use crate::factory::SessionFactory;
use crate::listener::Listener;
use crate::p2p::P2pManager;
use crate::registry::SessionRegistry;
use crate::rpc::{check_duplicate, RpcDispatcher, RpcService};
use crate::scheduler::UpdateScheduler;
use crate::session::ServerSession;
use relay_wire::{PacketPool, SessionId};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Server lifecycle states
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, never started
    None = 0,
    /// Start in progress (or failed partway; build a new server to retry)
    Starting = 1,
    /// Accepting and serving
    Started = 2,
    /// Stop in progress
    Stopping = 3,
    /// Fully stopped
    Stopped = 4,
}

fn server_state_from(value: u8) -> ServerState {
    match value {
        0 => ServerState::None,
        1 => ServerState::Starting,
        2 => ServerState::Started,
        3 => ServerState::Stopping,
        _ => ServerState::Stopped,
    }
}

/// Everything the per-session tasks and background loops share.
pub(crate) struct ServerContext {
    pub(crate) config: ServerConfig,
    pub(crate) handler: Arc<dyn ServerHandler>,
    pub(crate) registry: SessionRegistry,
    pub(crate) factory: SessionFactory,
    pub(crate) p2p: P2pManager,
    pub(crate) pool: PacketPool,
    pub(crate) dispatcher: RpcDispatcher,
    pub(crate) udp: Option<Arc<UdpEndpoint>>,
}

struct UdpTask {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

struct ServerRuntime {
    ctx: Arc<ServerContext>,
    listener: Listener,
    scheduler: UpdateScheduler,
    udp_task: Option<UdpTask>,
}

/// The session server.
///
/// Owns the listener, the optional UDP plane, the update scheduler, and the
/// session population. Event hooks are fixed at construction; RPC services
/// are registered while the server is down and frozen into the dispatch
/// chain at start.
pub struct SessionServer {
    config: ServerConfig,
    handler: Arc<dyn ServerHandler>,
    state: AtomicU8,
    services: Mutex<Vec<Arc<dyn RpcService>>>,
    runtime: Mutex<Option<ServerRuntime>>,
}

impl SessionServer {
    /// Create a server with the given configuration and event handler.
    pub fn new(config: ServerConfig, handler: Arc<dyn ServerHandler>) -> Self {
        Self {
            config,
            handler,
            state: AtomicU8::new(ServerState::None as u8),
            services: Mutex::new(Vec::new()),
            runtime: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        server_state_from(self.state.load(Ordering::Acquire))
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Register an RPC service. Only permitted while the server is down;
    /// registering the same instance twice is rejected.
    pub fn add_rpc_service(&self, service: Arc<dyn RpcService>) -> Result<()> {
        let state = self.state();
        if !matches!(state, ServerState::None | ServerState::Stopped) {
            return Err(ServerError::ConfigInvalid(format!(
                "rpc services can only be registered while the server is down (state {state:?})"
            )));
        }
        let mut services = self
            .services
            .lock()
            .map_err(|_| ServerError::Fatal("rpc service list poisoned".into()))?;
        check_duplicate(&services, &service)?;
        info!(service = service.name(), "rpc service registered");
        services.push(service);
        Ok(())
    }

    /// Bind the transports and bring the server to `Started`.
    ///
    /// On failure the server stays in `Starting`; build a new server to
    /// retry.
    pub async fn start(&self) -> Result<()> {
        self.transition(
            &[ServerState::None, ServerState::Stopped],
            ServerState::Starting,
        )?;

        if self.config.max_session == 0 {
            return Err(ServerError::ConfigInvalid(
                "max_session must be at least 1".into(),
            ));
        }
        let interval = self.config.session_update_interval;
        if self.config.service_udp && interval > Duration::from_millis(100) {
            warn!(
                interval_ms = interval.as_millis() as u64,
                "session update interval above 100ms with udp enabled; 30ms or less is recommended"
            );
        }
        if !self.config.service_udp && interval < Duration::from_secs(1) {
            info!(
                interval_ms = interval.as_millis() as u64,
                "tcp-only servers are fine with a 1s or slower update interval"
            );
        }

        let services = self
            .services
            .lock()
            .map_err(|_| ServerError::Fatal("rpc service list poisoned".into()))?
            .clone();

        let udp = if self.config.service_udp {
            Some(UdpEndpoint::bind(self.config.udp_listen_addr(), self.config.udp_reuse_address).await?)
        } else {
            None
        };

        let ctx = Arc::new(ServerContext {
            config: self.config.clone(),
            handler: self.handler.clone(),
            registry: SessionRegistry::new(self.config.max_session),
            factory: SessionFactory::new(self.config.max_session),
            p2p: P2pManager::new(),
            pool: PacketPool::new(self.config.max_payload_size),
            dispatcher: RpcDispatcher::new(services),
            udp: udp.clone(),
        });

        let udp_task = udp.map(|endpoint| {
            let (shutdown, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(endpoint.run(ctx.clone(), shutdown_rx));
            UdpTask { handle, shutdown }
        });

        let listener = match Listener::start(self.config.tcp_listen_addr(), ctx.clone()).await {
            Ok(listener) => listener,
            Err(err) => {
                if let Some(task) = &udp_task {
                    task.handle.abort();
                }
                return Err(err);
            }
        };

        let scheduler = UpdateScheduler::spawn(ctx.clone());

        if let Ok(mut runtime) = self.runtime.lock() {
            *runtime = Some(ServerRuntime {
                ctx,
                listener,
                scheduler,
                udp_task,
            });
        }
        self.set_state(ServerState::Started);
        info!(name = %self.config.name, "server started");
        Ok(())
    }

    /// Graceful shutdown. Requires `Started`.
    ///
    /// Order: stop the listener, close and drain every session, join the
    /// update scheduler, close the UDP endpoint, clear P2P state. After this
    /// returns no further hooks fire.
    pub async fn stop(&self) -> Result<()> {
        self.transition(&[ServerState::Started], ServerState::Stopping)?;

        let runtime = self
            .runtime
            .lock()
            .map_err(|_| ServerError::Fatal("server runtime poisoned".into()))?
            .take();
        let Some(runtime) = runtime else {
            self.set_state(ServerState::Stopped);
            return Ok(());
        };

        runtime.listener.stop().await;

        for session in runtime.ctx.registry.snapshot() {
            session.close().await;
        }
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while runtime.ctx.registry.count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        let remaining = runtime.ctx.registry.count();
        if remaining > 0 {
            warn!(remaining, "sessions still draining at stop timeout");
        }

        runtime.scheduler.stop().await;

        if let Some(task) = runtime.udp_task {
            let _ = task.shutdown.send(true);
            let _ = task.handle.await;
        }

        runtime.ctx.p2p.clear();

        self.set_state(ServerState::Stopped);
        info!(name = %self.config.name, "server stopped");
        Ok(())
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.with_runtime(|rt| rt.ctx.registry.count()).unwrap_or(0)
    }

    /// Look up a live session by id.
    pub fn find_session(&self, id: SessionId) -> Option<Arc<ServerSession>> {
        self.with_runtime(|rt| rt.ctx.registry.find(id)).flatten()
    }

    /// Address the TCP listener is bound to, while started.
    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        self.with_runtime(|rt| rt.listener.local_addr())
    }

    /// The UDP endpoint, while started with the UDP plane enabled.
    pub fn udp_endpoint(&self) -> Option<Arc<UdpEndpoint>> {
        self.with_runtime(|rt| rt.ctx.udp.clone()).flatten()
    }

    fn with_runtime<T>(&self, f: impl FnOnce(&ServerRuntime) -> T) -> Option<T> {
        self.runtime
            .lock()
            .ok()
            .and_then(|runtime| runtime.as_ref().map(f))
    }

    fn set_state(&self, state: ServerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: &[ServerState], to: ServerState) -> Result<()> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !from.iter().any(|state| *state as u8 == current) {
                return Err(ServerError::ConfigInvalid(format!(
                    "operation requires state {:?}, server is {:?}",
                    from,
                    server_state_from(current)
                )));
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Drop for SessionServer {
    fn drop(&mut self) {
        // Explicit async shutdown is the supported path; dropping a running
        // server can only abort its tasks.
        if matches!(self.state(), ServerState::Started | ServerState::Stopping) {
            error!(name = %self.config.name, "server dropped while running; aborting background tasks");
            if let Ok(mut runtime) = self.runtime.lock() {
                if let Some(runtime) = runtime.take() {
                    runtime.listener.abort();
                    runtime.scheduler.abort();
                    if let Some(task) = runtime.udp_task {
                        task.handle.abort();
                    }
                }
            }
        }
    }
}

//! TCP listener and accept loop.

use crate::error::ServerError;
use crate::server::ServerContext;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Accepts inbound connections and hands each socket to the factory.
pub(crate) struct Listener {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl Listener {
    /// Bind and start accepting. A bind failure is fatal for server start.
    pub(crate) async fn start(
        addr: SocketAddr,
        ctx: Arc<ServerContext>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::BindFailed {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!("tcp listener bound on {local_addr}");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Self::accept_loop(listener, ctx, shutdown_rx));
        Ok(Self {
            local_addr,
            handle,
            shutdown,
        })
    }

    /// Address the listener is bound to.
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_loop(
        listener: TcpListener,
        ctx: Arc<ServerContext>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => Self::on_accept(&ctx, stream, peer),
                    Err(err) => warn!("accept error: {err}"),
                }
            }
        }
        // The listening socket closes when the loop drops it.
        debug!("accept loop stopped");
    }

    fn on_accept(ctx: &Arc<ServerContext>, stream: TcpStream, peer: SocketAddr) {
        debug!(%peer, "tcp connection accepted");
        match ctx.factory.create(stream, ctx.udp.clone()) {
            Ok(Some(session)) => {
                if let Err(err) = ctx.registry.insert(session.clone()) {
                    ctx.handler.on_errored(&err);
                    ctx.factory.release(&session);
                    return;
                }
                tokio::spawn(session.run(ctx.clone()));
            }
            Ok(None) => {
                // Capacity reached: the socket drops, no session events
                // fire, and the listener keeps accepting.
                warn!(%peer, "session capacity reached; connection rejected");
            }
            Err(err) => ctx.handler.on_errored(&ServerError::SessionIo(err)),
        }
    }

    /// Stop accepting and close the listening socket.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }

    /// Best-effort abort, for drop-while-running.
    pub(crate) fn abort(&self) {
        self.handle.abort();
    }
}

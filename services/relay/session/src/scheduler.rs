//! Periodic session update sweep.

use crate::server::ServerContext;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Dedicated worker ticking `update(elapsed)` on every live session.
pub(crate) struct UpdateScheduler {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl UpdateScheduler {
    pub(crate) fn spawn(ctx: Arc<ServerContext>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Self::run(ctx, shutdown_rx));
        Self { handle, shutdown }
    }

    async fn run(ctx: Arc<ServerContext>, mut shutdown: watch::Receiver<bool>) {
        let interval = ctx.config.session_update_interval;
        debug!(
            interval_ms = interval.as_millis() as u64,
            "update scheduler started"
        );
        let mut last_tick = Instant::now();

        loop {
            let tick_start = Instant::now();
            let elapsed = tick_start.duration_since(last_tick);
            last_tick = tick_start;

            // Snapshot semantics: a session removed mid-sweep sees at most
            // one trailing tick, which it no-ops.
            for session in ctx.registry.snapshot() {
                if let Err(err) = session.update(&ctx, elapsed).await {
                    ctx.handler.on_session_errored(&session, &err);
                }
            }

            // Sleep whatever is left of the interval; an overrunning sweep
            // starts the next one immediately.
            let sweep = tick_start.elapsed();
            let sleep_for = interval.saturating_sub(sweep).min(interval);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        debug!("update scheduler stopped");
    }

    /// Signal the worker and wait for it to exit.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }

    /// Best-effort abort, for drop-while-running.
    pub(crate) fn abort(&self) {
        self.handle.abort();
    }
}

//! RPC service chain.

use crate::error::{Result, ServerError};
use crate::session::ServerSession;
use async_trait::async_trait;
use relay_wire::{RpcReader, RpcWriter};
use std::sync::Arc;
use tracing::trace;

/// A generated or hand-written RPC service.
///
/// `dispatch` returns `Ok(true)` when the service consumed the request. A
/// service that returns `Ok(false)` must not rely on reader/writer state:
/// the dispatcher restores both before offering the request to the next
/// service.
#[async_trait]
pub trait RpcService: Send + Sync {
    /// Service name for logs and diagnostics.
    fn name(&self) -> &str;

    /// Offer a request to this service.
    async fn dispatch(
        &self,
        session: &Arc<ServerSession>,
        reader: &mut RpcReader<'_>,
        writer: &mut RpcWriter,
    ) -> Result<bool>;
}

/// Ordered chain of RPC services with fall-through to the user handler.
#[derive(Default)]
pub(crate) struct RpcDispatcher {
    services: Vec<Arc<dyn RpcService>>,
}

impl RpcDispatcher {
    pub(crate) fn new(services: Vec<Arc<dyn RpcService>>) -> Self {
        Self { services }
    }

    /// Offer `(reader, writer)` to each service in registration order.
    ///
    /// Positions are snapshotted up front and restored after every service
    /// that does not consume, so the fall-through path sees the request
    /// exactly as it arrived.
    pub(crate) async fn dispatch(
        &self,
        session: &Arc<ServerSession>,
        reader: &mut RpcReader<'_>,
        writer: &mut RpcWriter,
    ) -> Result<bool> {
        let reader_mark = reader.position();
        let writer_mark = writer.len();

        for service in &self.services {
            if service.dispatch(session, reader, writer).await? {
                trace!(service = service.name(), "rpc request handled");
                return Ok(true);
            }
            reader.set_position(reader_mark);
            writer.truncate(writer_mark);
        }

        Ok(false)
    }
}

/// Reject duplicate registration of the same service instance.
pub(crate) fn check_duplicate(
    services: &[Arc<dyn RpcService>],
    candidate: &Arc<dyn RpcService>,
) -> Result<()> {
    if services.iter().any(|svc| Arc::ptr_eq(svc, candidate)) {
        return Err(ServerError::ConfigInvalid(format!(
            "rpc service {:?} registered twice",
            candidate.name()
        )));
    }
    Ok(())
}

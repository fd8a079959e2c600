//! Embedder-facing event hooks.

use crate::error::ServerError;
use crate::session::ServerSession;
use async_trait::async_trait;
use relay_wire::{RpcReader, RpcWriter};
use std::sync::Arc;

/// Hooks invoked by the server as sessions come and go and traffic arrives.
///
/// The handler is fixed at server construction, so dispatch never has to
/// synchronize against callback mutation. Every method has a no-op default;
/// embedders override what they need.
#[async_trait]
pub trait ServerHandler: Send + Sync {
    /// A session finished connecting. Fires exactly once per session, before
    /// any received-message hook for that session.
    async fn on_session_connected(&self, _session: &Arc<ServerSession>) {}

    /// A session closed. Fires exactly once per session, after all of its
    /// received-message hooks.
    async fn on_session_closed(&self, _session: &Arc<ServerSession>) {}

    /// A one-way message arrived for this session.
    async fn on_session_received(&self, _session: &Arc<ServerSession>, _reader: &mut RpcReader<'_>) {
    }

    /// A request arrived that no registered RPC service consumed. Whatever
    /// is in `writer` afterwards is sent back as the response body.
    async fn on_session_request_received(
        &self,
        _session: &Arc<ServerSession>,
        _reader: &mut RpcReader<'_>,
        _writer: &mut RpcWriter,
    ) {
    }

    /// A session hit an error; the session is closed right after.
    fn on_session_errored(&self, _session: &Arc<ServerSession>, _error: &ServerError) {}

    /// A server-level error not tied to one session.
    fn on_errored(&self, _error: &ServerError) {}
}

/// Handler that ignores every event.
#[derive(Debug, Default)]
pub struct NoopHandler;

#[async_trait]
impl ServerHandler for NoopHandler {}

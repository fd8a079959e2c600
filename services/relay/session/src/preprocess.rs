//! Receive-path preprocessors.
//!
//! Both planes intercept control packets before normal dispatch. The TCP
//! preprocessor runs inside the owning session's read loop; the UDP
//! preprocessor runs on the shared receive loop and is synchronous by
//! contract so one datagram can never stall the plane.

use crate::endpoint::UdpEndpoint;
use crate::error::Result;
use crate::server::ServerContext;
use crate::session::ServerSession;
use relay_wire::{
    DeliveryMethod, Packet, Property, RpcReader, ALIVE_PING, ALIVE_PONG, SERVER_SESSION_ID,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace};

/// Control-packet interception on the TCP plane.
pub(crate) struct TcpPreProcessor;

impl TcpPreProcessor {
    /// Returns true when the packet was consumed. Errors surface through
    /// `on_errored` and still consume the packet, so dispatch cannot run
    /// twice for the same frame.
    pub(crate) async fn handle(
        session: &Arc<ServerSession>,
        ctx: &Arc<ServerContext>,
        packet: &Packet,
    ) -> bool {
        match Self::process(session, ctx, packet).await {
            Ok(consumed) => consumed,
            Err(err) => {
                ctx.handler.on_errored(&err);
                true
            }
        }
    }

    async fn process(
        session: &Arc<ServerSession>,
        ctx: &Arc<ServerContext>,
        packet: &Packet,
    ) -> Result<bool> {
        match packet.property() {
            Property::AliveCheck => {
                if packet.payload().first() == Some(&ALIVE_PING) {
                    let mut pong = ctx.pool.acquire();
                    pong.set_property(Property::AliveCheck);
                    pong.set_delivery(DeliveryMethod::Reliable);
                    pong.set_payload(&[ALIVE_PONG])?;
                    session.tcp().send(pong).await?;
                    trace!(session = session.id(), "keepalive pong sent");
                }
                // Pongs and anything else are consumed without a reply.
                Ok(true)
            }

            Property::JoinP2p => {
                ctx.p2p.join(packet.p2p_session_id(), session.id());
                Ok(true)
            }

            Property::LeaveP2p => {
                ctx.p2p.leave(packet.p2p_session_id(), session.id());
                Ok(true)
            }

            _ => Ok(false),
        }
    }
}

/// Relay, rendezvous, and connection handling on the UDP plane.
pub(crate) struct UdpPreProcessor;

impl UdpPreProcessor {
    /// Returns true when the datagram was consumed.
    pub(crate) fn handle(
        ctx: &Arc<ServerContext>,
        endpoint: &UdpEndpoint,
        packet: &mut Packet,
        sender: SocketAddr,
    ) -> bool {
        match packet.property() {
            Property::UserData | Property::Ack | Property::ViewRequest => {
                Self::relay(ctx, endpoint, packet, sender)
            }
            Property::RequestConnection => {
                Self::rendezvous(ctx, endpoint, packet, sender);
                true
            }
            // Handled client-side; nothing for the server to do.
            Property::ResponseConnection => true,
            _ => false,
        }
    }

    fn relay(
        ctx: &Arc<ServerContext>,
        endpoint: &UdpEndpoint,
        packet: &mut Packet,
        sender: SocketAddr,
    ) -> bool {
        let target = packet.p2p_session_id();
        if target == SERVER_SESSION_ID {
            // Server-addressed; the owning session's channel takes it.
            return false;
        }

        let Some(target_session) = ctx.registry.find(target) else {
            trace!(target, "relay target not found; datagram dropped");
            return true;
        };
        let Some(target_endpoint) = target_session
            .udp()
            .and_then(|udp| udp.punched_endpoint())
        else {
            trace!(target, "relay target has no punched endpoint; datagram dropped");
            return true;
        };
        let Some(sender_session) = endpoint.try_get_session(&sender) else {
            trace!(%sender, "relay from unknown endpoint; datagram dropped");
            return true;
        };

        // Rewrite in place: recipients see the true origin, not the target
        // field they were addressed by.
        packet.set_p2p_session_id(sender_session.id());

        match endpoint.try_send_to(packet.as_bytes(), target_endpoint) {
            Ok(sent) => {
                endpoint.stats().record_relay(sent);
                trace!(from = sender_session.id(), to = target, "datagram relayed");
            }
            Err(err) => {
                // Best-effort plane: failed sends are not counted.
                debug!(from = sender_session.id(), to = target, "relay send failed: {err}");
            }
        }
        true
    }

    fn rendezvous(
        ctx: &Arc<ServerContext>,
        endpoint: &UdpEndpoint,
        packet: &Packet,
        sender: SocketAddr,
    ) {
        let sid = packet.session_id_for_connection();
        let mut reader = RpcReader::new(packet.payload());
        let parsed = reader.read_u64().and_then(|connect_id| {
            reader
                .read_socket_addr()
                .map(|local_endpoint| (connect_id, local_endpoint))
        });
        let Ok((connect_id, local_endpoint)) = parsed else {
            debug!(%sender, "malformed rendezvous payload dropped");
            return;
        };

        let Some(session) = ctx.registry.find(sid) else {
            debug!(sid, %sender, "rendezvous for unknown session dropped");
            return;
        };
        let Some(udp) = session.udp() else {
            return;
        };
        if session.connect_id() != connect_id {
            // The UDP plane never trusts its input: a nonce mismatch gets no
            // response and changes no state.
            debug!(sid, %sender, "rendezvous connect id mismatch dropped");
            return;
        }

        udp.set_local_endpoint(local_endpoint);
        udp.set_remote_endpoint(sender);
        if udp.set_punched_endpoint(sender) {
            endpoint.add_session(session.clone());
            debug!(session = sid, punched = %sender, "rendezvous completed");
        }

        // Duplicates re-send the response without re-indexing.
        let mut response = ctx.pool.acquire();
        response.set_property(Property::ResponseConnection);
        response.set_delivery(DeliveryMethod::Unreliable);
        response.set_session_id_for_connection(SERVER_SESSION_ID);
        if let Err(err) = endpoint.try_send_to(response.as_bytes(), sender) {
            debug!(%sender, "rendezvous response send failed: {err}");
        }
    }
}

//! Fixed packet header for the relay wire protocol.
//!
//! Every packet, on TCP and UDP alike, starts with the same 10-byte header.
//! All multi-byte fields are little-endian.

use crate::WireError;

/// 16-bit session identifier; `0` denotes the server itself.
pub type SessionId = u16;

/// The reserved session id for server-addressed traffic.
pub const SERVER_SESSION_ID: SessionId = 0;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 10;

pub(crate) const OFFSET_PROPERTY: usize = 0;
pub(crate) const OFFSET_DELIVERY: usize = 1;
pub(crate) const OFFSET_SEQ: usize = 2;
pub(crate) const OFFSET_P2P_SESSION_ID: usize = 4;
pub(crate) const OFFSET_SESSION_ID_FOR_CONNECTION: usize = 6;
pub(crate) const OFFSET_PAYLOAD_LEN: usize = 8;

/// First payload byte of an `AliveCheck` ping.
pub const ALIVE_PING: u8 = 0xFF;
/// First payload byte of an `AliveCheck` pong.
pub const ALIVE_PONG: u8 = 0x00;

/// Packet properties as defined by the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    /// Keepalive ping/pong
    AliveCheck = 0x01,
    /// Application payload
    UserData = 0x02,
    /// Acknowledgment for the reliability layer
    Ack = 0x03,
    /// View state request between peers
    ViewRequest = 0x04,
    /// Join a P2P group
    JoinP2p = 0x05,
    /// Leave a P2P group
    LeaveP2p = 0x06,
    /// UDP rendezvous request
    RequestConnection = 0x07,
    /// UDP rendezvous response
    ResponseConnection = 0x08,
}

impl TryFrom<u8> for Property {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Property::AliveCheck),
            0x02 => Ok(Property::UserData),
            0x03 => Ok(Property::Ack),
            0x04 => Ok(Property::ViewRequest),
            0x05 => Ok(Property::JoinP2p),
            0x06 => Ok(Property::LeaveP2p),
            0x07 => Ok(Property::RequestConnection),
            0x08 => Ok(Property::ResponseConnection),
            _ => Err(WireError::Property(value)),
        }
    }
}

/// Delivery methods understood by the channels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMethod {
    /// Fire and forget
    Unreliable = 0x00,
    /// Unreliable, stale datagrams dropped by sequence
    UnreliableSequenced = 0x01,
    /// Retransmitted until acknowledged
    Reliable = 0x02,
    /// Retransmitted and delivered in order
    ReliableOrdered = 0x03,
}

impl TryFrom<u8> for DeliveryMethod {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(DeliveryMethod::Unreliable),
            0x01 => Ok(DeliveryMethod::UnreliableSequenced),
            0x02 => Ok(DeliveryMethod::Reliable),
            0x03 => Ok(DeliveryMethod::ReliableOrdered),
            _ => Err(WireError::Delivery(value)),
        }
    }
}

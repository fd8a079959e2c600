//! Packet layout, pooled buffers, and message codec for the relay protocol.
//!
//! This crate provides the low-level wire pieces shared by the session
//! server and its clients: the fixed packet header, pooled packet buffers
//! with guaranteed release, incremental stream decoding, and the positioned
//! reader/writer used by RPC dispatch.
//!
//! ## Wire Format
//!
//! ```text
//! +-----------------------------+----------------------------+
//! | property              u8    | packet kind                |
//! +-----------------------------+----------------------------+
//! | delivery              u8    | delivery method            |
//! +-----------------------------+----------------------------+
//! | seq                   u16   | sequenced-delivery counter |
//! +-----------------------------+----------------------------+
//! | p2p_session_id        u16   | relay target / origin      |
//! +-----------------------------+----------------------------+
//! | session_id_for_conn   u16   | rendezvous session id      |
//! +-----------------------------+----------------------------+
//! | payload_len           u16   | bytes that follow          |
//! +-----------------------------+----------------------------+
//! | payload                     | variable (0..N)            |
//! +-----------------------------+----------------------------+
//! ```
//!
//! All multi-byte fields are little-endian. TCP carries packets back to
//! back on the stream; a UDP datagram carries exactly one packet.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod header;
pub mod packet;
pub mod rpc;

pub use error::WireError;
pub use header::{
    DeliveryMethod, Property, SessionId, ALIVE_PING, ALIVE_PONG, HEADER_SIZE, SERVER_SESSION_ID,
};
pub use packet::{Packet, PacketDecoder, PacketPool, DEFAULT_MAX_PAYLOAD};
pub use rpc::{MessageKind, RpcReader, RpcWriter};

//! Pooled packet buffers and packet decoders.
//!
//! Packets are backed by reusable `BytesMut` buffers handed out by a
//! [`PacketPool`]. A [`Packet`] owns its buffer for its whole lifetime and
//! returns it to the pool on drop, so release happens on every exit path.
//! Header accessors read and patch the buffer in place; a relayed packet can
//! be rewritten and forwarded without re-encoding.

use crate::header::{
    DeliveryMethod, Property, SessionId, HEADER_SIZE, OFFSET_DELIVERY, OFFSET_P2P_SESSION_ID,
    OFFSET_PAYLOAD_LEN, OFFSET_PROPERTY, OFFSET_SEQ, OFFSET_SESSION_ID_FOR_CONNECTION,
};
use crate::WireError;
use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Default maximum payload size accepted by decoders.
pub const DEFAULT_MAX_PAYLOAD: usize = 4096;

#[derive(Debug)]
struct PoolInner {
    free: Mutex<Vec<BytesMut>>,
    buffer_capacity: usize,
    in_flight: AtomicUsize,
    total_acquired: AtomicU64,
}

impl PoolInner {
    fn release(&self, buf: BytesMut) {
        if let Ok(mut free) = self.free.lock() {
            free.push(buf);
        }
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Pool of reusable packet buffers. Cheap to clone; clones share the pool.
///
/// `acquire` pops a buffer from the free list (or allocates one) and wraps it
/// in a [`Packet`]; dropping the packet pushes the buffer back. `in_flight`
/// tracks outstanding packets so tests can assert the alloc/free balance.
#[derive(Debug, Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

impl PacketPool {
    /// Create a pool whose buffers hold `max_payload` payload bytes.
    pub fn new(max_payload: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                buffer_capacity: HEADER_SIZE + max_payload,
                in_flight: AtomicUsize::new(0),
                total_acquired: AtomicU64::new(0),
            }),
        }
    }

    /// Take a packet with a zeroed header and empty payload.
    pub fn acquire(&self) -> Packet {
        let mut buf = self
            .inner
            .free
            .lock()
            .map(|mut free| free.pop())
            .unwrap_or(None)
            .unwrap_or_else(|| BytesMut::with_capacity(self.inner.buffer_capacity));
        buf.clear();
        buf.resize(HEADER_SIZE, 0);

        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        self.inner.total_acquired.fetch_add(1, Ordering::Relaxed);

        let mut packet = Packet {
            property: Property::UserData,
            delivery: DeliveryMethod::Unreliable,
            buf,
            pool: Arc::clone(&self.inner),
        };
        packet.set_property(Property::UserData);
        packet.set_delivery(DeliveryMethod::Unreliable);
        packet
    }

    /// Largest payload a pooled buffer is sized for.
    pub fn max_payload(&self) -> usize {
        self.inner.buffer_capacity - HEADER_SIZE
    }

    /// Packets currently held by callers.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Relaxed)
    }

    /// Buffers sitting in the free list.
    pub fn pooled(&self) -> usize {
        self.inner.free.lock().map(|free| free.len()).unwrap_or(0)
    }

    /// Packets handed out over the pool's lifetime.
    pub fn total_acquired(&self) -> u64 {
        self.inner.total_acquired.load(Ordering::Relaxed)
    }
}

/// A wire packet backed by a pooled buffer.
///
/// The buffer always holds the full frame: header plus payload.
#[derive(Debug)]
pub struct Packet {
    property: Property,
    delivery: DeliveryMethod,
    buf: BytesMut,
    pool: Arc<PoolInner>,
}

impl Packet {
    fn from_wire(pool: &PacketPool, data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_SIZE {
            return Err(WireError::Incomplete);
        }
        let property = Property::try_from(data[OFFSET_PROPERTY])?;
        let delivery = DeliveryMethod::try_from(data[OFFSET_DELIVERY])?;
        let payload_len =
            u16::from_le_bytes([data[OFFSET_PAYLOAD_LEN], data[OFFSET_PAYLOAD_LEN + 1]]) as usize;
        if data.len() != HEADER_SIZE + payload_len {
            return Err(WireError::Malformed);
        }

        let mut packet = pool.acquire();
        packet.property = property;
        packet.delivery = delivery;
        packet.buf.clear();
        packet.buf.extend_from_slice(data);
        Ok(packet)
    }

    /// Decode a single UDP datagram.
    ///
    /// The datagram must carry exactly one packet: its length has to equal
    /// `HEADER_SIZE + payload_len`.
    pub fn decode_datagram(pool: &PacketPool, data: &[u8]) -> Result<Self, WireError> {
        Self::from_wire(pool, data)
    }

    /// Packet property tag.
    pub fn property(&self) -> Property {
        self.property
    }

    /// Set the property, patching the wire bytes.
    pub fn set_property(&mut self, property: Property) {
        self.property = property;
        self.buf[OFFSET_PROPERTY] = property as u8;
    }

    /// Delivery method.
    pub fn delivery(&self) -> DeliveryMethod {
        self.delivery
    }

    /// Set the delivery method, patching the wire bytes.
    pub fn set_delivery(&mut self, delivery: DeliveryMethod) {
        self.delivery = delivery;
        self.buf[OFFSET_DELIVERY] = delivery as u8;
    }

    /// Sequence number used by sequenced delivery.
    pub fn seq(&self) -> u16 {
        u16::from_le_bytes([self.buf[OFFSET_SEQ], self.buf[OFFSET_SEQ + 1]])
    }

    /// Set the sequence number.
    pub fn set_seq(&mut self, seq: u16) {
        self.buf[OFFSET_SEQ..OFFSET_SEQ + 2].copy_from_slice(&seq.to_le_bytes());
    }

    /// Target (inbound) or origin (after relay rewrite) session id.
    pub fn p2p_session_id(&self) -> SessionId {
        u16::from_le_bytes([
            self.buf[OFFSET_P2P_SESSION_ID],
            self.buf[OFFSET_P2P_SESSION_ID + 1],
        ])
    }

    /// Rewrite the P2P session id in place.
    pub fn set_p2p_session_id(&mut self, id: SessionId) {
        self.buf[OFFSET_P2P_SESSION_ID..OFFSET_P2P_SESSION_ID + 2]
            .copy_from_slice(&id.to_le_bytes());
    }

    /// Session id targeted by a rendezvous packet.
    pub fn session_id_for_connection(&self) -> SessionId {
        u16::from_le_bytes([
            self.buf[OFFSET_SESSION_ID_FOR_CONNECTION],
            self.buf[OFFSET_SESSION_ID_FOR_CONNECTION + 1],
        ])
    }

    /// Set the rendezvous session id.
    pub fn set_session_id_for_connection(&mut self, id: SessionId) {
        self.buf[OFFSET_SESSION_ID_FOR_CONNECTION..OFFSET_SESSION_ID_FOR_CONNECTION + 2]
            .copy_from_slice(&id.to_le_bytes());
    }

    /// Payload region.
    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..]
    }

    /// Replace the payload and update the declared length.
    pub fn set_payload(&mut self, payload: &[u8]) -> Result<(), WireError> {
        let max_payload = self.pool.buffer_capacity - HEADER_SIZE;
        if payload.len() > max_payload || payload.len() > u16::MAX as usize {
            return Err(WireError::PayloadSize(payload.len()));
        }
        self.buf.truncate(HEADER_SIZE);
        self.buf.extend_from_slice(payload);
        self.buf[OFFSET_PAYLOAD_LEN..OFFSET_PAYLOAD_LEN + 2]
            .copy_from_slice(&(payload.len() as u16).to_le_bytes());
        Ok(())
    }

    /// Full wire bytes, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Total wire length.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when the packet has no payload.
    pub fn is_empty(&self) -> bool {
        self.buf.len() == HEADER_SIZE
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(buf);
    }
}

/// Incremental decoder for the TCP byte stream.
///
/// Packets sit back to back on the stream; the decoder frames on the
/// declared payload length and leaves partial packets buffered.
#[derive(Debug)]
pub struct PacketDecoder {
    max_payload: usize,
}

impl PacketDecoder {
    /// Create a decoder that rejects payloads larger than `max_payload`.
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    /// Decode one packet from the buffer, if a complete one is available.
    pub fn decode(
        &mut self,
        buf: &mut BytesMut,
        pool: &PacketPool,
    ) -> Result<Option<Packet>, WireError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let payload_len =
            u16::from_le_bytes([buf[OFFSET_PAYLOAD_LEN], buf[OFFSET_PAYLOAD_LEN + 1]]) as usize;
        if payload_len > self.max_payload {
            return Err(WireError::PayloadSize(payload_len));
        }

        let total = HEADER_SIZE + payload_len;
        if buf.len() < total {
            return Ok(None);
        }

        let wire = buf.split_to(total);
        Packet::from_wire(pool, &wire).map(Some)
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_field_roundtrip() {
        let pool = PacketPool::new(DEFAULT_MAX_PAYLOAD);
        let mut packet = pool.acquire();
        packet.set_property(Property::RequestConnection);
        packet.set_delivery(DeliveryMethod::Reliable);
        packet.set_seq(0xBEEF);
        packet.set_p2p_session_id(7);
        packet.set_session_id_for_connection(42);
        packet.set_payload(&[1, 2, 3]).unwrap();

        let decoded = Packet::decode_datagram(&pool, packet.as_bytes()).unwrap();
        assert_eq!(decoded.property(), Property::RequestConnection);
        assert_eq!(decoded.delivery(), DeliveryMethod::Reliable);
        assert_eq!(decoded.seq(), 0xBEEF);
        assert_eq!(decoded.p2p_session_id(), 7);
        assert_eq!(decoded.session_id_for_connection(), 42);
        assert_eq!(decoded.payload(), &[1, 2, 3]);
    }

    #[test]
    fn test_rewrite_patches_wire_bytes() {
        let pool = PacketPool::new(DEFAULT_MAX_PAYLOAD);
        let mut packet = pool.acquire();
        packet.set_p2p_session_id(2);
        packet.set_payload(&[0xDE, 0xAD]).unwrap();

        packet.set_p2p_session_id(1);

        let bytes = packet.as_bytes();
        assert_eq!(&bytes[4..6], &1u16.to_le_bytes());
        assert_eq!(&bytes[HEADER_SIZE..], &[0xDE, 0xAD]);
    }

    #[test]
    fn test_pool_accounting() {
        let pool = PacketPool::new(64);
        assert_eq!(pool.in_flight(), 0);
        {
            let _a = pool.acquire();
            let _b = pool.acquire();
            assert_eq!(pool.in_flight(), 2);
        }
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.pooled(), 2);

        // Reuse does not grow the free list.
        {
            let _c = pool.acquire();
            assert_eq!(pool.pooled(), 1);
        }
        assert_eq!(pool.pooled(), 2);
        assert_eq!(pool.total_acquired(), 3);
    }

    #[test]
    fn test_datagram_length_must_match() {
        let pool = PacketPool::new(DEFAULT_MAX_PAYLOAD);
        let mut packet = pool.acquire();
        packet.set_payload(&[9, 9, 9]).unwrap();

        let mut wire = packet.as_bytes().to_vec();
        wire.push(0); // trailing garbage
        assert!(matches!(
            Packet::decode_datagram(&pool, &wire),
            Err(WireError::Malformed)
        ));

        assert!(matches!(
            Packet::decode_datagram(&pool, &wire[..4]),
            Err(WireError::Incomplete)
        ));
    }

    #[test]
    fn test_unknown_property_rejected() {
        let pool = PacketPool::new(DEFAULT_MAX_PAYLOAD);
        let mut wire = vec![0u8; HEADER_SIZE];
        wire[0] = 0x7F;
        assert!(matches!(
            Packet::decode_datagram(&pool, &wire),
            Err(WireError::Property(0x7F))
        ));
        // Nothing leaked: the pool never handed out a buffer.
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_stream_decoder_fragmented_input() {
        let pool = PacketPool::new(DEFAULT_MAX_PAYLOAD);
        let mut packet = pool.acquire();
        packet.set_property(Property::AliveCheck);
        packet.set_payload(&[0xFF]).unwrap();
        let wire = packet.as_bytes().to_vec();
        drop(packet);

        let mut decoder = PacketDecoder::default();
        let mut buf = BytesMut::new();

        // Feed the frame one byte at a time; only the final byte completes it.
        for (i, byte) in wire.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let decoded = decoder.decode(&mut buf, &pool).unwrap();
            if i + 1 < wire.len() {
                assert!(decoded.is_none());
            } else {
                let decoded = decoded.expect("complete frame");
                assert_eq!(decoded.property(), Property::AliveCheck);
                assert_eq!(decoded.payload(), &[0xFF]);
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_stream_decoder_two_packets_back_to_back() {
        let pool = PacketPool::new(DEFAULT_MAX_PAYLOAD);
        let mut first = pool.acquire();
        first.set_payload(b"one").unwrap();
        let mut second = pool.acquire();
        second.set_payload(b"two!").unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(first.as_bytes());
        buf.extend_from_slice(second.as_bytes());
        drop(first);
        drop(second);

        let mut decoder = PacketDecoder::default();
        let a = decoder.decode(&mut buf, &pool).unwrap().unwrap();
        assert_eq!(a.payload(), b"one");
        let b = decoder.decode(&mut buf, &pool).unwrap().unwrap();
        assert_eq!(b.payload(), b"two!");
        assert!(decoder.decode(&mut buf, &pool).unwrap().is_none());
    }

    #[test]
    fn test_stream_decoder_payload_limit() {
        let pool = PacketPool::new(DEFAULT_MAX_PAYLOAD);
        let mut buf = BytesMut::new();
        let mut header = [0u8; HEADER_SIZE];
        header[0] = Property::UserData as u8;
        header[OFFSET_PAYLOAD_LEN..OFFSET_PAYLOAD_LEN + 2].copy_from_slice(&100u16.to_le_bytes());
        buf.extend_from_slice(&header);

        let mut decoder = PacketDecoder::new(16);
        assert!(matches!(
            decoder.decode(&mut buf, &pool),
            Err(WireError::PayloadSize(100))
        ));
    }
}

//! Message envelope and positioned reader/writer for RPC payloads.
//!
//! TCP `UserData` payloads carry a one-byte message kind, an optional
//! request id, and the message body. The reader keeps an explicit position
//! so the dispatch chain can snapshot and restore it between handlers; the
//! writer is the growable counterpart with `truncate` for the same purpose.
//! All integers are little-endian.

use crate::WireError;
use bytes::BytesMut;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Kind byte at the start of every TCP message payload.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Fire-and-forget message
    OneWay = 0,
    /// Request expecting a response with the same request id
    Request = 1,
    /// Response to an earlier request
    Response = 2,
}

impl TryFrom<u8> for MessageKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageKind::OneWay),
            1 => Ok(MessageKind::Request),
            2 => Ok(MessageKind::Response),
            _ => Err(WireError::MessageKind(value)),
        }
    }
}

/// Positioned little-endian reader over a message payload.
#[derive(Debug)]
pub struct RpcReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RpcReader<'a> {
    /// Wrap a payload slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current read position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Rewind or advance to an absolute position.
    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Underrun(self.pos));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    /// Read a little-endian u16.
    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a little-endian u32.
    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a little-endian u64.
    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// Read a little-endian i64.
    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        Ok(self.read_u64()? as i64)
    }

    /// Read `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        self.take(len)
    }

    /// Read everything from the current position to the end.
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_str(&mut self) -> Result<&'a str, WireError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|_| WireError::Malformed)
    }

    /// Read an endpoint encoded as `{family, addr_bytes, port}`.
    pub fn read_socket_addr(&mut self) -> Result<SocketAddr, WireError> {
        match self.read_u8()? {
            4 => {
                let b = self.take(4)?;
                let ip = IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]));
                let port = self.read_u16()?;
                Ok(SocketAddr::new(ip, port))
            }
            6 => {
                let b = self.take(16)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(b);
                let port = self.read_u16()?;
                Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            other => Err(WireError::AddressFamily(other)),
        }
    }
}

/// Growable little-endian writer for message bodies.
#[derive(Debug, Default)]
pub struct RpcWriter {
    buf: BytesMut,
}

impl RpcWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Roll back to an earlier length.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Write one byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.extend_from_slice(&[value]);
    }

    /// Write a little-endian u16.
    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a little-endian u32.
    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a little-endian u64.
    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a little-endian i64.
    pub fn write_i64(&mut self, value: i64) {
        self.write_u64(value as u64);
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_str(&mut self, value: &str) -> Result<(), WireError> {
        if value.len() > u16::MAX as usize {
            return Err(WireError::PayloadSize(value.len()));
        }
        self.write_u16(value.len() as u16);
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    /// Write an endpoint as `{family, addr_bytes, port}`.
    pub fn write_socket_addr(&mut self, addr: &SocketAddr) {
        match addr.ip() {
            IpAddr::V4(ip) => {
                self.write_u8(4);
                self.buf.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                self.write_u8(6);
                self.buf.extend_from_slice(&ip.octets());
            }
        }
        self.write_u16(addr.port());
    }

    /// View of the written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_conversion() {
        assert_eq!(MessageKind::try_from(0).unwrap(), MessageKind::OneWay);
        assert_eq!(MessageKind::try_from(2).unwrap(), MessageKind::Response);
        assert!(MessageKind::try_from(3).is_err());
    }

    #[test]
    fn test_reader_writer_roundtrip() {
        let mut writer = RpcWriter::new();
        writer.write_u8(7);
        writer.write_u16(0x1234);
        writer.write_u32(0xDEADBEEF);
        writer.write_i64(-42);
        writer.write_str("hello").unwrap();
        writer.write_bytes(&[9, 8, 7]);

        let mut reader = RpcReader::new(writer.as_slice());
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_u16().unwrap(), 0x1234);
        assert_eq!(reader.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(reader.read_i64().unwrap(), -42);
        assert_eq!(reader.read_str().unwrap(), "hello");
        assert_eq!(reader.read_remaining(), &[9, 8, 7]);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_socket_addr_roundtrip() {
        let v4: SocketAddr = "192.168.1.7:9001".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();

        let mut writer = RpcWriter::new();
        writer.write_socket_addr(&v4);
        writer.write_socket_addr(&v6);

        let mut reader = RpcReader::new(writer.as_slice());
        assert_eq!(reader.read_socket_addr().unwrap(), v4);
        assert_eq!(reader.read_socket_addr().unwrap(), v6);
    }

    #[test]
    fn test_unknown_address_family() {
        let mut reader = RpcReader::new(&[5, 0, 0]);
        assert!(matches!(
            reader.read_socket_addr(),
            Err(WireError::AddressFamily(5))
        ));
    }

    #[test]
    fn test_position_save_restore() {
        let mut writer = RpcWriter::new();
        writer.write_u32(11);
        writer.write_u32(22);

        let mut reader = RpcReader::new(writer.as_slice());
        let mark = reader.position();
        assert_eq!(reader.read_u32().unwrap(), 11);
        reader.set_position(mark);
        assert_eq!(reader.read_u32().unwrap(), 11);
        assert_eq!(reader.read_u32().unwrap(), 22);
    }

    #[test]
    fn test_writer_truncate() {
        let mut writer = RpcWriter::new();
        writer.write_u16(1);
        let mark = writer.len();
        writer.write_bytes(b"scratch");
        writer.truncate(mark);
        assert_eq!(writer.len(), 2);
        assert_eq!(writer.as_slice(), &1u16.to_le_bytes());
    }

    #[test]
    fn test_underrun() {
        let mut reader = RpcReader::new(&[1, 2]);
        assert!(matches!(reader.read_u32(), Err(WireError::Underrun(0))));
        // A failed read does not advance the position.
        assert_eq!(reader.read_u16().unwrap(), 0x0201);
    }
}

//! Wire codec: one frame per UDP datagram
//!
//! ```text
//! | header (12 bytes, big-endian)           | body         |
//! | u16 method | u64 request id | u16 size  | size bytes   |
//! ```
//!
//! The request id is the only correlation key between a request and its
//! response. Frames built locally get one assigned the first time they are
//! encoded (see [`Frame::ensure_request_id`]).

use crate::error::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Length of the fixed frame header
pub const HEADER_LEN: usize = 12;

/// Largest payload the 16-bit size field can describe
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Method code carried in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Registry answer to any server-facing request
    Response,
    /// Announce the sender's id to the registry
    Register,
    /// Fetch the whole directory
    ListPeers,
    /// Look up one peer's address
    ResolvePeer,
    /// Peer-to-peer application message
    SendMessage,
    /// A code this crate does not interpret
    Other(u16),
}

impl Method {
    /// First code of the peer-facing range
    pub const PEER_RANGE_START: u16 = 1000;

    pub fn code(self) -> u16 {
        match self {
            Method::Response => 1,
            Method::Register => 2,
            Method::ListPeers => 3,
            Method::ResolvePeer => 4,
            Method::SendMessage => 1000,
            Method::Other(code) => code,
        }
    }

    /// Whether the code belongs to the peer-to-peer range rather than the registry protocol
    pub fn is_peer_facing(self) -> bool {
        self.code() >= Self::PEER_RANGE_START
    }
}

impl From<u16> for Method {
    fn from(code: u16) -> Self {
        match code {
            1 => Method::Response,
            2 => Method::Register,
            3 => Method::ListPeers,
            4 => Method::ResolvePeer,
            1000 => Method::SendMessage,
            other => Method::Other(other),
        }
    }
}

impl From<Method> for u16 {
    fn from(method: Method) -> Self {
        method.code()
    }
}

/// Source of request ids.
///
/// Implementations must never return zero and never repeat an id within the
/// lifetime of the process that owns them.
pub trait RequestIdGenerator: Send + Sync {
    fn next_id(&self) -> u64;
}

/// Sonyflake-style generator: 39-bit tick of 10 ms, 8-bit sequence, 16-bit machine id
#[derive(Debug)]
pub struct SnowflakeIdGenerator {
    machine_id: u16,
    last: AtomicU64,
}

impl SnowflakeIdGenerator {
    const TICK: Duration = Duration::from_millis(10);
    const MACHINE_BITS: u32 = 16;
    const SEQUENCE_BITS: u32 = 8;
    /// 2024-01-01T00:00:00Z
    const EPOCH_SECS: u64 = 1_704_067_200;

    /// Generator with a random machine id
    pub fn new() -> Self {
        Self::with_machine_id(rand::random())
    }

    pub fn with_machine_id(machine_id: u16) -> Self {
        Self {
            machine_id,
            last: AtomicU64::new(0),
        }
    }

    pub fn machine_id(&self) -> u16 {
        self.machine_id
    }

    fn current_tick() -> u64 {
        let since_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        let since_epoch = since_unix.saturating_sub(Duration::from_secs(Self::EPOCH_SECS));
        // Tick 0 would allow an all-zero id.
        (since_epoch.as_millis() / Self::TICK.as_millis()) as u64 + 1
    }
}

impl Default for SnowflakeIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIdGenerator for SnowflakeIdGenerator {
    fn next_id(&self) -> u64 {
        let shift = Self::MACHINE_BITS + Self::SEQUENCE_BITS;
        let fresh = (Self::current_tick() << shift) | u64::from(self.machine_id);
        let step = 1u64 << Self::MACHINE_BITS;

        // Strictly increasing: within one tick (or if the clock goes back) bump the
        // sequence, which carries into the tick once exhausted.
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(if fresh > last { fresh } else { last + step })
            })
            .unwrap_or_else(|last| last);
        if fresh > previous {
            fresh
        } else {
            previous + step
        }
    }
}

/// Deterministic 1, 2, 3, ... generator, mostly for tests
#[derive(Debug)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Start at `first`; zero is bumped to one
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
        }
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// One wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub method: Method,
    /// Zero until assigned
    pub request_id: u64,
    pub data: Bytes,
    /// Sender (inbound) or destination (outbound). Never serialized.
    pub addr: SocketAddr,
}

impl Frame {
    pub fn new(method: Method, data: impl Into<Bytes>, addr: SocketAddr) -> Self {
        Self {
            method,
            request_id: 0,
            data: data.into(),
            addr,
        }
    }

    /// A response frame reusing the id of the request it answers
    pub fn reply(
        method: Method,
        request_id: u64,
        data: impl Into<Bytes>,
        addr: SocketAddr,
    ) -> Self {
        Self {
            method,
            request_id,
            data: data.into(),
            addr,
        }
    }

    /// Size field as it will appear on the wire
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    /// Assign a fresh request id if none is set yet, returning the frame's id
    pub fn ensure_request_id(&mut self, ids: &dyn RequestIdGenerator) -> u64 {
        if self.request_id == 0 {
            self.request_id = ids.next_id();
        }
        self.request_id
    }

    /// Assign a request id if needed, then encode.
    ///
    /// [`Method::Response`] frames are encoded as-is: they echo the id of the
    /// request they answer, zero included.
    pub fn encode(&mut self, ids: &dyn RequestIdGenerator) -> Result<Bytes, CodecError> {
        if self.method != Method::Response {
            self.ensure_request_id(ids);
        }
        self.to_bytes()
    }

    /// Encode as-is, without touching the request id
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        if self.data.len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge {
                size: self.data.len(),
                max_size: MAX_PAYLOAD_LEN,
            });
        }

        let mut out = BytesMut::with_capacity(HEADER_LEN + self.data.len());
        out.put_u16(self.method.code());
        out.put_u64(self.request_id);
        out.put_u16(self.data.len() as u16);
        out.put_slice(&self.data);
        Ok(out.freeze())
    }

    /// Decode a datagram received from `addr`. Bytes past the declared payload are ignored.
    pub fn decode(datagram: &[u8], addr: SocketAddr) -> Result<Self, CodecError> {
        if datagram.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                len: datagram.len(),
                header_len: HEADER_LEN,
            });
        }

        let mut buf = datagram;
        let method = Method::from(buf.get_u16());
        let request_id = buf.get_u64();
        let declared = buf.get_u16() as usize;
        if declared > buf.remaining() {
            return Err(CodecError::SizeMismatch {
                declared,
                available: buf.remaining(),
            });
        }

        Ok(Self {
            method,
            request_id,
            data: Bytes::copy_from_slice(&buf[..declared]),
            addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:7777".parse().unwrap()
    }

    #[test]
    fn header_layout_is_big_endian() {
        let mut frame = Frame::new(Method::Register, &b"test"[..], addr());
        frame.request_id = 0x0102_0304_0506_0708;
        let bytes = frame.to_bytes().unwrap();

        assert_eq!(bytes.len(), HEADER_LEN + 4);
        assert_eq!(&bytes[0..2], &[0, 2]);
        assert_eq!(&bytes[2..10], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[10..12], &[0, 4]);
        assert_eq!(&bytes[12..], b"test");
    }

    #[test]
    fn encode_assigns_id_once() {
        let ids = SequentialIdGenerator::starting_at(41);
        let mut frame = Frame::new(Method::ListPeers, Bytes::new(), addr());

        frame.encode(&ids).unwrap();
        assert_eq!(frame.request_id, 41);
        frame.encode(&ids).unwrap();
        assert_eq!(frame.request_id, 41);
    }

    #[test]
    fn response_keeps_zero_request_id() {
        let ids = SequentialIdGenerator::new();
        let mut frame = Frame::reply(Method::Response, 0, &b"{}"[..], addr());

        let bytes = frame.encode(&ids).unwrap();
        assert_eq!(frame.request_id, 0);
        assert_eq!(&bytes[2..10], &[0u8; 8]);
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let frame = Frame::new(Method::SendMessage, vec![0u8; MAX_PAYLOAD_LEN + 1], addr());
        assert_eq!(
            frame.to_bytes(),
            Err(CodecError::PayloadTooLarge {
                size: MAX_PAYLOAD_LEN + 1,
                max_size: MAX_PAYLOAD_LEN,
            })
        );

        let max = Frame::new(Method::SendMessage, vec![0u8; MAX_PAYLOAD_LEN], addr());
        assert_eq!(max.to_bytes().unwrap().len(), HEADER_LEN + MAX_PAYLOAD_LEN);
    }

    #[test]
    fn short_datagrams_fail_to_decode() {
        assert!(matches!(
            Frame::decode(&[0u8; 11], addr()),
            Err(CodecError::Truncated { len: 11, .. })
        ));

        let mut bytes = Frame::new(Method::Register, &b"abcdef"[..], addr())
            .to_bytes()
            .unwrap()
            .to_vec();
        bytes.truncate(HEADER_LEN + 3);
        assert_eq!(
            Frame::decode(&bytes, addr()),
            Err(CodecError::SizeMismatch {
                declared: 6,
                available: 3
            })
        );
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut frame = Frame::new(Method::Response, &b"{}"[..], addr());
        frame.request_id = 9;
        let mut buf = frame.to_bytes().unwrap().to_vec();
        buf.resize(1024, 0);

        assert_eq!(Frame::decode(&buf, addr()).unwrap(), frame);
    }

    #[test]
    fn unknown_methods_survive() {
        assert_eq!(Method::from(77), Method::Other(77));
        assert_eq!(u16::from(Method::Other(77)), 77);
        assert!(Method::SendMessage.is_peer_facing());
        assert!(Method::Other(2000).is_peer_facing());
        assert!(!Method::ResolvePeer.is_peer_facing());
    }

    #[test]
    fn snowflake_ids_are_nonzero_and_increasing() {
        let ids = SnowflakeIdGenerator::with_machine_id(0);
        let mut last = 0;
        for _ in 0..10_000 {
            let id = ids.next_id();
            assert!(id > last);
            last = id;
        }
    }
}

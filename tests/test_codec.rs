use going::{
    codec::{Frame, Method, RequestIdGenerator, SnowflakeIdGenerator, HEADER_LEN, MAX_PAYLOAD_LEN},
    error::CodecError,
    SequentialIdGenerator,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

fn addr() -> SocketAddr {
    "127.0.0.1:7777".parse().unwrap()
}

proptest! {
    #[test]
    fn decode_inverts_encode(
        method in any::<u16>(),
        request_id in 1u64..,
        data in proptest::collection::vec(any::<u8>(), 0..2048),
        port in 1u16..,
    ) {
        let sender: SocketAddr = ([10, 0, 0, 1], port).into();
        let mut frame = Frame::new(Method::from(method), data, addr());
        frame.request_id = request_id;

        let bytes = frame.to_bytes().unwrap();
        let decoded = Frame::decode(&bytes, sender).unwrap();

        prop_assert_eq!(decoded.method, frame.method);
        prop_assert_eq!(decoded.request_id, frame.request_id);
        prop_assert_eq!(decoded.data, frame.data);
        prop_assert_eq!(decoded.addr, sender);
    }
}

#[test]
fn test_roundtrip_with_generated_id() {
    let ids = SnowflakeIdGenerator::new();
    let mut frame = Frame::new(Method::Register, &b"test"[..], addr());

    let bytes = frame.encode(&ids).unwrap();
    assert_ne!(frame.request_id, 0);
    assert_eq!(Frame::decode(&bytes, addr()).unwrap(), frame);
}

#[test]
fn test_roundtrip_at_size_ceiling() {
    let mut frame = Frame::new(Method::SendMessage, vec![0xAB; MAX_PAYLOAD_LEN], addr());
    frame.request_id = 1;

    let bytes = frame.to_bytes().unwrap();
    assert_eq!(bytes.len(), HEADER_LEN + MAX_PAYLOAD_LEN);
    assert_eq!(Frame::decode(&bytes, addr()).unwrap(), frame);
}

#[test]
fn test_oversized_payload_rejected_not_truncated() {
    let ids = SequentialIdGenerator::new();
    let mut frame = Frame::new(Method::SendMessage, vec![0u8; 70_000], addr());

    match frame.encode(&ids) {
        Err(CodecError::PayloadTooLarge { size, max_size }) => {
            assert_eq!(size, 70_000);
            assert_eq!(max_size, 65_535);
        },
        other => panic!("expected PayloadTooLarge, got {:?}", other),
    }
}

#[test]
fn test_encoding_many_frames_yields_distinct_ids() {
    let ids = SnowflakeIdGenerator::new();
    let mut seen = HashSet::new();

    for _ in 0..5_000 {
        let mut frame = Frame::new(Method::ListPeers, Vec::new(), addr());
        frame.encode(&ids).unwrap();
        assert_ne!(frame.request_id, 0);
        assert!(seen.insert(frame.request_id), "duplicate id {}", frame.request_id);
    }
}

#[test]
fn test_snowflake_ids_unique_across_threads() {
    let ids = Arc::new(SnowflakeIdGenerator::new());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let ids = ids.clone();
            std::thread::spawn(move || (0..2_000).map(|_| ids.next_id()).collect::<Vec<_>>())
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(seen.insert(id));
        }
    }
    assert_eq!(seen.len(), 8_000);
}

#[test]
fn test_decode_rejects_short_header() {
    let err = Frame::decode(&[0, 2, 0, 0], addr()).unwrap_err();
    assert_eq!(
        err,
        CodecError::Truncated {
            len: 4,
            header_len: HEADER_LEN
        }
    );
}

#[test]
fn test_decode_rejects_overlong_size_field() {
    // method 2, id 1, declared size 100, only 3 payload bytes
    let mut datagram = vec![0, 2, 0, 0, 0, 0, 0, 0, 0, 1, 0, 100];
    datagram.extend_from_slice(b"abc");

    assert_eq!(
        Frame::decode(&datagram, addr()).unwrap_err(),
        CodecError::SizeMismatch {
            declared: 100,
            available: 3
        }
    );
}

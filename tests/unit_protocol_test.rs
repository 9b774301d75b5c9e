// tests/unit_protocol_test.rs

use bytes::BytesMut;
use prismd::core::protocol::{ClientCodec, RpcRequest, RpcResponse, ServerCodec};
use tokio_util::codec::{Decoder, Encoder};

#[test]
fn test_partial_frames_decode_to_none_until_complete() {
    let mut client = ClientCodec::new();
    let mut wire = BytesMut::new();
    client
        .encode(
            RpcRequest::RequestVote {
                term: 7,
                candidate_id: "localhost:50054".to_string(),
                score: 12.5,
            },
            &mut wire,
        )
        .unwrap();

    let mut server = ServerCodec::new();
    let split_at = wire.len() / 2;
    let mut partial = BytesMut::from(&wire[..split_at]);
    assert!(server.decode(&mut partial).unwrap().is_none());

    partial.extend_from_slice(&wire[split_at..]);
    match server.decode(&mut partial).unwrap() {
        Some(RpcRequest::RequestVote {
            term,
            candidate_id,
            score,
        }) => {
            assert_eq!(term, 7);
            assert_eq!(candidate_id, "localhost:50054");
            assert_eq!(score, 12.5);
        }
        other => panic!("unexpected decode result: {other:?}"),
    }
    // Nothing left over.
    assert!(server.decode(&mut partial).unwrap().is_none());
}

#[test]
fn test_response_kind_elides_payloads() {
    let reply = RpcResponse::Shard {
        shard_id: "s0".to_string(),
        success: true,
        shard_data: vec![0u8; 1024],
        message: "OK".to_string(),
    };
    assert_eq!(reply.kind(), "Shard");
    assert_eq!(
        RpcResponse::Error {
            message: "x".to_string()
        }
        .kind(),
        "Error"
    );
}

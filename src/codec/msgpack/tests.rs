// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::*;

fn request() -> Message {
    Message::Request {
        id: 9,
        method: "reverse".to_string(),
        params: vec![Value::from("abc")],
    }
}

/// Tests that each MessagePack-RPC shape survives a round trip.
#[test]
fn round_trip_all_kinds() {
    let messages = vec![
        request(),
        Message::Notify {
            method: "tick".to_string(),
            params: vec![],
        },
        Message::Response {
            id: 9,
            error: None,
            result: Value::from("cba"),
        },
        Message::Response {
            id: 10,
            error: Some(Value::from("boom")),
            result: Value::Nil,
        },
    ];
    let mut codec = MsgPackCodec::new();
    for message in messages {
        let frame = codec.encode(&message).unwrap();
        assert_eq!(codec.feed(&frame).unwrap(), vec![message]);
    }
}

/// Tests the exact wire layout of a request against a hand-packed frame.
#[test]
fn request_wire_shape() {
    let codec = MsgPackCodec::new();
    let frame = codec
        .encode(&Message::Request {
            id: 1,
            method: "f".to_string(),
            params: vec![],
        })
        .unwrap();
    // fixarray(4), 0, 1, fixstr "f", fixarray(0)
    assert_eq!(frame, vec![0x94, 0x00, 0x01, 0xa1, b'f', 0x90]);
}

/// Tests that the streaming decoder holds partial frames across feeds.
#[test]
fn feed_byte_at_a_time() {
    let mut codec = MsgPackCodec::new();
    let frame = codec.encode(&request()).unwrap();
    for byte in &frame[..frame.len() - 1] {
        assert_eq!(codec.feed(&[*byte]).unwrap(), vec![]);
    }
    assert_eq!(codec.feed(&frame[frame.len() - 1..]).unwrap(), vec![request()]);
}

/// Tests that back-to-back frames in one feed all come out.
#[test]
fn feed_two_frames_at_once() {
    let mut codec = MsgPackCodec::new();
    let mut bytes = codec.encode(&request()).unwrap();
    bytes.extend_from_slice(&codec.encode(&request()).unwrap());
    assert_eq!(codec.feed(&bytes).unwrap().len(), 2);
}

/// Tests that a frame that is not an array fails the connection.
#[test]
fn non_array_frame_is_fatal() {
    let mut codec = MsgPackCodec::new();
    // fixstr "hi" is a complete value but not a valid frame.
    assert!(matches!(
        codec.feed(&[0xa2, b'h', b'i']),
        Err(Fail::DecodeError { .. })
    ));
}

/// Tests that an unknown leading type tag fails the connection.
#[test]
fn unknown_message_type_is_fatal() {
    let mut codec = MsgPackCodec::new();
    // fixarray(3), 7, fixstr "x", fixarray(0)
    assert!(matches!(
        codec.feed(&[0x93, 0x07, 0xa1, b'x', 0x90]),
        Err(Fail::DecodeError { .. })
    ));
}

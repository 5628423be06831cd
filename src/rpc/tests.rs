// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::*;
use crate::{
    codec::{CodecVariant, Message, NativeCodec, Value, WireCodec},
    deferred::Deferred,
    event::EventLoop,
    fail::Fail,
};
use std::{cell::RefCell, rc::Rc};

//==============================================================================
// Fixtures
//==============================================================================

/// Transport that captures every frame for later inspection.
struct MockTransport {
    sent: RefCell<Vec<Vec<u8>>>,
}

impl MockTransport {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            sent: RefCell::new(Vec::new()),
        })
    }

    /// Decodes everything sent so far with a fresh codec.
    fn messages(&self, variant: CodecVariant) -> Vec<Message> {
        let mut codec = variant.build();
        let mut messages = Vec::new();
        for frame in self.sent.borrow().iter() {
            messages.extend(codec.feed(frame).unwrap());
        }
        messages
    }
}

impl Transport for MockTransport {
    fn send_bytes(&self, bytes: &[u8]) -> Result<(), Fail> {
        self.sent.borrow_mut().push(bytes.to_vec());
        Ok(())
    }

    fn close(&self) {}
}

/// Transport that hands frames straight to a peer protocol, so two
/// protocols can talk without sockets.
struct LoopbackTransport {
    peer: RefCell<Option<RpcProtocol>>,
}

impl Transport for LoopbackTransport {
    fn send_bytes(&self, bytes: &[u8]) -> Result<(), Fail> {
        let peer = self.peer.borrow().clone();
        if let Some(peer) = peer {
            peer.data(bytes);
        }
        Ok(())
    }

    fn close(&self) {}
}

fn add_handler(params: Vec<Value>) -> Result<Reply, Fail> {
    let mut sum = 0i64;
    for param in &params {
        sum += param.as_i64().ok_or(Fail::Invalid {
            details: "parameter is not an integer",
        })?;
    }
    Ok(Reply::Value(Value::from(sum)))
}

/// Two protocols from one factory, cross-wired in memory: index 0 plays
/// client, index 1 plays server.
fn pair(variant: CodecVariant, dispatch: Dispatch) -> (EventLoop, ProtocolFactory, RpcProtocol, RpcProtocol) {
    let event_loop = EventLoop::new();
    let factory = ProtocolFactory::new(&event_loop, dispatch, variant);
    let client = factory.build();
    let server = factory.build();
    client.connection_made(Rc::new(LoopbackTransport {
        peer: RefCell::new(Some(server.clone())),
    }));
    server.connection_made(Rc::new(LoopbackTransport {
        peer: RefCell::new(Some(client.clone())),
    }));
    (event_loop, factory, client, server)
}

fn adder_dispatch() -> Dispatch {
    let dispatch = Dispatch::new();
    dispatch.register("add", add_handler);
    dispatch
}

//==============================================================================
// Dispatch
//==============================================================================

/// Tests registration, lookup, and the unknown-method error.
#[test]
fn dispatch_calls_by_name() {
    let dispatch = adder_dispatch();
    match dispatch.call("add", vec![Value::from(2), Value::from(3)]) {
        Ok(Reply::Value(value)) => assert_eq!(value, Value::from(5)),
        _ => panic!("expected an immediate value"),
    }
    assert_eq!(
        dispatch.call("sub", vec![]).err(),
        Some(Fail::UnknownMethod {
            method: "sub".to_string()
        })
    );
}

/// Tests that the last registration under a name wins.
#[test]
fn dispatch_last_registration_wins() {
    let dispatch = Dispatch::new();
    dispatch.register("f", |_| Ok(Reply::Value(Value::from(1))));
    dispatch.register("f", |_| Ok(Reply::Value(Value::from(2))));
    match dispatch.call("f", vec![]) {
        Ok(Reply::Value(value)) => assert_eq!(value, Value::from(2)),
        _ => panic!("expected an immediate value"),
    }
}

/// Tests registering every method a [Remote] object exports.
#[test]
fn dispatch_scans_remote_objects() {
    struct Calculator;

    impl Remote for Calculator {
        fn exports(&self) -> Vec<Export> {
            vec![Export {
                name: "mul".to_string(),
                hints: Some(vec!["int", "int"]),
                handler: Rc::new(|params: Vec<Value>| {
                    let product = params
                        .iter()
                        .filter_map(|p| p.as_i64())
                        .product::<i64>();
                    Ok(Reply::Value(Value::from(product)))
                }),
            }]
        }
    }

    let dispatch = Dispatch::new();
    dispatch.scan(&Calculator);
    assert!(dispatch.contains("mul"));
    match dispatch.call("mul", vec![Value::from(6), Value::from(7)]) {
        Ok(Reply::Value(value)) => assert_eq!(value, Value::from(42)),
        _ => panic!("expected an immediate value"),
    }
}

//==============================================================================
// Protocol & Proxy
//==============================================================================

/// Tests a full call round trip through two cross-wired protocols.
#[test]
fn call_round_trip() {
    let (_, _, client, _) = pair(CodecVariant::Native, adder_dispatch());
    let proxy = client.proxy().wait(None).unwrap();
    let result = proxy.call("add", vec![Value::from(2), Value::from(3)]).unwrap();
    assert_eq!(result, Value::from(5));
    assert_eq!(proxy.pending(), 0);
}

/// Tests the same round trip over the MessagePack codec.
#[test]
fn call_round_trip_msgpack() {
    let (_, _, client, _) = pair(CodecVariant::MsgPack, adder_dispatch());
    let proxy = client.proxy().wait(None).unwrap();
    let result = proxy.call("add", vec![Value::from(40), Value::from(2)]).unwrap();
    assert_eq!(result, Value::from(42));
}

/// Tests that a remote handler failure surfaces as a RemoteError carrying
/// the remote payload.
#[test]
fn remote_failure_surfaces_as_remote_error() {
    let (_, _, client, _) = pair(CodecVariant::Native, adder_dispatch());
    let proxy = client.proxy().wait(None).unwrap();
    match proxy.call("missing", vec![]) {
        Err(Fail::RemoteError { payload }) => {
            assert!(payload.as_str().unwrap().contains("missing"));
        }
        other => panic!("expected a remote error, got {:?}", other.map(|_| ())),
    }
}

/// Tests that notify never allocates an in-flight entry and that the
/// remote dispatches without replying.
#[test]
fn notify_is_fire_and_forget() {
    let count = Rc::new(RefCell::new(0));
    let dispatch = Dispatch::new();
    let seen = count.clone();
    dispatch.register("poke", move |_| {
        *seen.borrow_mut() += 1;
        Ok(Reply::Value(Value::Nil))
    });
    let (_, _, client, _) = pair(CodecVariant::Native, dispatch);
    let proxy = client.proxy().wait(None).unwrap();
    proxy.notify("poke", vec![]).unwrap();
    assert_eq!(proxy.pending(), 0);
    assert_eq!(*count.borrow(), 1);
}

/// Tests that begin_notify returns a cell pre-resolved to nil.
#[test]
fn begin_notify_resolves_to_nil() {
    let (_, _, client, _) = pair(CodecVariant::Native, adder_dispatch());
    let proxy = client.proxy().wait(None).unwrap();
    let deferred = proxy.begin_notify("add", vec![Value::from(1), Value::from(1)]);
    assert_eq!(deferred.wait(None).unwrap(), Value::Nil);
    assert_eq!(proxy.pending(), 0);
}

/// Tests that a handler error on a notify produces no reply frame.
#[test]
fn notify_error_never_replies() {
    let event_loop = EventLoop::new();
    let dispatch = Dispatch::new();
    dispatch.register("bad", |_| {
        Err(Fail::Invalid {
            details: "handler refused",
        })
    });
    let factory = ProtocolFactory::new(&event_loop, dispatch, CodecVariant::Native);
    let protocol = factory.build();
    let transport = MockTransport::new();
    protocol.connection_made(transport.clone());
    let frame = NativeCodec::new()
        .encode(&Message::Notify {
            method: "bad".to_string(),
            params: vec![],
        })
        .unwrap();
    protocol.data(&frame);
    assert!(transport.messages(CodecVariant::Native).is_empty());
}

/// Tests that a dispatched request error turns into a response-err frame.
#[test]
fn request_error_becomes_response_err() {
    let event_loop = EventLoop::new();
    let factory = ProtocolFactory::new(&event_loop, adder_dispatch(), CodecVariant::Native);
    let protocol = factory.build();
    let transport = MockTransport::new();
    protocol.connection_made(transport.clone());
    let frame = NativeCodec::new()
        .encode(&Message::Request {
            id: 3,
            method: "nope".to_string(),
            params: vec![],
        })
        .unwrap();
    protocol.data(&frame);
    match transport.messages(CodecVariant::Native).as_slice() {
        [Message::Response { id: 3, error: Some(_), result: Value::Nil }] => {}
        other => panic!("unexpected frames: {:?}", other),
    }
}

/// Tests that a handler returning a deferred sends the response only once
/// that cell completes.
#[test]
fn deferred_reply_sends_response_on_completion() {
    let dispatch = Dispatch::new();
    let (event_loop, _, client, _) = pair(CodecVariant::Native, dispatch.clone());
    let slot: Rc<RefCell<Option<Deferred<Value>>>> = Rc::new(RefCell::new(None));
    let parked = slot.clone();
    let handler_loop = event_loop;
    dispatch.register("slow", move |_| {
        let deferred = Deferred::new(&handler_loop);
        *parked.borrow_mut() = Some(deferred.clone());
        Ok(Reply::Deferred(deferred))
    });
    let proxy = client.proxy().wait(None).unwrap();
    let call = proxy.begin_call("slow", vec![]);
    assert!(!call.completed());
    assert_eq!(proxy.pending(), 1);

    let handler_side = slot.borrow().clone().unwrap();
    handler_side.succeed(Value::from(99)).unwrap();
    assert_eq!(call.wait(None).unwrap(), Value::from(99));
    assert_eq!(proxy.pending(), 0);
}

/// Tests that cancelling a handler's deferred still answers the caller:
/// cancellation is a terminal failure and the completion hook sends a
/// response-err for it.
#[test]
fn cancelled_deferred_reply_sends_response_err() {
    let dispatch = Dispatch::new();
    let (event_loop, _, client, _) = pair(CodecVariant::Native, dispatch.clone());
    let slot: Rc<RefCell<Option<Deferred<Value>>>> = Rc::new(RefCell::new(None));
    let parked = slot.clone();
    let handler_loop = event_loop;
    dispatch.register("slow", move |_| {
        let deferred = Deferred::new(&handler_loop);
        *parked.borrow_mut() = Some(deferred.clone());
        Ok(Reply::Deferred(deferred))
    });
    let proxy = client.proxy().wait(None).unwrap();
    let call = proxy.begin_call("slow", vec![]);
    assert!(!call.completed());
    assert_eq!(proxy.pending(), 1);

    let handler_side = slot.borrow().clone().unwrap();
    handler_side.cancel().unwrap();
    match call.wait(None) {
        Err(Fail::RemoteError { payload }) => {
            assert!(payload.as_str().unwrap().contains("cancelled"));
        }
        other => panic!("expected a remote error, got {:?}", other),
    }
    assert_eq!(proxy.pending(), 0);
}

/// Tests that a response for an unknown id is dropped without touching
/// any in-flight call.
#[test]
fn spurious_response_is_dropped() {
    let (_, _, client, _) = pair(CodecVariant::Native, adder_dispatch());
    let proxy = client.proxy().wait(None).unwrap();
    let frame = NativeCodec::new()
        .encode(&Message::Response {
            id: 999,
            error: None,
            result: Value::from(1),
        })
        .unwrap();
    client.data(&frame);
    assert_eq!(proxy.pending(), 0);
    // The connection is still healthy.
    assert_eq!(proxy.call("add", vec![Value::from(1), Value::from(1)]).unwrap(), Value::from(2));
}

/// Tests that asking for the proxy before the connection is up queues a
/// waiter that connection_made resolves.
#[test]
fn proxy_waiters_resolve_on_connection_made() {
    let event_loop = EventLoop::new();
    let factory = ProtocolFactory::new(&event_loop, adder_dispatch(), CodecVariant::Native);
    let protocol = factory.build();
    let early = protocol.proxy();
    assert!(!early.completed());
    protocol.connection_made(MockTransport::new());
    let proxy = early.wait(None).unwrap();
    assert_eq!(proxy.pending(), 0);
}

/// Tests that a lost connection fails in-flight calls and later proxy
/// requests with ConnectionLost.
#[test]
fn connection_lost_fails_everything() {
    let dispatch = Dispatch::new();
    let (event_loop, factory, client, _) = pair(CodecVariant::Native, dispatch.clone());
    dispatch.register("never", {
        move |_| Ok(Reply::Deferred(Deferred::new(&event_loop)))
    });
    let proxy = client.proxy().wait(None).unwrap();
    let call = proxy.begin_call("never", vec![]);
    assert_eq!(proxy.pending(), 1);

    client.connection_lost(None);
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(call.wait(None), Err(Fail::ConnectionLost { .. })));
    assert_eq!(proxy.pending(), 0);
    assert!(matches!(
        client.proxy().wait(None),
        Err(Fail::ConnectionLost { .. })
    ));
    // The factory slot is vacated.
    assert_eq!(factory.connections(), 1);
}

//==============================================================================
// Factory
//==============================================================================

/// Tests that losing a connection leaves surviving indices untouched.
#[test]
fn factory_indices_are_stable() {
    let event_loop = EventLoop::new();
    let factory = ProtocolFactory::new(&event_loop, Dispatch::new(), CodecVariant::Native);
    let first = factory.build();
    let second = factory.build();
    let third = factory.build();
    assert_eq!((first.index(), second.index(), third.index()), (0, 1, 2));

    second.connection_lost(None);
    assert_eq!(factory.connections(), 2);
    assert_eq!(first.index(), 0);
    assert_eq!(third.index(), 2);

    // The vacated slot fails fast; the survivors still answer.
    assert!(matches!(
        factory.proxy(1).wait(None),
        Err(Fail::ConnectionLost { .. })
    ));
    // A later build appends; it never reuses the vacated slot.
    let fourth = factory.build();
    assert_eq!(fourth.index(), 3);
}

/// Tests that an out-of-range index fails rather than panicking.
#[test]
fn factory_unknown_index_fails() {
    let event_loop = EventLoop::new();
    let factory = ProtocolFactory::new(&event_loop, Dispatch::new(), CodecVariant::Native);
    assert!(matches!(
        factory.proxy(17).wait(None),
        Err(Fail::ConnectionLost { .. })
    ));
}

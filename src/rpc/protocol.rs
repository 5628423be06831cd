// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::{
    dispatch::{Dispatch, Reply},
    factory::WeakFactory,
    proxy::Proxy,
};
use crate::{
    codec::{CodecVariant, Message, Value, WireCodec},
    deferred::{Deferred, Step},
    event::EventLoop,
    fail::Fail,
};
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// The byte transport a protocol writes to. Implemented by
/// [Connection](crate::net::Connection); tests substitute their own.
pub trait Transport {
    /// Hands bytes to the transport. Unsent bytes are queued; the call does
    /// not wait for the peer.
    fn send_bytes(&self, bytes: &[u8]) -> Result<(), Fail>;
    /// Closes the underlying stream. Idempotent.
    fn close(&self);
}

/// Connection lifecycle. Messages are exchanged only in `Open`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Init,
    Open,
    Closed,
}

struct Inner {
    event_loop: EventLoop,
    codec: Box<dyn WireCodec>,
    /// Shared with every protocol the factory builds; dropped on close.
    dispatch: Option<Dispatch>,
    factory: WeakFactory,
    /// Built when the connection comes up.
    proxy: Option<Proxy>,
    /// Callers that asked for the proxy before the connection was up.
    proxy_waiters: Vec<Deferred<Proxy>>,
    transport: Option<Rc<dyn Transport>>,
    state: ConnectionState,
    /// Slot in the factory's connection list; stable for our lifetime.
    index: usize,
}

/// Per-connection protocol engine: demultiplexes inbound frames into
/// requests, notifies, and responses, dispatches and replies, and owns the
/// outbound [Proxy].
#[derive(Clone)]
pub struct RpcProtocol {
    inner: Rc<RefCell<Inner>>,
}

/// Weak handle used by the proxy to reach its owning protocol.
pub(crate) struct WeakRpcProtocol {
    inner: Weak<RefCell<Inner>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl WeakRpcProtocol {
    pub(crate) fn upgrade(&self) -> Option<RpcProtocol> {
        self.inner.upgrade().map(|inner| RpcProtocol { inner })
    }
}

/// Associate functions for [RpcProtocol].
impl RpcProtocol {
    pub(crate) fn new(
        event_loop: &EventLoop,
        dispatch: Dispatch,
        variant: CodecVariant,
        factory: WeakFactory,
        index: usize,
    ) -> Self {
        let inner = Inner {
            event_loop: event_loop.clone(),
            codec: variant.build(),
            dispatch: Some(dispatch),
            factory,
            proxy: None,
            proxy_waiters: Vec::new(),
            transport: None,
            state: ConnectionState::Init,
            index,
        };
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    fn downgrade(&self) -> WeakRpcProtocol {
        WeakRpcProtocol {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.borrow().state
    }

    pub(crate) fn index(&self) -> usize {
        self.inner.borrow().index
    }

    /// Binds the protocol to its transport and opens the connection. The
    /// proxy comes up here, and everyone who asked for it early is
    /// resolved.
    pub fn connection_made(&self, transport: Rc<dyn Transport>) {
        let (proxy, waiters) = {
            let mut inner = self.inner.borrow_mut();
            inner.transport = Some(transport);
            inner.state = ConnectionState::Open;
            let proxy = Proxy::new(&inner.event_loop, self.downgrade());
            inner.proxy = Some(proxy.clone());
            (proxy, std::mem::take(&mut inner.proxy_waiters))
        };
        for waiter in waiters {
            let _ = waiter.succeed(proxy.clone());
        }
    }

    /// Returns a [Deferred] for this connection's proxy: resolved now when
    /// the connection is open, queued until `connection_made` while still
    /// connecting, failed once the connection is gone.
    pub fn proxy(&self) -> Deferred<Proxy> {
        let mut inner = self.inner.borrow_mut();
        let event_loop = inner.event_loop.clone();
        match inner.state {
            ConnectionState::Open => match &inner.proxy {
                Some(proxy) => Deferred::succeeded(&event_loop, proxy.clone()),
                None => Deferred::failed(
                    &event_loop,
                    Fail::Invalid {
                        details: "open connection without a proxy",
                    },
                ),
            },
            ConnectionState::Init => {
                let deferred = Deferred::new(&event_loop);
                inner.proxy_waiters.push(deferred.clone());
                deferred
            }
            ConnectionState::Closed => Deferred::failed(
                &event_loop,
                Fail::ConnectionLost {
                    details: "connection is closed",
                },
            ),
        }
    }

    /// Feeds raw transport bytes through the codec and handles every
    /// complete message. A codec failure is fatal to the connection.
    pub fn data(&self, bytes: &[u8]) {
        let decoded = {
            let mut inner = self.inner.borrow_mut();
            if inner.state != ConnectionState::Open {
                debug!("discarding {} bytes on a non-open connection", bytes.len());
                return;
            }
            inner.codec.feed(bytes)
        };
        match decoded {
            Ok(messages) => {
                for message in messages {
                    self.handle_message(message);
                }
            }
            Err(error) => {
                warn!("codec failure, dropping connection: {}", error);
                self.connection_lost(Some(error));
            }
        }
    }

    fn handle_message(&self, message: Message) {
        match message {
            Message::Response { id, error, result } => {
                let proxy = self.inner.borrow().proxy.clone();
                match proxy {
                    Some(proxy) => proxy.handle_response(id, error, result),
                    None => debug!("dropping response {} without a proxy", id),
                }
            }
            Message::Notify { method, params } => self.handle_notify(&method, params),
            Message::Request { id, method, params } => self.handle_request(id, &method, params),
        }
    }

    /// A notify dispatches and never replies, regardless of how the
    /// handler fares.
    fn handle_notify(&self, method: &str, params: Vec<Value>) {
        let dispatch = self.inner.borrow().dispatch.clone();
        let dispatch = match dispatch {
            Some(dispatch) => dispatch,
            None => return,
        };
        match dispatch.call(method, params) {
            Ok(Reply::Value(_)) => {}
            Ok(Reply::Deferred(deferred)) => {
                let name = method.to_string();
                deferred.add_failure(move |error| {
                    warn!("notify handler {} failed: {}", name, error);
                    Ok(Step::Done(Value::Nil))
                });
            }
            Err(error) => warn!("notify handler {} failed: {}", method, error),
        }
    }

    fn handle_request(&self, id: u64, method: &str, params: Vec<Value>) {
        let dispatch = self.inner.borrow().dispatch.clone();
        let dispatch = match dispatch {
            Some(dispatch) => dispatch,
            None => return,
        };
        match dispatch.call(method, params) {
            Ok(Reply::Value(result)) => self.send_response(id, None, result),
            Ok(Reply::Deferred(deferred)) => {
                let on_ok = self.clone();
                let on_err = self.clone();
                deferred.add_both(
                    move |result: Value| {
                        on_ok.send_response(id, None, result.clone());
                        Ok(Step::Done(result))
                    },
                    move |error: Fail| {
                        // Cancellation is a terminal failure like any
                        // other; the caller still gets an answer.
                        on_err.send_response(id, Some(error_payload(&error)), Value::Nil);
                        Err(error)
                    },
                );
            }
            Err(error) => self.send_response(id, Some(error_payload(&error)), Value::Nil),
        }
    }

    fn send_response(&self, id: u64, error: Option<Value>, result: Value) {
        let message = Message::Response { id, error, result };
        if let Err(error) = self.send_message(&message) {
            warn!("failed to send response for request {}: {}", id, error);
        }
    }

    /// Encodes and hands one message to the transport.
    pub(crate) fn send_message(&self, message: &Message) -> Result<(), Fail> {
        let (bytes, transport) = {
            let inner = self.inner.borrow();
            if inner.state != ConnectionState::Open {
                return Err(Fail::ConnectionLost {
                    details: "send on a non-open connection",
                });
            }
            let transport = match &inner.transport {
                Some(transport) => transport.clone(),
                None => {
                    return Err(Fail::ConnectionLost {
                        details: "connection has no transport",
                    })
                }
            };
            (inner.codec.encode(message)?, transport)
        };
        transport.send_bytes(&bytes)
    }

    /// Tears the connection down exactly once: the factory slot is
    /// vacated, every in-flight call and queued proxy waiter fails with
    /// [Fail::ConnectionLost], and the dispatcher reference is dropped.
    pub fn connection_lost(&self, reason: Option<Fail>) {
        let (proxy, waiters, transport, factory) = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == ConnectionState::Closed {
                return;
            }
            inner.state = ConnectionState::Closed;
            inner.dispatch = None;
            (
                inner.proxy.take(),
                std::mem::take(&mut inner.proxy_waiters),
                inner.transport.take(),
                inner.factory.clone(),
            )
        };
        match &reason {
            Some(error) => warn!("connection lost: {}", error),
            None => info!("connection closed"),
        }
        let error = Fail::ConnectionLost {
            details: "connection closed before completion",
        };
        for waiter in waiters {
            let _ = waiter.fail(error.clone());
        }
        if let Some(proxy) = proxy {
            proxy.fail_all(error);
        }
        if let Some(transport) = transport {
            transport.close();
        }
        if let Some(factory) = factory.upgrade() {
            factory.lost_connection(self);
        }
    }
}

/// The error payload sent to the peer when a dispatched request fails.
/// Native marshalling loses type information, so both codecs normalize to
/// the error's rendered text.
fn error_payload(error: &Fail) -> Value {
    Value::from(error.to_string())
}

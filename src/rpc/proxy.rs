// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::protocol::WeakRpcProtocol;
use crate::{
    codec::{Message, Value},
    deferred::Deferred,
    event::EventLoop,
    fail::Fail,
};
use std::{cell::RefCell, collections::HashMap, rc::Rc, time::Duration};

//==============================================================================
// Constants & Structures
//==============================================================================

struct Inner {
    event_loop: EventLoop,
    /// The owning protocol; weak, since the protocol owns the proxy.
    protocol: WeakRpcProtocol,
    /// Next request id. Monotonic; never reused within a connection.
    next_request: u64,
    /// In-flight calls awaiting a response.
    requests: HashMap<u64, Deferred<Value>>,
    /// Default timeout applied by blocking [Proxy::call]s.
    timeout: Option<Duration>,
}

/// Client-side view of the peer's dispatcher: issues calls and notifies on
/// one connection and matches responses back to their [Deferred]s by id.
#[derive(Clone)]
pub struct Proxy {
    inner: Rc<RefCell<Inner>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Proxy].
impl Proxy {
    pub(crate) fn new(event_loop: &EventLoop, protocol: WeakRpcProtocol) -> Self {
        let inner = Inner {
            event_loop: event_loop.clone(),
            protocol,
            next_request: 0,
            requests: HashMap::new(),
            timeout: None,
        };
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    /// Sets the default timeout for blocking [call](Self::call)s.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.borrow_mut().timeout = timeout;
    }

    /// Calls a remote method and blocks (driving the loop) until its
    /// response arrives or the proxy's default timeout elapses.
    pub fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, Fail> {
        let timeout = self.inner.borrow().timeout;
        self.begin_call(method, params).wait(timeout)
    }

    /// Sends a one-way notification. Returns once the frame has been
    /// handed to the transport; no id is allocated and no response is
    /// ever expected.
    pub fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), Fail> {
        self.send(&Message::Notify {
            method: method.to_string(),
            params,
        })
    }

    /// Starts a remote call, returning the [Deferred] its response will
    /// complete. The in-flight entry is recorded before the frame is sent
    /// so an immediate response can never miss it.
    pub fn begin_call(&self, method: &str, params: Vec<Value>) -> Deferred<Value> {
        let (id, deferred, message) = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_request;
            inner.next_request += 1;
            let deferred = Deferred::new(&inner.event_loop);
            inner.requests.insert(id, deferred.clone());
            let message = Message::Request {
                id,
                method: method.to_string(),
                params,
            };
            (id, deferred, message)
        };
        if let Err(error) = self.send(&message) {
            self.inner.borrow_mut().requests.remove(&id);
            let _ = deferred.fail(error);
        }
        deferred
    }

    /// Starts a one-way notification. The returned [Deferred] is already
    /// completed with nil once the frame has been handed to the transport.
    pub fn begin_notify(&self, method: &str, params: Vec<Value>) -> Deferred<Value> {
        let event_loop = self.inner.borrow().event_loop.clone();
        match self.notify(method, params) {
            Ok(()) => Deferred::succeeded(&event_loop, Value::Nil),
            Err(error) => Deferred::failed(&event_loop, error),
        }
    }

    /// Number of in-flight calls.
    pub fn pending(&self) -> usize {
        self.inner.borrow().requests.len()
    }

    fn send(&self, message: &Message) -> Result<(), Fail> {
        let protocol = self.inner.borrow().protocol.upgrade();
        match protocol {
            Some(protocol) => protocol.send_message(message),
            None => Err(Fail::ConnectionLost {
                details: "protocol is gone",
            }),
        }
    }

    /// Routes an inbound response to the matching in-flight call. A
    /// response for an unknown id is dropped; the call may have been
    /// cancelled locally and its entry already released.
    pub(crate) fn handle_response(&self, id: u64, error: Option<Value>, result: Value) {
        let entry = self.inner.borrow_mut().requests.remove(&id);
        let deferred = match entry {
            Some(deferred) => deferred,
            None => {
                debug!("dropping response for unknown request {}", id);
                return;
            }
        };
        let outcome = match error {
            Some(payload) => deferred.fail(Fail::RemoteError { payload }),
            None => deferred.succeed(result),
        };
        if let Err(error) = outcome {
            // The deferred was cancelled after the entry was recorded.
            debug!("response for request {} ignored: {}", id, error);
        }
    }

    /// Fails every in-flight call; invoked when the connection dies so no
    /// caller waits forever.
    pub(crate) fn fail_all(&self, error: Fail) {
        let requests: Vec<Deferred<Value>> = {
            let mut inner = self.inner.borrow_mut();
            inner.requests.drain().map(|(_, deferred)| deferred).collect()
        };
        for deferred in requests {
            let _ = deferred.fail(error.clone());
        }
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::{dispatch::Dispatch, protocol::RpcProtocol, proxy::Proxy};
use crate::{codec::CodecVariant, deferred::Deferred, event::EventLoop, fail::Fail};
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

//==============================================================================
// Constants & Structures
//==============================================================================

struct Inner {
    event_loop: EventLoop,
    dispatch: Dispatch,
    variant: CodecVariant,
    /// Sparse list of live protocols indexed by connection number. Slots
    /// are vacated on loss and never shifted or reused, so an index handed
    /// out once stays valid for that connection's lifetime.
    protocols: Vec<Option<RpcProtocol>>,
}

/// Builds one protocol per connection and exposes their proxies by
/// connection index.
#[derive(Clone)]
pub struct ProtocolFactory {
    inner: Rc<RefCell<Inner>>,
}

/// Back-reference handle protocols hold on their factory.
#[derive(Clone)]
pub(crate) struct WeakFactory {
    inner: Weak<RefCell<Inner>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl WeakFactory {
    pub(crate) fn upgrade(&self) -> Option<ProtocolFactory> {
        self.inner.upgrade().map(|inner| ProtocolFactory { inner })
    }
}

/// Associate functions for [ProtocolFactory].
impl ProtocolFactory {
    /// Creates a factory producing `variant` protocols that share
    /// `dispatch`.
    pub fn new(event_loop: &EventLoop, dispatch: Dispatch, variant: CodecVariant) -> Self {
        let inner = Inner {
            event_loop: event_loop.clone(),
            dispatch,
            variant,
            protocols: Vec::new(),
        };
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    fn downgrade(&self) -> WeakFactory {
        WeakFactory {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Constructs a protocol for a fresh connection and assigns it the
    /// next connection index.
    pub fn build(&self) -> RpcProtocol {
        let mut inner = self.inner.borrow_mut();
        let index = inner.protocols.len();
        let protocol = RpcProtocol::new(
            &inner.event_loop,
            inner.dispatch.clone(),
            inner.variant,
            self.downgrade(),
            index,
        );
        inner.protocols.push(Some(protocol.clone()));
        protocol
    }

    /// Returns a [Deferred] for the proxy of connection `index`. A vacant
    /// or unknown index fails with [Fail::ConnectionLost]; stale indices
    /// are a reachable condition, not a programming error.
    pub fn proxy(&self, index: usize) -> Deferred<Proxy> {
        let (event_loop, slot) = {
            let inner = self.inner.borrow();
            let slot = inner.protocols.get(index).cloned().flatten();
            (inner.event_loop.clone(), slot)
        };
        match slot {
            Some(protocol) => protocol.proxy(),
            None => Deferred::failed(
                &event_loop,
                Fail::ConnectionLost {
                    details: "no such connection",
                },
            ),
        }
    }

    /// Vacates a lost protocol's slot. Surviving indices do not move.
    pub fn lost_connection(&self, protocol: &RpcProtocol) {
        let mut inner = self.inner.borrow_mut();
        let index = protocol.index();
        if let Some(slot) = inner.protocols.get_mut(index) {
            *slot = None;
        }
    }

    /// Number of live connections.
    pub fn connections(&self) -> usize {
        let inner = self.inner.borrow();
        inner.protocols.iter().filter(|slot| slot.is_some()).count()
    }
}

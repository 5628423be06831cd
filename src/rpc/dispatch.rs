// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::{codec::Value, deferred::Deferred, fail::Fail};
use std::{cell::RefCell, collections::HashMap, rc::Rc};

//==============================================================================
// Constants & Structures
//==============================================================================

/// What a dispatched handler produces: either an immediate value or a
/// [Deferred] that completes later.
pub enum Reply {
    Value(Value),
    Deferred(Deferred<Value>),
}

/// A registered method handler.
pub type Handler = Rc<dyn Fn(Vec<Value>) -> Result<Reply, Fail>>;

/// One remotely callable method exported by a [Remote] object. `hints` is
/// an optional human-readable parameter-type tag list carried for tooling;
/// it is not enforced at call time.
pub struct Export {
    pub name: String,
    pub hints: Option<Vec<&'static str>>,
    pub handler: Handler,
}

/// Implemented by objects whose methods should be callable remotely; see
/// [Dispatch::scan].
pub trait Remote {
    fn exports(&self) -> Vec<Export>;
}

struct Inner {
    methods: HashMap<String, Handler>,
}

/// Method dispatcher: a name-to-handler registry. Mutated at setup time,
/// read-only on the hot path.
#[derive(Clone)]
pub struct Dispatch {
    inner: Rc<RefCell<Inner>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Dispatch].
impl Dispatch {
    /// Creates an empty dispatcher.
    pub fn new() -> Self {
        let inner = Inner {
            methods: HashMap::new(),
        };
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    /// Binds a handler under `name`. The last registration for a name wins.
    pub fn register<F>(&self, name: &str, handler: F)
    where
        F: Fn(Vec<Value>) -> Result<Reply, Fail> + 'static,
    {
        self.register_handler(name, Rc::new(handler));
    }

    /// Binds an already-shared handler under `name`.
    pub fn register_handler(&self, name: &str, handler: Handler) {
        let mut inner = self.inner.borrow_mut();
        inner.methods.insert(name.to_string(), handler);
    }

    /// Registers every method a [Remote] object exports. Purely a
    /// setup-time convenience.
    pub fn scan(&self, object: &dyn Remote) {
        for export in object.exports() {
            self.register_handler(&export.name, export.handler);
        }
    }

    /// Looks up and invokes a method by name.
    pub fn call(&self, method: &str, params: Vec<Value>) -> Result<Reply, Fail> {
        let handler = {
            let inner = self.inner.borrow();
            inner.methods.get(method).cloned()
        };
        match handler {
            Some(handler) => handler(params),
            None => Err(Fail::UnknownMethod {
                method: method.to_string(),
            }),
        }
    }

    /// True when a handler is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.borrow().methods.contains_key(name)
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Default trait implementation for [Dispatch].
impl Default for Dispatch {
    fn default() -> Self {
        Self::new()
    }
}

/// From trait implementation for [Reply].
impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Value(value)
    }
}

/// From trait implementation for [Reply].
impl From<Deferred<Value>> for Reply {
    fn from(deferred: Deferred<Value>) -> Self {
        Reply::Deferred(deferred)
    }
}

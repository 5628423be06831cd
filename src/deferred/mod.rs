// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Single-assignment result cell with chained callbacks.
//!
//! A [Deferred] starts out pending and is completed exactly once with
//! [succeed](Deferred::succeed), [fail](Deferred::fail), or
//! [cancel](Deferred::cancel). Success and failure handlers appended with
//! [add_success](Deferred::add_success) / [add_failure](Deferred::add_failure)
//! form an ordered chain: each handler transforms the current outcome, a
//! failure skips forward to the next failure handler, and a failure handler
//! that returns normally recovers the chain back to success. A handler may
//! return another Deferred, which pauses the chain until the inner cell
//! terminates. Chain execution is always scheduled through the event loop,
//! never run inline, so completion sites never observe reentrant callbacks.


use crate::{event::EventLoop, fail::Fail};
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
    time::Duration,
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// What a chain handler hands back to the chain.
pub enum Step<T: Clone + 'static> {
    /// Continue the chain with this value.
    Done(T),
    /// Pause the chain until this inner cell terminates, then adopt its
    /// outcome.
    Wait(Deferred<T>),
}

type SuccessFn<T> = Box<dyn FnOnce(T) -> Result<Step<T>, Fail>>;
type FailureFn<T> = Box<dyn FnOnce(Fail) -> Result<Step<T>, Fail>>;

struct HandlerPair<T: Clone + 'static> {
    on_success: Option<SuccessFn<T>>,
    on_failure: Option<FailureFn<T>>,
}

/// The current chain value. `Pending` doubles as the placeholder while a
/// handler is running or the chain is paused on an inner cell.
enum State<T> {
    Pending,
    Ok(T),
    Err(Fail),
}

struct Inner<T: Clone + 'static> {
    event_loop: EventLoop,
    state: State<T>,
    /// Set by the first terminal write; later writes are rejected.
    fired: bool,
    cancelled: bool,
    /// True while the chain is parked on an inner Deferred.
    paused: bool,
    /// True while a chain resumption sits in the loop's ready queue.
    scheduled: bool,
    /// True once some handler or waiter has observed the outcome.
    consumed: bool,
    chain: VecDeque<HandlerPair<T>>,
    cancel_notify: Option<Box<dyn FnOnce()>>,
}

/// Deferred result cell. Cloning yields another handle to the same cell.
pub struct Deferred<T: Clone + 'static> {
    inner: Rc<RefCell<Inner<T>>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Deferred].
impl<T: Clone + 'static> Deferred<T> {
    /// Creates a pending cell bound to `event_loop`.
    pub fn new(event_loop: &EventLoop) -> Self {
        Self::with_state(event_loop, State::Pending, false)
    }

    /// Creates a cell already completed with `value`. Handlers added later
    /// still run asynchronously.
    pub fn succeeded(event_loop: &EventLoop, value: T) -> Self {
        Self::with_state(event_loop, State::Ok(value), true)
    }

    /// Creates a cell already completed with `error`.
    pub fn failed(event_loop: &EventLoop, error: Fail) -> Self {
        Self::with_state(event_loop, State::Err(error), true)
    }

    fn with_state(event_loop: &EventLoop, state: State<T>, fired: bool) -> Self {
        let inner = Inner {
            event_loop: event_loop.clone(),
            state,
            fired,
            cancelled: false,
            paused: false,
            scheduled: false,
            consumed: false,
            chain: VecDeque::new(),
            cancel_notify: None,
        };
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    /// Appends a success handler. Skipped while the chain carries a failure.
    pub fn add_success<F>(&self, on_success: F) -> &Self
    where
        F: FnOnce(T) -> Result<Step<T>, Fail> + 'static,
    {
        self.push_pair(Some(Box::new(on_success)), None);
        self
    }

    /// Appends a failure handler. A normal return recovers the chain back
    /// to success; returning the error (or another) keeps it failing.
    pub fn add_failure<F>(&self, on_failure: F) -> &Self
    where
        F: FnOnce(Fail) -> Result<Step<T>, Fail> + 'static,
    {
        self.push_pair(None, Some(Box::new(on_failure)));
        self
    }

    /// Appends a success and a failure handler as one chain link.
    pub fn add_both<S, F>(&self, on_success: S, on_failure: F) -> &Self
    where
        S: FnOnce(T) -> Result<Step<T>, Fail> + 'static,
        F: FnOnce(Fail) -> Result<Step<T>, Fail> + 'static,
    {
        self.push_pair(Some(Box::new(on_success)), Some(Box::new(on_failure)));
        self
    }

    /// Installs the cancellation notifier, invoked once if cancellation
    /// wins the race to complete the cell.
    pub fn on_cancel<F: FnOnce() + 'static>(&self, notify: F) {
        let mut inner = self.inner.borrow_mut();
        inner.cancel_notify = Some(Box::new(notify));
    }

    fn push_pair(&self, on_success: Option<SuccessFn<T>>, on_failure: Option<FailureFn<T>>) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.chain.push_back(HandlerPair {
                on_success,
                on_failure,
            });
        }
        // A handler added after completion still runs, asynchronously.
        self.schedule_chain();
    }

    /// Completes the cell with a value and kicks off the chain.
    pub fn succeed(&self, value: T) -> Result<(), Fail> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.cancelled {
                return Err(Fail::Cancelled {});
            }
            if inner.fired {
                return Err(Fail::AlreadyCalled {});
            }
            inner.fired = true;
            inner.state = State::Ok(value);
        }
        self.schedule_chain();
        Ok(())
    }

    /// Completes the cell with a failure and kicks off the chain.
    pub fn fail(&self, error: Fail) -> Result<(), Fail> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.cancelled {
                return Err(Fail::Cancelled {});
            }
            if inner.fired {
                return Err(Fail::AlreadyCalled {});
            }
            inner.fired = true;
            inner.state = State::Err(error);
        }
        self.schedule_chain();
        Ok(())
    }

    /// Cancels a pending cell: the notifier (if any) runs once and the
    /// chain enters failure propagation with [Fail::Cancelled].
    pub fn cancel(&self) -> Result<(), Fail> {
        let notify = {
            let mut inner = self.inner.borrow_mut();
            if inner.fired {
                return Err(Fail::AlreadyCalled {});
            }
            inner.fired = true;
            inner.cancelled = true;
            inner.state = State::Err(Fail::Cancelled {});
            inner.cancel_notify.take()
        };
        if let Some(notify) = notify {
            notify();
        }
        self.schedule_chain();
        Ok(())
    }

    /// True once the cell has been completed (or cancelled).
    pub fn completed(&self) -> bool {
        self.inner.borrow().fired
    }

    /// Blocks the caller by driving the event loop until the chain has
    /// settled or `timeout` elapses. A timeout surfaces [Fail::Timeout]
    /// without touching the cell; a later completion still lands normally.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<T, Fail> {
        let event_loop = self.inner.borrow().event_loop.clone();
        let timed_out = Rc::new(Cell::new(false));
        let timer = timeout.map(|delay| {
            let flag = timed_out.clone();
            event_loop.schedule_timer(delay, move || flag.set(true))
        });
        while !self.settled() {
            if timed_out.get() {
                return Err(Fail::Timeout {});
            }
            if !event_loop.run_once() {
                // No wake source left that could ever complete this cell.
                if let Some(timer) = timer {
                    event_loop.cancel_timer(timer);
                }
                return Err(Fail::Invalid {
                    details: "wait on an idle event loop",
                });
            }
        }
        if let Some(timer) = timer {
            event_loop.cancel_timer(timer);
        }
        let mut inner = self.inner.borrow_mut();
        inner.consumed = true;
        match &inner.state {
            State::Ok(value) => Ok(value.clone()),
            State::Err(error) => Err(error.clone()),
            State::Pending => Err(Fail::Invalid {
                details: "settled deferred left pending",
            }),
        }
    }

    /// The chain has fully run: completed, not parked on an inner cell,
    /// and no handlers left to apply.
    fn settled(&self) -> bool {
        let inner = self.inner.borrow();
        inner.fired && !inner.paused && inner.chain.is_empty()
    }

    /// Queues a chain resumption on the loop unless one is already queued
    /// or the chain cannot make progress yet.
    fn schedule_chain(&self) {
        let event_loop = {
            let mut inner = self.inner.borrow_mut();
            if !inner.fired || inner.paused || inner.scheduled || inner.chain.is_empty() {
                return;
            }
            inner.scheduled = true;
            inner.event_loop.clone()
        };
        let this = self.clone();
        event_loop.schedule(move || {
            this.inner.borrow_mut().scheduled = false;
            this.run_chain();
        });
    }

    /// Applies handler pairs in registration order until the chain drains
    /// or parks on an inner Deferred. Handlers run without any cell borrow
    /// held, so they are free to append further handlers.
    fn run_chain(&self) {
        loop {
            let (state, pair) = {
                let mut inner = self.inner.borrow_mut();
                if !inner.fired || inner.paused || inner.chain.is_empty() {
                    return;
                }
                let pair = match inner.chain.pop_front() {
                    Some(pair) => pair,
                    None => return,
                };
                let state = std::mem::replace(&mut inner.state, State::Pending);
                (state, pair)
            };
            let outcome = match state {
                State::Ok(value) => match pair.on_success {
                    Some(on_success) => {
                        self.mark_consumed();
                        on_success(value)
                    }
                    // No success slot: the value passes through untouched.
                    None => Ok(Step::Done(value)),
                },
                State::Err(error) => match pair.on_failure {
                    Some(on_failure) => {
                        self.mark_consumed();
                        on_failure(error)
                    }
                    None => Err(error),
                },
                State::Pending => return,
            };
            match outcome {
                Ok(Step::Done(value)) => {
                    self.inner.borrow_mut().state = State::Ok(value);
                }
                Err(error) => {
                    self.inner.borrow_mut().state = State::Err(error);
                }
                Ok(Step::Wait(awaited)) => {
                    {
                        let mut inner = self.inner.borrow_mut();
                        inner.paused = true;
                    }
                    let adopt_ok = self.clone();
                    let adopt_err = self.clone();
                    awaited.add_both(
                        move |value: T| {
                            adopt_ok.adopt(State::Ok(value.clone()));
                            Ok(Step::Done(value))
                        },
                        move |error: Fail| {
                            adopt_err.adopt(State::Err(error.clone()));
                            Err(error)
                        },
                    );
                    return;
                }
            }
        }
    }

    /// Adopts the outcome of an awaited inner cell and resumes the chain.
    fn adopt(&self, state: State<T>) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.state = state;
            inner.paused = false;
        }
        self.schedule_chain();
    }

    fn mark_consumed(&self) {
        self.inner.borrow_mut().consumed = true;
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Clone trait implementation for [Deferred].
impl<T: Clone + 'static> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A failure nobody looked at is almost always a bug in the caller; this
/// is the safety net that surfaces it.
impl<T: Clone + 'static> Drop for Inner<T> {
    fn drop(&mut self) {
        if !self.consumed {
            if let State::Err(error) = &self.state {
                error!("deferred dropped with unobserved failure: {}", error);
            }
        }
    }
}

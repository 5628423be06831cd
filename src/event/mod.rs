// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Single-threaded event-loop reactor. The loop owns three wake sources:
//! a FIFO queue of zero-delay callbacks, one-shot timers, and fd readiness
//! watchers driven by `poll(2)`. Everything in this crate (protocol
//! callbacks, deferred chains, dispatched handlers) runs on the loop
//! thread; ordering is by FIFO queuing of loop events.

#[cfg(test)]
mod tests;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use slab::Slab;
use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    os::unix::io::RawFd,
    rc::Rc,
    time::{Duration, Instant},
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Readiness kinds a watcher may subscribe to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
}

/// The readiness kind a watcher callback is invoked with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Readiness {
    Readable,
    Writable,
}

/// Handle for a one-shot timer. A fired or cancelled handle is inert.
#[derive(Clone, Copy, Debug)]
pub struct TimerHandle {
    deadline: Instant,
    seq: u64,
}

/// Handle for a registered fd watcher.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WatcherHandle(usize);

type ReadyCallback = Box<dyn FnOnce()>;
type WatcherCallback = Rc<RefCell<dyn FnMut(Readiness)>>;

struct Watcher {
    fd: RawFd,
    interest: Interest,
    callback: WatcherCallback,
}

struct Inner {
    ready: VecDeque<ReadyCallback>,
    timers: BTreeMap<(Instant, u64), ReadyCallback>,
    timer_seq: u64,
    watchers: Slab<Watcher>,
    running: bool,
}

/// Event Loop
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<RefCell<Inner>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Interest {
    fn wants_read(self) -> bool {
        matches!(self, Interest::Read | Interest::ReadWrite)
    }

    fn wants_write(self) -> bool {
        matches!(self, Interest::Write | Interest::ReadWrite)
    }
}

/// Associate functions for [EventLoop].
impl EventLoop {
    /// Creates an event loop with no registered sources.
    pub fn new() -> Self {
        let inner = Inner {
            ready: VecDeque::new(),
            timers: BTreeMap::new(),
            timer_seq: 0,
            watchers: Slab::new(),
            running: false,
        };
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    /// Enqueues a callback to run on the next loop iteration. Callbacks run
    /// in FIFO order and never reentrantly with their scheduling site.
    pub fn schedule<F: FnOnce() + 'static>(&self, callback: F) {
        let mut inner = self.inner.borrow_mut();
        inner.ready.push_back(Box::new(callback));
    }

    /// Arms a one-shot timer that fires `delay` from now.
    pub fn schedule_timer<F: FnOnce() + 'static>(&self, delay: Duration, callback: F) -> TimerHandle {
        let mut inner = self.inner.borrow_mut();
        let deadline = Instant::now() + delay;
        let seq = inner.timer_seq;
        inner.timer_seq += 1;
        inner.timers.insert((deadline, seq), Box::new(callback));
        TimerHandle { deadline, seq }
    }

    /// Disarms a timer. Cancelling a fired or already-cancelled timer is a
    /// no-op.
    pub fn cancel_timer(&self, handle: TimerHandle) {
        let mut inner = self.inner.borrow_mut();
        inner.timers.remove(&(handle.deadline, handle.seq));
    }

    /// Registers a readiness watcher for `fd`. The callback is invoked once
    /// per readiness kind per loop iteration while the fd is ready.
    pub fn watch<F: FnMut(Readiness) + 'static>(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: F,
    ) -> WatcherHandle {
        let mut inner = self.inner.borrow_mut();
        let key = inner.watchers.insert(Watcher {
            fd,
            interest,
            callback: Rc::new(RefCell::new(callback)),
        });
        WatcherHandle(key)
    }

    /// Switches the readiness kinds a watcher subscribes to.
    pub fn modify(&self, handle: WatcherHandle, interest: Interest) {
        let mut inner = self.inner.borrow_mut();
        if let Some(watcher) = inner.watchers.get_mut(handle.0) {
            watcher.interest = interest;
        }
    }

    /// Deregisters a watcher. The fd itself is left open.
    pub fn unwatch(&self, handle: WatcherHandle) {
        let mut inner = self.inner.borrow_mut();
        if inner.watchers.contains(handle.0) {
            inner.watchers.remove(handle.0);
        }
    }

    /// Drives the loop until [stop](Self::stop) is called or no wake
    /// sources remain.
    pub fn run(&self) {
        self.inner.borrow_mut().running = true;
        loop {
            let has_work = self.run_once();
            let inner = self.inner.borrow();
            if !inner.running || !has_work {
                break;
            }
        }
        self.inner.borrow_mut().running = false;
    }

    /// Halts a running loop after the current iteration.
    pub fn stop(&self) {
        self.inner.borrow_mut().running = false;
    }

    /// Runs a single loop iteration: drains the ready queue, polls fd
    /// readiness with a timeout capped by the nearest timer deadline, then
    /// fires due timers. Returns false once no wake sources remain.
    ///
    /// Safe to call reentrantly from inside a callback; this is what makes
    /// blocking waits inside dispatched handlers possible.
    pub fn run_once(&self) -> bool {
        // Drain callbacks that are already due. Taking the whole batch out
        // of the cell first keeps the queue borrowable from inside them.
        let batch: Vec<ReadyCallback> = {
            let mut inner = self.inner.borrow_mut();
            inner.ready.drain(..).collect()
        };
        let had_ready = !batch.is_empty();
        for callback in batch {
            callback();
        }

        // Work out how long poll may sleep and which fds to ask about.
        let (mut pollfds, polled, timeout) = {
            let inner = self.inner.borrow();
            let timeout = if had_ready || !inner.ready.is_empty() {
                0
            } else {
                match inner.timers.keys().next() {
                    Some(&(deadline, _)) => {
                        let now = Instant::now();
                        if deadline <= now {
                            0
                        } else {
                            clamp_timeout(deadline - now)
                        }
                    }
                    None if inner.watchers.is_empty() => {
                        // Nothing can ever wake us up again.
                        return false;
                    }
                    None => -1,
                }
            };
            let mut pollfds: Vec<PollFd> = Vec::with_capacity(inner.watchers.len());
            let mut polled: Vec<(usize, RawFd)> = Vec::with_capacity(inner.watchers.len());
            for (key, watcher) in inner.watchers.iter() {
                let mut flags = PollFlags::empty();
                if watcher.interest.wants_read() {
                    flags.insert(PollFlags::POLLIN);
                }
                if watcher.interest.wants_write() {
                    flags.insert(PollFlags::POLLOUT);
                }
                pollfds.push(PollFd::new(watcher.fd, flags));
                polled.push((key, watcher.fd));
            }
            (pollfds, polled, timeout)
        };

        loop {
            match poll(&mut pollfds, timeout) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("poll failed ({:?})", e);
                    break;
                }
            }
        }

        // Collect readiness first, then invoke; a callback may deregister
        // any watcher, including itself.
        let mut fired: Vec<(usize, RawFd, Readiness)> = Vec::new();
        for (i, pollfd) in pollfds.iter().enumerate() {
            let revents = match pollfd.revents() {
                Some(r) => r,
                None => continue,
            };
            let (key, fd) = polled[i];
            let readable = PollFlags::POLLIN
                | PollFlags::POLLERR
                | PollFlags::POLLHUP
                | PollFlags::POLLNVAL;
            if revents.intersects(readable) {
                fired.push((key, fd, Readiness::Readable));
            }
            if revents.contains(PollFlags::POLLOUT) {
                fired.push((key, fd, Readiness::Writable));
            }
        }
        for (key, fd, readiness) in fired {
            let callback = {
                let inner = self.inner.borrow();
                match inner.watchers.get(key) {
                    // Guard against slot reuse within this iteration.
                    Some(watcher) if watcher.fd == fd => watcher.callback.clone(),
                    _ => continue,
                }
            };
            let borrow_result = callback.try_borrow_mut();
            match borrow_result {
                Ok(mut f) => (*f)(readiness),
                // The watcher is already running further up the stack
                // (nested run_once); level-triggered poll retries it.
                Err(_) => debug!("watcher for fd {} busy; deferring", fd),
            }
        }

        // Fire due timers.
        let due: Vec<ReadyCallback> = {
            let mut inner = self.inner.borrow_mut();
            let now = Instant::now();
            let mut due = Vec::new();
            loop {
                match inner.timers.first_key_value() {
                    Some((&(deadline, _), _)) if deadline <= now => {
                        if let Some((_, callback)) = inner.timers.pop_first() {
                            due.push(callback);
                        }
                    }
                    _ => break,
                }
            }
            due
        };
        for callback in due {
            callback();
        }

        let inner = self.inner.borrow();
        !inner.ready.is_empty() || !inner.timers.is_empty() || !inner.watchers.is_empty()
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Default trait implementation for [EventLoop].
impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a timer delay into a millisecond count poll(2) accepts,
/// rounding up so timers never fire early.
fn clamp_timeout(delay: Duration) -> libc::c_int {
    let millis = delay.as_millis().saturating_add(1);
    if millis > libc::c_int::MAX as u128 {
        libc::c_int::MAX
    } else {
        millis as libc::c_int
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::{
    event::{EventLoop, Interest, Readiness, WatcherHandle},
    fail::Fail,
    rpc::{RpcProtocol, Transport},
};
use bytes::{Buf, BytesMut};
use std::{
    cell::RefCell,
    io,
    io::{Read, Write},
    os::unix::io::AsRawFd,
    rc::Rc,
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Read size per readiness event.
const RECV_BUFFER_SIZE: usize = 16 * 1024;

/// A nonblocking byte stream the connection glue can drive. Both
/// `UnixStream` and `TcpStream` qualify.
pub trait Stream: io::Read + io::Write + AsRawFd {}

impl<T: io::Read + io::Write + AsRawFd> Stream for T {}

enum SendOutcome {
    Done,
    Queued,
    Failed(Fail),
}

struct Inner {
    event_loop: EventLoop,
    /// Taken on close so the fd is closed exactly once.
    stream: Option<Box<dyn Stream>>,
    protocol: Option<RpcProtocol>,
    watcher: Option<WatcherHandle>,
    /// Bytes accepted by `send_bytes` but not yet written out.
    outbuf: BytesMut,
    closed: bool,
}

/// Binds a protocol to a byte stream: feeds inbound bytes to the protocol
/// on readability and flushes queued outbound bytes on writability.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<RefCell<Inner>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Connection].
impl Connection {
    /// Takes ownership of a nonblocking stream and starts watching it for
    /// readability.
    pub fn new(event_loop: &EventLoop, stream: Box<dyn Stream>, protocol: RpcProtocol) -> Self {
        let fd = stream.as_raw_fd();
        let inner = Inner {
            event_loop: event_loop.clone(),
            stream: Some(stream),
            protocol: Some(protocol),
            watcher: None,
            outbuf: BytesMut::new(),
            closed: false,
        };
        let connection = Self {
            inner: Rc::new(RefCell::new(inner)),
        };
        let watched = connection.clone();
        let watcher = event_loop.watch(fd, Interest::Read, move |readiness| match readiness {
            Readiness::Readable => watched.on_readable(),
            Readiness::Writable => watched.on_writable(),
        });
        connection.inner.borrow_mut().watcher = Some(watcher);
        connection
    }

    /// Closes the connection and tells the protocol. Idempotent.
    pub fn close(&self) {
        self.teardown(None);
    }

    fn on_readable(&self) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let result = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            match inner.stream.as_mut() {
                Some(stream) => stream.read(&mut buf),
                None => return,
            }
        };
        match result {
            // Orderly shutdown by the peer.
            Ok(0) => self.teardown(None),
            Ok(nbytes) => {
                let protocol = self.inner.borrow().protocol.clone();
                if let Some(protocol) = protocol {
                    protocol.data(&buf[..nbytes]);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => self.teardown(Some(Fail::from(e))),
        }
    }

    fn on_writable(&self) {
        let outcome = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            let inner = &mut *inner;
            let stream = match inner.stream.as_mut() {
                Some(stream) => stream,
                None => return,
            };
            let mut failed = None;
            while !inner.outbuf.is_empty() {
                match stream.write(&inner.outbuf[..]) {
                    Ok(0) => {
                        failed = Some(Fail::Io {
                            details: "stream accepted no bytes".to_string(),
                        });
                        break;
                    }
                    Ok(nbytes) => inner.outbuf.advance(nbytes),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        failed = Some(Fail::from(e));
                        break;
                    }
                }
            }
            match failed {
                Some(error) => SendOutcome::Failed(error),
                None if inner.outbuf.is_empty() => SendOutcome::Done,
                None => SendOutcome::Queued,
            }
        };
        match outcome {
            SendOutcome::Done => self.set_interest(Interest::Read),
            SendOutcome::Queued => {}
            SendOutcome::Failed(error) => self.teardown(Some(error)),
        }
    }

    fn set_interest(&self, interest: Interest) {
        let (event_loop, watcher) = {
            let inner = self.inner.borrow();
            (inner.event_loop.clone(), inner.watcher)
        };
        if let Some(watcher) = watcher {
            event_loop.modify(watcher, interest);
        }
    }

    fn teardown(&self, reason: Option<Fail>) {
        let (event_loop, watcher, stream, protocol) = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            inner.closed = true;
            (
                inner.event_loop.clone(),
                inner.watcher.take(),
                inner.stream.take(),
                inner.protocol.take(),
            )
        };
        if let Some(watcher) = watcher {
            event_loop.unwatch(watcher);
        }
        // Dropping the stream closes the fd; this is the only place that
        // happens.
        drop(stream);
        if let Some(protocol) = protocol {
            protocol.connection_lost(reason);
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Transport trait implementation for [Connection].
impl Transport for Connection {
    /// Writes as much as the socket accepts right now and queues the rest,
    /// enabling write interest until the queue drains. Frames handed over
    /// in order go out in order.
    fn send_bytes(&self, bytes: &[u8]) -> Result<(), Fail> {
        let outcome = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return Err(Fail::ConnectionLost {
                    details: "connection is closed",
                });
            }
            let inner = &mut *inner;
            let stream = match inner.stream.as_mut() {
                Some(stream) => stream,
                None => {
                    return Err(Fail::ConnectionLost {
                        details: "connection has no stream",
                    })
                }
            };
            if !inner.outbuf.is_empty() {
                // Earlier bytes are still queued; preserve send order.
                inner.outbuf.extend_from_slice(bytes);
                SendOutcome::Queued
            } else {
                let mut written = 0;
                let mut failed = None;
                while written < bytes.len() {
                    match stream.write(&bytes[written..]) {
                        Ok(0) => {
                            failed = Some(Fail::Io {
                                details: "stream accepted no bytes".to_string(),
                            });
                            break;
                        }
                        Ok(nbytes) => written += nbytes,
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            failed = Some(Fail::from(e));
                            break;
                        }
                    }
                }
                match failed {
                    Some(error) => SendOutcome::Failed(error),
                    None if written < bytes.len() => {
                        inner.outbuf.extend_from_slice(&bytes[written..]);
                        SendOutcome::Queued
                    }
                    None => SendOutcome::Done,
                }
            }
        };
        match outcome {
            SendOutcome::Done => Ok(()),
            SendOutcome::Queued => {
                self.set_interest(Interest::ReadWrite);
                Ok(())
            }
            SendOutcome::Failed(error) => {
                self.teardown(Some(error.clone()));
                Err(error)
            }
        }
    }

    fn close(&self) {
        self.teardown(None);
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::{connection::Connection, wire};
use crate::{
    event::{EventLoop, Interest, WatcherHandle},
    fail::Fail,
    rpc::ProtocolFactory,
};
use std::{
    cell::RefCell,
    fs, io,
    net::{SocketAddr, TcpListener},
    os::unix::io::AsRawFd,
    os::unix::net::UnixListener,
    path::PathBuf,
    rc::Rc,
};

//==============================================================================
// Constants & Structures
//==============================================================================

struct UnixInner {
    event_loop: EventLoop,
    factory: ProtocolFactory,
    path: PathBuf,
    listener: Option<UnixListener>,
    watcher: Option<WatcherHandle>,
    connections: Vec<Connection>,
}

/// Accepts Unix-domain stream connections at a filesystem path; every
/// accepted stream gets its own factory-built protocol.
#[derive(Clone)]
pub struct UnixServer {
    inner: Rc<RefCell<UnixInner>>,
}

struct TcpInner {
    event_loop: EventLoop,
    factory: ProtocolFactory,
    host: String,
    port: u16,
    listener: Option<TcpListener>,
    watcher: Option<WatcherHandle>,
    connections: Vec<Connection>,
}

/// Accepts TCP stream connections at `(host, port)`.
#[derive(Clone)]
pub struct TcpServer {
    inner: Rc<RefCell<TcpInner>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [UnixServer].
impl UnixServer {
    /// Creates a server that will listen at `path`.
    pub fn new(event_loop: &EventLoop, factory: &ProtocolFactory, path: impl Into<PathBuf>) -> Self {
        let inner = UnixInner {
            event_loop: event_loop.clone(),
            factory: factory.clone(),
            path: path.into(),
            listener: None,
            watcher: None,
            connections: Vec::new(),
        };
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    /// Binds the listening socket and starts accepting.
    pub fn listen(&self) -> Result<(), Fail> {
        let (event_loop, path) = {
            let inner = self.inner.borrow();
            (inner.event_loop.clone(), inner.path.clone())
        };
        // Replace any stale socket file from an earlier run.
        let _ = fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        let fd = listener.as_raw_fd();
        self.inner.borrow_mut().listener = Some(listener);
        let server = self.clone();
        let watcher = event_loop.watch(fd, Interest::Read, move |_| server.on_acceptable());
        self.inner.borrow_mut().watcher = Some(watcher);
        info!("listening on {:?}", path);
        Ok(())
    }

    fn on_acceptable(&self) {
        loop {
            let accepted = {
                let inner = self.inner.borrow();
                match &inner.listener {
                    Some(listener) => listener.accept(),
                    None => return,
                }
            };
            match accepted {
                Ok((stream, _)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("failed to prepare accepted stream: {}", e);
                        continue;
                    }
                    let (event_loop, factory) = {
                        let inner = self.inner.borrow();
                        (inner.event_loop.clone(), inner.factory.clone())
                    };
                    let (connection, _) = wire(&event_loop, &factory, Box::new(stream));
                    self.inner.borrow_mut().connections.push(connection);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Stops accepting, closes every accepted connection, and removes the
    /// socket file.
    pub fn close(&self) {
        let (event_loop, watcher, listener, connections, path) = {
            let mut inner = self.inner.borrow_mut();
            (
                inner.event_loop.clone(),
                inner.watcher.take(),
                inner.listener.take(),
                std::mem::take(&mut inner.connections),
                inner.path.clone(),
            )
        };
        if let Some(watcher) = watcher {
            event_loop.unwatch(watcher);
        }
        drop(listener);
        for connection in connections {
            connection.close();
        }
        let _ = fs::remove_file(&path);
    }
}

/// Associate functions for [TcpServer].
impl TcpServer {
    /// Creates a server that will listen at `host:port`.
    pub fn new(event_loop: &EventLoop, factory: &ProtocolFactory, host: &str, port: u16) -> Self {
        let inner = TcpInner {
            event_loop: event_loop.clone(),
            factory: factory.clone(),
            host: host.to_string(),
            port,
            listener: None,
            watcher: None,
            connections: Vec::new(),
        };
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    /// Binds the listening socket and starts accepting. Binding port 0
    /// picks an ephemeral port; see [local_addr](Self::local_addr).
    pub fn listen(&self) -> Result<(), Fail> {
        let (event_loop, host, port) = {
            let inner = self.inner.borrow();
            (inner.event_loop.clone(), inner.host.clone(), inner.port)
        };
        let listener = TcpListener::bind((host.as_str(), port))?;
        listener.set_nonblocking(true)?;
        let fd = listener.as_raw_fd();
        self.inner.borrow_mut().listener = Some(listener);
        let server = self.clone();
        let watcher = event_loop.watch(fd, Interest::Read, move |_| server.on_acceptable());
        self.inner.borrow_mut().watcher = Some(watcher);
        info!("listening on {}:{}", host, port);
        Ok(())
    }

    /// The bound address of a listening server.
    pub fn local_addr(&self) -> Result<SocketAddr, Fail> {
        let inner = self.inner.borrow();
        match &inner.listener {
            Some(listener) => Ok(listener.local_addr()?),
            None => Err(Fail::Invalid {
                details: "server is not listening",
            }),
        }
    }

    fn on_acceptable(&self) {
        loop {
            let accepted = {
                let inner = self.inner.borrow();
                match &inner.listener {
                    Some(listener) => listener.accept(),
                    None => return,
                }
            };
            match accepted {
                Ok((stream, _)) => {
                    let prepared = stream
                        .set_nodelay(true)
                        .and_then(|_| stream.set_nonblocking(true));
                    if let Err(e) = prepared {
                        warn!("failed to prepare accepted stream: {}", e);
                        continue;
                    }
                    let (event_loop, factory) = {
                        let inner = self.inner.borrow();
                        (inner.event_loop.clone(), inner.factory.clone())
                    };
                    let (connection, _) = wire(&event_loop, &factory, Box::new(stream));
                    self.inner.borrow_mut().connections.push(connection);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Stops accepting and closes every accepted connection.
    pub fn close(&self) {
        let (event_loop, watcher, listener, connections) = {
            let mut inner = self.inner.borrow_mut();
            (
                inner.event_loop.clone(),
                inner.watcher.take(),
                inner.listener.take(),
                std::mem::take(&mut inner.connections),
            )
        };
        if let Some(watcher) = watcher {
            event_loop.unwatch(watcher);
        }
        drop(listener);
        for connection in connections {
            connection.close();
        }
    }
}

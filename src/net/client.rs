// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::{connection::Connection, wire};
use crate::{event::EventLoop, fail::Fail, rpc::{ProtocolFactory, RpcProtocol}};
use std::{net::TcpStream, os::unix::net::UnixStream, path::PathBuf};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Client for a Unix-domain stream socket at a filesystem path.
pub struct UnixClient {
    event_loop: EventLoop,
    factory: ProtocolFactory,
    path: PathBuf,
    connection: Option<Connection>,
}

/// Client for a TCP stream socket at `(host, port)`.
pub struct TcpClient {
    event_loop: EventLoop,
    factory: ProtocolFactory,
    host: String,
    port: u16,
    connection: Option<Connection>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [UnixClient].
impl UnixClient {
    /// Creates a client that will connect to the socket at `path`.
    pub fn new(event_loop: &EventLoop, factory: &ProtocolFactory, path: impl Into<PathBuf>) -> Self {
        Self {
            event_loop: event_loop.clone(),
            factory: factory.clone(),
            path: path.into(),
            connection: None,
        }
    }

    /// Connects and wires a factory-built protocol to the new stream.
    pub fn connect(&mut self) -> Result<RpcProtocol, Fail> {
        let stream = UnixStream::connect(&self.path)?;
        stream.set_nonblocking(true)?;
        let (connection, protocol) = wire(&self.event_loop, &self.factory, Box::new(stream));
        self.connection = Some(connection);
        Ok(protocol)
    }

    /// Closes the client connection.
    pub fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}

/// Associate functions for [TcpClient].
impl TcpClient {
    /// Creates a client that will connect to `host:port`.
    pub fn new(event_loop: &EventLoop, factory: &ProtocolFactory, host: &str, port: u16) -> Self {
        Self {
            event_loop: event_loop.clone(),
            factory: factory.clone(),
            host: host.to_string(),
            port,
            connection: None,
        }
    }

    /// Connects and wires a factory-built protocol to the new stream.
    pub fn connect(&mut self) -> Result<RpcProtocol, Fail> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let (connection, protocol) = wire(&self.event_loop, &self.factory, Box::new(stream));
        self.connection = Some(connection);
        Ok(protocol)
    }

    /// Closes the client connection.
    pub fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}

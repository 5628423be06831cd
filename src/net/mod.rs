// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Socket transports: the connection glue binding a protocol to a
//! nonblocking byte stream, plus Unix-domain and TCP clients and servers.

pub mod client;
pub mod connection;
pub mod server;

pub use client::{TcpClient, UnixClient};
pub use connection::{Connection, Stream};
pub use server::{TcpServer, UnixServer};

use crate::{event::EventLoop, rpc::{ProtocolFactory, RpcProtocol}};
use std::rc::Rc;

/// Builds a protocol for a freshly connected stream and wires the two
/// together.
pub(crate) fn wire(
    event_loop: &EventLoop,
    factory: &ProtocolFactory,
    stream: Box<dyn Stream>,
) -> (Connection, RpcProtocol) {
    let protocol = factory.build();
    let connection = Connection::new(event_loop, stream, protocol.clone());
    protocol.connection_made(Rc::new(connection.clone()));
    (connection, protocol)
}

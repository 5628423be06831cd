// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Whirr is a lightweight asynchronous RPC runtime built on a
//! single-threaded event-loop reactor over stream sockets (Unix domain or
//! TCP). It provides a [Deferred](deferred::Deferred) single-assignment
//! result cell with chained callbacks, a bidirectional RPC protocol engine
//! with two wire codecs (a compact length-framed native codec and
//! MessagePack-RPC), a method dispatcher, and client/server transport glue.

#[macro_use]
extern crate log;

pub mod codec;
pub mod deferred;
pub mod event;
pub mod fail;
pub mod net;
pub mod rpc;

#[cfg(test)]
pub mod test_helpers;

pub use crate::{
    codec::{CodecVariant, Message, Value},
    deferred::{Deferred, Step},
    event::EventLoop,
    fail::Fail,
    net::{TcpClient, TcpServer, UnixClient, UnixServer},
    rpc::{Dispatch, ProtocolFactory, Proxy, Reply, RpcProtocol},
};

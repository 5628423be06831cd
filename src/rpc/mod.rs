// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The RPC protocol engine: method dispatch, outbound-call proxies, the
//! per-connection protocol state machine, and the factory that ties
//! protocols to connection indices.

pub mod dispatch;
pub mod factory;
pub mod protocol;
pub mod proxy;

#[cfg(test)]
mod tests;

pub use dispatch::{Dispatch, Export, Handler, Remote, Reply};
pub use factory::ProtocolFactory;
pub use protocol::{ConnectionState, RpcProtocol, Transport};
pub use proxy::Proxy;

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Wire codecs: byte stream in, discrete RPC messages out, and back.
//!
//! Both codecs speak the same in-memory [Message] model over
//! [rmpv::Value]; they differ only in framing. The native codec
//! length-prefixes a compact tag-based tuple encoding; the MessagePack
//! codec emits self-delimiting MessagePack-RPC arrays.

pub mod msgpack;
pub mod native;

use crate::fail::Fail;

pub use msgpack::MsgPackCodec;
pub use native::NativeCodec;
pub use rmpv::Value;

//==============================================================================
// Constants & Structures
//==============================================================================

/// Ceiling on a single frame (and on decoder buffer growth). A peer that
/// exceeds it loses the connection.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Which wire format a connection speaks. Chosen once, at factory build
/// time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CodecVariant {
    Native,
    MsgPack,
}

/// One decoded wire message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Expects a [Message::Response] carrying the same id.
    Request {
        id: u64,
        method: String,
        params: Vec<Value>,
    },
    /// One-way; never answered.
    Notify { method: String, params: Vec<Value> },
    /// `error` is `None` on success.
    Response {
        id: u64,
        error: Option<Value>,
        result: Value,
    },
}

/// Streaming frame codec. `feed` accumulates bytes and emits every
/// complete message they finish; `encode` renders one message to wire
/// bytes. Decode failures are fatal to the connection.
pub trait WireCodec {
    fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Message>, Fail>;
    fn encode(&self, message: &Message) -> Result<Vec<u8>, Fail>;
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [CodecVariant].
impl CodecVariant {
    /// Instantiates a fresh decoder/encoder pair for one connection.
    pub fn build(self) -> Box<dyn WireCodec> {
        match self {
            CodecVariant::Native => Box::new(NativeCodec::new()),
            CodecVariant::MsgPack => Box::new(MsgPackCodec::new()),
        }
    }
}

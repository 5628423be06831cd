// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! MessagePack-RPC codec.
//!
//! Frames are self-delimiting MessagePack arrays per the MessagePack-RPC
//! spec: request `[0, msgid, method, params]`, response
//! `[1, msgid, error, result]` (`error` nil on success), notify
//! `[2, method, params]`. The decoder is streaming: each `feed` emits every
//! message the buffer completes and retains the trailing partial frame.

#[cfg(test)]
mod tests;

use super::{Message, Value, WireCodec, MAX_FRAME_SIZE};
use crate::fail::Fail;
use bytes::{Buf, BytesMut};
use num_traits::FromPrimitive;
use std::io;

//==============================================================================
// Constants & Structures
//==============================================================================

/// Leading type tag of every MessagePack-RPC array.
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
#[repr(u8)]
enum MsgType {
    Request = 0,
    Response = 1,
    Notify = 2,
}

/// MessagePack Codec
pub struct MsgPackCodec {
    buf: BytesMut,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [MsgPackCodec].
impl MsgPackCodec {
    /// Creates a codec with an empty accumulation buffer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }
}

/// A decode error caused by running off the end of the buffer just means
/// the frame is still in flight.
fn is_incomplete(error: &rmpv::decode::Error) -> bool {
    use rmpv::decode::Error;
    match error {
        Error::InvalidMarkerRead(e) | Error::InvalidDataRead(e) => {
            e.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

fn malformed(details: String) -> Fail {
    Fail::DecodeError { details }
}

/// Rebuilds a message from one decoded MessagePack array.
fn open_array(value: Value) -> Result<Message, Fail> {
    let mut fields = match value {
        Value::Array(fields) => fields,
        other => return Err(malformed(format!("frame is not an array: {}", other))),
    };
    if fields.is_empty() {
        return Err(malformed("frame is an empty array".to_string()));
    }
    let msg_type = fields.remove(0);
    let msg_type = match msg_type.as_u64().and_then(MsgType::from_u64) {
        Some(msg_type) => msg_type,
        None => return Err(malformed(format!("unknown message type: {}", msg_type))),
    };
    match msg_type {
        MsgType::Request => {
            if fields.len() != 3 {
                return Err(malformed("request is not a 4-element array".to_string()));
            }
            let params = take_params(fields.pop())?;
            let method = take_method(fields.pop())?;
            let id = take_id(fields.pop())?;
            Ok(Message::Request { id, method, params })
        }
        MsgType::Response => {
            if fields.len() != 3 {
                return Err(malformed("response is not a 4-element array".to_string()));
            }
            let result = fields.pop().unwrap_or(Value::Nil);
            let error = match fields.pop() {
                Some(Value::Nil) | None => None,
                Some(error) => Some(error),
            };
            let id = take_id(fields.pop())?;
            Ok(Message::Response { id, error, result })
        }
        MsgType::Notify => {
            if fields.len() != 2 {
                return Err(malformed("notify is not a 3-element array".to_string()));
            }
            let params = take_params(fields.pop())?;
            let method = take_method(fields.pop())?;
            Ok(Message::Notify { method, params })
        }
    }
}

fn take_id(field: Option<Value>) -> Result<u64, Fail> {
    match field.and_then(|v| v.as_u64()) {
        Some(id) => Ok(id),
        None => Err(malformed("msgid is not an unsigned integer".to_string())),
    }
}

fn take_method(field: Option<Value>) -> Result<String, Fail> {
    match field {
        Some(Value::String(s)) => match s.into_str() {
            Some(method) => Ok(method),
            None => Err(malformed("method name is not valid utf-8".to_string())),
        },
        _ => Err(malformed("method name is not a string".to_string())),
    }
}

fn take_params(field: Option<Value>) -> Result<Vec<Value>, Fail> {
    match field {
        Some(Value::Array(params)) => Ok(params),
        _ => Err(malformed("params is not an array".to_string())),
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// WireCodec trait implementation for [MsgPackCodec].
impl WireCodec for MsgPackCodec {
    /// Feeds bytes through rmpv's streaming reader, emitting every
    /// complete array and keeping the remainder buffered.
    fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Message>, Fail> {
        self.buf.extend_from_slice(bytes);
        let mut messages = Vec::new();
        while !self.buf.is_empty() {
            let mut cursor = io::Cursor::new(&self.buf[..]);
            match rmpv::decode::read_value(&mut cursor) {
                Ok(value) => {
                    let consumed = cursor.position() as usize;
                    self.buf.advance(consumed);
                    messages.push(open_array(value)?);
                }
                Err(ref error) if is_incomplete(error) => {
                    if self.buf.len() > MAX_FRAME_SIZE {
                        return Err(Fail::FrameTooLarge {
                            len: self.buf.len(),
                            cap: MAX_FRAME_SIZE,
                        });
                    }
                    break;
                }
                Err(error) => return Err(malformed(error.to_string())),
            }
        }
        Ok(messages)
    }

    /// Renders one message as a MessagePack-RPC array.
    fn encode(&self, message: &Message) -> Result<Vec<u8>, Fail> {
        let array = match message {
            Message::Request { id, method, params } => Value::Array(vec![
                Value::from(MsgType::Request as u8),
                Value::from(*id),
                Value::from(method.as_str()),
                Value::Array(params.clone()),
            ]),
            Message::Notify { method, params } => Value::Array(vec![
                Value::from(MsgType::Notify as u8),
                Value::from(method.as_str()),
                Value::Array(params.clone()),
            ]),
            Message::Response { id, error, result } => Value::Array(vec![
                Value::from(MsgType::Response as u8),
                Value::from(*id),
                error.clone().unwrap_or(Value::Nil),
                result.clone(),
            ]),
        };
        let mut frame = Vec::new();
        rmpv::encode::write_value(&mut frame, &array).map_err(|e| Fail::Io {
            details: e.to_string(),
        })?;
        Ok(frame)
    }
}

/// Default trait implementation for [MsgPackCodec].
impl Default for MsgPackCodec {
    fn default() -> Self {
        Self::new()
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Compact length-framed native codec.
//!
//! Each frame is a 4-byte little-endian unsigned payload length followed
//! by the payload: the 4-tuple `(is_result, id|nil, a, b)` in a tag-based
//! value encoding. Requests are `(false, id, method, params)`, notifies
//! `(false, nil, method, params)`, successful responses
//! `(true, id, nil, result)` and failed ones `(true, id, error, nil)`.


use super::{Message, Value, WireCodec, MAX_FRAME_SIZE};
use crate::fail::Fail;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Buf, BytesMut};
use num_traits::FromPrimitive;

//==============================================================================
// Constants & Structures
//==============================================================================

/// Frame header: payload length as `u32` little-endian.
const HEADER_SIZE: usize = 4;

/// Nesting ceiling for decoded values.
const MAX_DEPTH: usize = 128;

/// Value tags of the payload encoding. Integers, floats and lengths are
/// little-endian; strings and binaries carry a `u32` byte length,
/// containers a `u32` element count.
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
#[repr(u8)]
enum Tag {
    Nil = 0,
    False = 1,
    True = 2,
    Int = 3,
    Uint = 4,
    Float = 5,
    Str = 6,
    Bin = 7,
    Array = 8,
    Map = 9,
}

/// Native Codec
pub struct NativeCodec {
    buf: BytesMut,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [NativeCodec].
impl NativeCodec {
    /// Creates a codec with an empty accumulation buffer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }
}

fn encode_value(out: &mut Vec<u8>, value: &Value) -> Result<(), Fail> {
    match value {
        Value::Nil => out.push(Tag::Nil as u8),
        Value::Boolean(false) => out.push(Tag::False as u8),
        Value::Boolean(true) => out.push(Tag::True as u8),
        Value::Integer(n) => {
            if let Some(u) = n.as_u64() {
                out.push(Tag::Uint as u8);
                out.write_u64::<LittleEndian>(u).map_err(Fail::from)?;
            } else if let Some(i) = n.as_i64() {
                out.push(Tag::Int as u8);
                out.write_i64::<LittleEndian>(i).map_err(Fail::from)?;
            } else {
                return Err(Fail::Invalid {
                    details: "integer out of encodable range",
                });
            }
        }
        Value::F32(f) => {
            out.push(Tag::Float as u8);
            out.write_f64::<LittleEndian>(f64::from(*f))
                .map_err(Fail::from)?;
        }
        Value::F64(f) => {
            out.push(Tag::Float as u8);
            out.write_f64::<LittleEndian>(*f).map_err(Fail::from)?;
        }
        Value::String(s) => {
            out.push(Tag::Str as u8);
            write_bytes(out, s.as_bytes())?;
        }
        Value::Binary(b) => {
            out.push(Tag::Bin as u8);
            write_bytes(out, b)?;
        }
        Value::Array(items) => {
            out.push(Tag::Array as u8);
            write_len(out, items.len())?;
            for item in items {
                encode_value(out, item)?;
            }
        }
        Value::Map(entries) => {
            out.push(Tag::Map as u8);
            write_len(out, entries.len())?;
            for (key, value) in entries {
                encode_value(out, key)?;
                encode_value(out, value)?;
            }
        }
        Value::Ext(..) => {
            return Err(Fail::Invalid {
                details: "extension values are not representable",
            })
        }
    }
    Ok(())
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), Fail> {
    write_len(out, bytes.len())?;
    out.extend_from_slice(bytes);
    Ok(())
}

fn write_len(out: &mut Vec<u8>, len: usize) -> Result<(), Fail> {
    if len > u32::MAX as usize {
        return Err(Fail::Invalid {
            details: "length exceeds u32 range",
        });
    }
    out.write_u32::<LittleEndian>(len as u32).map_err(Fail::from)
}

fn decode_value(rd: &mut &[u8], depth: usize) -> Result<Value, Fail> {
    if depth > MAX_DEPTH {
        return Err(malformed("value nesting too deep"));
    }
    let tag = rd.read_u8().map_err(|_| malformed("truncated payload"))?;
    let tag = match Tag::from_u8(tag) {
        Some(tag) => tag,
        None => return Err(malformed("unknown value tag")),
    };
    let value = match tag {
        Tag::Nil => Value::Nil,
        Tag::False => Value::Boolean(false),
        Tag::True => Value::Boolean(true),
        Tag::Int => Value::from(
            rd.read_i64::<LittleEndian>()
                .map_err(|_| malformed("truncated integer"))?,
        ),
        Tag::Uint => Value::from(
            rd.read_u64::<LittleEndian>()
                .map_err(|_| malformed("truncated integer"))?,
        ),
        Tag::Float => Value::F64(
            rd.read_f64::<LittleEndian>()
                .map_err(|_| malformed("truncated float"))?,
        ),
        Tag::Str => {
            let bytes = read_bytes(rd)?;
            match String::from_utf8(bytes) {
                Ok(s) => Value::from(s),
                Err(_) => return Err(malformed("string is not valid utf-8")),
            }
        }
        Tag::Bin => Value::Binary(read_bytes(rd)?),
        Tag::Array => {
            let count = read_len(rd)?;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(decode_value(rd, depth + 1)?);
            }
            Value::Array(items)
        }
        Tag::Map => {
            let count = read_len(rd)?;
            let mut entries = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let key = decode_value(rd, depth + 1)?;
                let value = decode_value(rd, depth + 1)?;
                entries.push((key, value));
            }
            Value::Map(entries)
        }
    };
    Ok(value)
}

fn read_len(rd: &mut &[u8]) -> Result<usize, Fail> {
    Ok(rd
        .read_u32::<LittleEndian>()
        .map_err(|_| malformed("truncated length"))? as usize)
}

fn read_bytes(rd: &mut &[u8]) -> Result<Vec<u8>, Fail> {
    let len = read_len(rd)?;
    if len > rd.len() {
        return Err(malformed("byte run longer than payload"));
    }
    let (head, tail) = rd.split_at(len);
    let bytes = head.to_vec();
    *rd = tail;
    Ok(bytes)
}

fn malformed(details: &str) -> Fail {
    Fail::DecodeError {
        details: details.to_string(),
    }
}

/// Renders a message as the `(is_result, id|nil, a, b)` envelope.
fn envelope(message: &Message) -> Vec<Value> {
    match message {
        Message::Request { id, method, params } => vec![
            Value::Boolean(false),
            Value::from(*id),
            Value::from(method.as_str()),
            Value::Array(params.clone()),
        ],
        Message::Notify { method, params } => vec![
            Value::Boolean(false),
            Value::Nil,
            Value::from(method.as_str()),
            Value::Array(params.clone()),
        ],
        Message::Response { id, error, result } => vec![
            Value::Boolean(true),
            Value::from(*id),
            error.clone().unwrap_or(Value::Nil),
            result.clone(),
        ],
    }
}

/// Rebuilds a message from a decoded envelope.
fn open_envelope(payload: Value) -> Result<Message, Fail> {
    let mut fields = match payload {
        Value::Array(fields) if fields.len() == 4 => fields,
        _ => return Err(malformed("envelope is not a 4-tuple")),
    };
    // Take in reverse so each move is O(1).
    let b = fields.pop().unwrap_or(Value::Nil);
    let a = fields.pop().unwrap_or(Value::Nil);
    let id = fields.pop().unwrap_or(Value::Nil);
    let is_result = match fields.pop() {
        Some(Value::Boolean(flag)) => flag,
        _ => return Err(malformed("envelope result flag is not a bool")),
    };
    if is_result {
        let id = match id.as_u64() {
            Some(id) => id,
            None => return Err(malformed("response id is not an unsigned integer")),
        };
        let error = if a.is_nil() { None } else { Some(a) };
        return Ok(Message::Response {
            id,
            error,
            result: b,
        });
    }
    let method = match a {
        Value::String(s) => match s.into_str() {
            Some(method) => method,
            None => return Err(malformed("method name is not valid utf-8")),
        },
        _ => return Err(malformed("method name is not a string")),
    };
    let params = match b {
        Value::Array(params) => params,
        _ => return Err(malformed("params is not an array")),
    };
    if id.is_nil() {
        Ok(Message::Notify { method, params })
    } else {
        match id.as_u64() {
            Some(id) => Ok(Message::Request { id, method, params }),
            None => Err(malformed("request id is not an unsigned integer")),
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// WireCodec trait implementation for [NativeCodec].
impl WireCodec for NativeCodec {
    /// Accumulates bytes and emits every frame they complete.
    fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Message>, Fail> {
        self.buf.extend_from_slice(bytes);
        let mut messages = Vec::new();
        loop {
            if self.buf.len() < HEADER_SIZE {
                break;
            }
            let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            if len > MAX_FRAME_SIZE {
                return Err(Fail::FrameTooLarge {
                    len,
                    cap: MAX_FRAME_SIZE,
                });
            }
            if self.buf.len() < HEADER_SIZE + len {
                break;
            }
            self.buf.advance(HEADER_SIZE);
            let payload = self.buf.split_to(len);
            let mut rd: &[u8] = &payload;
            let value = decode_value(&mut rd, 0)?;
            if !rd.is_empty() {
                return Err(malformed("trailing bytes after payload"));
            }
            messages.push(open_envelope(value)?);
        }
        Ok(messages)
    }

    /// Renders one message as a length-prefixed frame.
    fn encode(&self, message: &Message) -> Result<Vec<u8>, Fail> {
        let mut payload = Vec::new();
        encode_value(&mut payload, &Value::Array(envelope(message)))?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(Fail::FrameTooLarge {
                len: payload.len(),
                cap: MAX_FRAME_SIZE,
            });
        }
        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame
            .write_u32::<LittleEndian>(payload.len() as u32)
            .map_err(Fail::from)?;
        frame.extend_from_slice(&payload);
        Ok(frame)
    }
}

/// Default trait implementation for [NativeCodec].
impl Default for NativeCodec {
    fn default() -> Self {
        Self::new()
    }
}

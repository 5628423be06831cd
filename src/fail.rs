// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::codec::Value;
use custom_error::custom_error;

custom_error! {
    /// Error conditions surfaced by the runtime.
    ///
    /// `Fail` is `Clone` so that a single failure (a lost connection, say)
    /// can be delivered to every waiter that observes it.
    #[derive(Clone, PartialEq)]
    pub Fail
    AlreadyCalled{} = "deferred has already been completed",
    Cancelled{} = "deferred was cancelled",
    Timeout{} = "wait timed out",
    UnknownMethod{method: String} = "unknown method: {method}",
    RemoteError{payload: Value} = "remote call failed: {payload}",
    ConnectionLost{details: &'static str} = "connection lost: {details}",
    FrameTooLarge{len: usize, cap: usize} = "frame of {len} bytes exceeds the {cap} byte cap",
    DecodeError{details: String} = "malformed frame: {details}",
    Invalid{details: &'static str} = "invalid operation: {details}",
    Io{details: String} = "i/o error: {details}",
}

/// `std::io::Error` is not `Clone`, so socket errors are carried as text.
impl From<std::io::Error> for Fail {
    fn from(err: std::io::Error) -> Self {
        Fail::Io {
            details: err.to_string(),
        }
    }
}

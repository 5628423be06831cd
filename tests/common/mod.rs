// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::{
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use whirr::{Dispatch, EventLoop, Fail, Reply, Value};

static NEXT_SOCKET: AtomicUsize = AtomicUsize::new(0);

/// A unique socket path per test so tests never trip over each other.
pub fn unix_socket_path(tag: &str) -> PathBuf {
    let n = NEXT_SOCKET.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("whirr-{}-{}-{}.sock", tag, std::process::id(), n))
}

/// A dispatcher exporting `add(a, b) = a + b`.
pub fn adder_dispatch() -> Dispatch {
    let dispatch = Dispatch::new();
    dispatch.register("add", |params: Vec<Value>| {
        let mut sum = 0i64;
        for param in &params {
            sum += param.as_i64().ok_or(Fail::Invalid {
                details: "parameter is not an integer",
            })?;
        }
        Ok(Reply::Value(Value::from(sum)))
    });
    dispatch
}

/// Drives the loop in bounded slices until the condition holds (or gives
/// up after roughly two seconds).
pub fn spin_until<F: Fn() -> bool>(event_loop: &EventLoop, condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        // Bound the iteration so a quiet loop cannot park forever.
        event_loop.schedule_timer(Duration::from_millis(10), || {});
        event_loop.run_once();
    }
    condition()
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Measures call and notify throughput over a Unix-domain socket, with the
//! server and client sharing one process and one loop.

use flexi_logger::Logger;
use std::{
    cell::RefCell,
    rc::Rc,
    time::{Duration, Instant},
};
use whirr::{
    CodecVariant, Dispatch, EventLoop, Fail, ProtocolFactory, Reply, UnixClient, UnixServer, Value,
};

const CALLS: usize = 10_000;

fn main() {
    Logger::with_env_or_str("info").start().unwrap();

    let event_loop = EventLoop::new();
    let notified = Rc::new(RefCell::new(0usize));
    let dispatch = Dispatch::new();
    let count = notified.clone();
    dispatch.register("add", move |params: Vec<Value>| {
        *count.borrow_mut() += 1;
        let mut sum = 0i64;
        for param in &params {
            sum += param.as_i64().ok_or(Fail::Invalid {
                details: "parameter is not an integer",
            })?;
        }
        Ok(Reply::Value(Value::from(sum)))
    });

    let factory = ProtocolFactory::new(&event_loop, dispatch, CodecVariant::Native);
    let path = std::env::temp_dir().join(format!("whirr-demo-{}.sock", std::process::id()));
    let server = UnixServer::new(&event_loop, &factory, &path);
    server.listen().unwrap();
    let mut client = UnixClient::new(&event_loop, &factory, &path);
    client.connect().unwrap();

    let proxy = factory.proxy(0).wait(None).unwrap();
    proxy.set_timeout(Some(Duration::from_secs(2)));

    let started = Instant::now();
    for _ in 0..CALLS {
        proxy
            .call("add", vec![Value::from(2), Value::from(3)])
            .unwrap();
    }
    let elapsed = started.elapsed().as_secs_f64();
    println!("calls per second: {:.0}", CALLS as f64 / elapsed);

    *notified.borrow_mut() = 0;
    let started = Instant::now();
    for _ in 0..CALLS {
        proxy.notify("add", vec![Value::from(2), Value::from(3)]).unwrap();
    }
    // Notifies are one-way; drive the loop until the server has seen them
    // all before reading the clock.
    while *notified.borrow() < CALLS {
        event_loop.run_once();
    }
    let elapsed = started.elapsed().as_secs_f64();
    println!("notifies per second: {:.0}", CALLS as f64 / elapsed);

    client.close();
    server.close();
}

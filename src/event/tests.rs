// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::*;

/// Tests that scheduled callbacks run in FIFO order.
#[test]
fn scheduled_callbacks_run_in_order() {
    let event_loop = EventLoop::new();
    let order = Rc::new(RefCell::new(Vec::new()));
    for i in 0..4 {
        let order = order.clone();
        event_loop.schedule(move || order.borrow_mut().push(i));
    }
    event_loop.run_once();
    assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
}

/// Tests that a callback scheduled from inside a callback runs on a later
/// iteration, never inline.
#[test]
fn nested_schedule_is_deferred() {
    let event_loop = EventLoop::new();
    let order = Rc::new(RefCell::new(Vec::new()));
    {
        let order = order.clone();
        let inner_loop = event_loop.clone();
        event_loop.schedule(move || {
            order.borrow_mut().push("outer");
            let order = order.clone();
            inner_loop.schedule(move || order.borrow_mut().push("inner"));
        });
    }
    event_loop.run_once();
    assert_eq!(*order.borrow(), vec!["outer"]);
    event_loop.run_once();
    assert_eq!(*order.borrow(), vec!["outer", "inner"]);
}

/// Tests that timers fire after their delay, in deadline order.
#[test]
fn timers_fire_in_deadline_order() {
    let event_loop = EventLoop::new();
    let order = Rc::new(RefCell::new(Vec::new()));
    {
        let order = order.clone();
        event_loop.schedule_timer(Duration::from_millis(40), move || {
            order.borrow_mut().push("late")
        });
    }
    {
        let order = order.clone();
        event_loop.schedule_timer(Duration::from_millis(10), move || {
            order.borrow_mut().push("early")
        });
    }
    let started = Instant::now();
    for _ in 0..100 {
        if order.borrow().len() == 2 {
            break;
        }
        event_loop.run_once();
    }
    assert_eq!(*order.borrow(), vec!["early", "late"]);
    assert!(started.elapsed() >= Duration::from_millis(40));
}

/// Tests that a cancelled timer never fires.
#[test]
fn cancelled_timer_never_fires() {
    let event_loop = EventLoop::new();
    let fired = Rc::new(RefCell::new(false));
    let handle = {
        let fired = fired.clone();
        event_loop.schedule_timer(Duration::from_millis(10), move || *fired.borrow_mut() = true)
    };
    event_loop.cancel_timer(handle);
    // The loop reports no remaining work once the timer is gone.
    assert!(!event_loop.run_once());
    assert!(!*fired.borrow());
}

/// Tests that `run` drives until `stop` is called from a callback.
#[test]
fn run_halts_on_stop() {
    let event_loop = EventLoop::new();
    let ticks = Rc::new(RefCell::new(0));
    {
        let ticks = ticks.clone();
        let stopper = event_loop.clone();
        event_loop.schedule_timer(Duration::from_millis(20), move || {
            *ticks.borrow_mut() += 1;
            stopper.stop();
        });
    }
    // Keep the loop busy with a second, later timer.
    event_loop.schedule_timer(Duration::from_secs(5), || {});
    event_loop.run();
    assert_eq!(*ticks.borrow(), 1);
}

/// Tests that `run` returns once no wake sources remain.
#[test]
fn run_returns_when_idle() {
    let event_loop = EventLoop::new();
    let ran = Rc::new(RefCell::new(false));
    {
        let ran = ran.clone();
        event_loop.schedule(move || *ran.borrow_mut() = true);
    }
    event_loop.run();
    assert!(*ran.borrow());
}

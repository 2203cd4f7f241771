// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU32, Ordering},
};

use urpc_rs::{
    errors::UrpcError,
    events::timer::{TimerState, TimerWheel},
};

#[test]
fn pool_bounds_timer_allocation() {
    let wheel = TimerWheel::new();
    wheel.pool_add(1, 2, false);
    let a = wheel.create(1, false).expect("first");
    let _b = wheel.create(1, false).expect("second");
    assert!(matches!(
        wheel.create(1, false),
        Err(UrpcError::Exhausted(_))
    ));
    // destroying hands the slot back
    wheel.destroy(a);
    wheel.create(1, false).expect("slot recycled");
}

#[test]
fn one_shot_fires_exactly_on_its_tick() {
    let wheel = TimerWheel::new();
    wheel.pool_add(1, 1, false);
    let t = wheel.create(1, false).expect("create");
    let fired = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&fired);
    wheel
        .start(t, 5, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }, false)
        .expect("start");

    wheel.tick(4);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(wheel.state(t), TimerState::Pending);
    wheel.tick(1);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(wheel.state(t), TimerState::Finish);
    // no further firings
    wheel.tick(20);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn periodic_rearms_until_destroyed() {
    let wheel = TimerWheel::new();
    wheel.pool_add(2, 1, true);
    let t = wheel.create(2, true).expect("create");
    let fired = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&fired);
    wheel
        .start(t, 3, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }, true)
        .expect("start");

    wheel.tick(9);
    assert_eq!(fired.load(Ordering::SeqCst), 3);
    wheel.destroy(t);
    wheel.tick(9);
    assert_eq!(fired.load(Ordering::SeqCst), 3);
}

#[test]
fn expiry_drains_in_tick_order() {
    let wheel = TimerWheel::new();
    wheel.pool_add(3, 3, false);
    let order = Arc::new(Mutex::new(Vec::new()));
    for (tag, ms) in [("late", 7u32), ("early", 2), ("mid", 5)] {
        let t = wheel.create(3, false).expect("create");
        let order = Arc::clone(&order);
        wheel
            .start(t, ms, move || {
                order.lock().expect("order lock").push(tag);
            }, false)
            .expect("start");
    }
    wheel.tick(10);
    assert_eq!(
        *order.lock().expect("order lock"),
        vec!["early", "mid", "late"]
    );
}

#[test]
fn restart_rearms_with_previous_settings() {
    let wheel = TimerWheel::new();
    wheel.pool_add(4, 1, false);
    let t = wheel.create(4, false).expect("create");
    let fired = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&fired);
    wheel
        .start(t, 2, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }, false)
        .expect("start");
    wheel.tick(2);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    wheel.restart(t).expect("restart");
    wheel.tick(2);
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[test]
fn timeouts_longer_than_the_wheel_use_rounds() {
    let wheel = TimerWheel::new();
    wheel.pool_add(5, 1, false);
    let t = wheel.create(5, false).expect("create");
    let fired = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&fired);
    // longer than WHEEL_SLOTS ticks
    wheel
        .start(t, 1500, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }, false)
        .expect("start");
    wheel.tick(1024);
    assert_eq!(fired.load(Ordering::SeqCst), 0, "needs one more round");
    wheel.tick(476);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

use std::sync::Arc;

use urpc_rs::queue::credit::{CreditMode, CreditPool};

#[test]
fn idle_plus_outstanding_never_exceeds_capacity() {
    let pool = CreditPool::new(32, CreditMode::Atomic);
    let mut outstanding = 0u16;
    for step in 0..200u16 {
        if step % 3 == 0 {
            outstanding += pool.dec(3);
        } else {
            let back = (step % 2) + 1;
            let returned = pool.inc(back.min(outstanding));
            outstanding -= returned;
        }
        assert!(pool.idle() + outstanding <= pool.capacity());
    }
}

#[test]
fn dec_saturates_at_zero() {
    let pool = CreditPool::new(4, CreditMode::LockFree);
    assert_eq!(pool.dec(10), 4);
    assert_eq!(pool.dec(1), 0);
    assert_eq!(pool.idle(), 0);
}

#[test]
fn leak_recycle_has_floor_of_one() {
    // capacity 4 -> threshold max(4 >> 3, 1) = 1
    let pool = CreditPool::new(4, CreditMode::Atomic);
    pool.dec(4);
    pool.leak(2);
    assert_eq!(pool.dec(1), 1, "recycled credits must satisfy the dec");
    assert_eq!(pool.leaked(), 0);
}

#[test]
fn concurrent_dec_inc_keeps_invariant() {
    let pool = Arc::new(CreditPool::new(128, CreditMode::Atomic));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let p = Arc::clone(&pool);
        handles.push(std::thread::spawn(move || {
            for _ in 0..1000 {
                let got = p.dec(2);
                if got > 0 {
                    p.inc(got);
                }
            }
        }));
    }
    for h in handles {
        h.join().expect("worker panicked");
    }
    assert_eq!(pool.idle(), pool.capacity());
    assert_eq!(pool.leaked(), 0);
}

#[test]
fn exchange_zero_updates_lifetime_total() {
    let pool = CreditPool::new(16, CreditMode::Atomic);
    let before = pool.stats().granted_total;
    assert_eq!(pool.exchange_zero(), 16);
    assert_eq!(pool.stats().granted_total, before + 16);
    assert_eq!(pool.exchange_zero(), 0);
}

// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

use urpc_rs::queue::cursor::{AtomicCursor, Cursor};

#[test]
fn count_stays_below_size_for_any_update() {
    let size = 96;
    let mut c = Cursor::default();
    for delta in [1u32, 5, 17, 95, 3] {
        for _ in 0..500 {
            c.add(size, delta);
            assert!(c.count < size, "count {} escaped size {}", c.count, size);
        }
    }
}

#[test]
fn add_is_additive_modulo_size() {
    let size = 4096;
    for (a, b) in [(1u32, 2u32), (100, 200), (4000, 95), (2048, 2047)] {
        assert!(a + b < size);
        let mut lhs = Cursor::default();
        lhs.add(size, a);
        lhs.add(size, b);
        let mut rhs = Cursor::default();
        rhs.add(size, a + b);
        assert_eq!(lhs, rhs, "add({a}) . add({b}) != add({})", a + b);
    }
}

#[test]
fn diff_within_one_wrap() {
    let size = 64;
    let old = Cursor::new(60, 3);
    let mut new = old;
    new.add(size, 10);
    assert_eq!(new.wrap, 4);
    assert_eq!(Cursor::diff(size, &old, &new), 10);
    // clamped at size
    assert!(Cursor::diff(size, &Cursor::new(0, 0), &Cursor::new(0, 1)) <= size);
}

#[test]
fn comp_is_signed() {
    let size = 64;
    let a = Cursor::new(10, 1);
    let b = Cursor::new(20, 1);
    assert_eq!(Cursor::comp(size, &a, &b), 10);
    assert_eq!(Cursor::comp(size, &b, &a), -10);
    assert_eq!(Cursor::comp(size, &a, &a), 0);
}

#[test]
fn diff_large_over_many_wraps_clamps_to_size() {
    let size = 64;
    let old = Cursor::new(10, 0);
    let new = Cursor::new(10, 40);
    assert_eq!(Cursor::diff_large(size, &old, &new), size);
}

#[test]
fn wrap_rollover_0xffff_to_zero() {
    let size = 4096;
    let old = Cursor::new(4000, 0xffff);
    let mut new = old;
    new.add(size, 200);
    assert_eq!(new.wrap, 0, "wrap must roll over to zero");
    assert_eq!(Cursor::diff(size, &old, &new), 200);
    assert_eq!(Cursor::diff_large(size, &old, &new), 200);

    // a whole extra turn after the rollover still clamps
    let far = Cursor::new(4000, 1);
    assert_eq!(Cursor::diff_large(size, &old, &far), size);
}

#[test]
fn atomic_cursor_snapshot_is_consistent() {
    let slot = AtomicCursor::new(Cursor::new(7, 9));
    let seen = slot.load();
    assert_eq!(seen, Cursor::new(7, 9));
    slot.update(|c| c.add(16, 10));
    assert_eq!(slot.load(), Cursor::new(1, 10));

    let other = AtomicCursor::default();
    other.copy_from(&slot);
    assert_eq!(other.load(), slot.load());
}

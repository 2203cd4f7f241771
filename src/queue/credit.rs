// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Per-queue credit pools with leak detection.
//!
//! A credit represents one peer RX buffer we are allowed to consume. Credits
//! that never come back (peer reset, dropped completion) are parked in the
//! `leaked` counter; once `leaked` grows past `capacity >> 3` (floor 1) the
//! next decrement recycles them into `idle`. The pool keeps
//! `idle + in_flight + leaked == capacity` at every observable point.
//!
//! Two code paths share one contract: queues created `io_lock_free` get the
//! plain load/store variant, everything else goes through CAS loops.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditMode {
    /// CAS loops; safe under concurrent mutators.
    Atomic,
    /// Plain load/store; the queue owner guarantees single-threaded access.
    LockFree,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CreditStats {
    pub idle: u16,
    pub leaked: u16,
    pub capacity: u16,
    pub recycled_total: u64,
    pub overflow_errs: u64,
    pub granted_total: u64,
}

#[derive(Debug)]
pub struct CreditPool {
    mode: CreditMode,
    capacity: u16,
    leak_threshold: u16,
    idle: AtomicU16,
    leaked: AtomicU16,
    recycled_total: AtomicU64,
    overflow_errs: AtomicU64,
    granted_total: AtomicU64,
}

impl CreditPool {
    pub fn new(capacity: u16, mode: CreditMode) -> Self {
        Self {
            mode,
            capacity,
            leak_threshold: (capacity >> 3).max(1),
            idle: AtomicU16::new(capacity),
            leaked: AtomicU16::new(0),
            recycled_total: AtomicU64::new(0),
            overflow_errs: AtomicU64::new(0),
            granted_total: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    #[inline]
    pub fn idle(&self) -> u16 {
        self.idle.load(Ordering::Acquire)
    }

    #[inline]
    pub fn leaked(&self) -> u16 {
        self.leaked.load(Ordering::Acquire)
    }

    /// Return `n` credits; saturates at capacity and counts the overflow
    /// into an error statistic. Returns the amount actually accepted.
    pub fn inc(&self, n: u16) -> u16 {
        let accepted = match self.mode {
            CreditMode::Atomic => {
                let mut cur = self.idle.load(Ordering::Relaxed);
                loop {
                    let room = self.capacity - cur;
                    let take = n.min(room);
                    match self.idle.compare_exchange_weak(
                        cur,
                        cur + take,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break take,
                        Err(seen) => cur = seen,
                    }
                }
            },
            CreditMode::LockFree => {
                let cur = self.idle.load(Ordering::Relaxed);
                let take = n.min(self.capacity - cur);
                self.idle.store(cur + take, Ordering::Relaxed);
                take
            },
        };
        if accepted < n {
            self.overflow_errs
                .fetch_add((n - accepted) as u64, Ordering::Relaxed);
        }
        accepted
    }

    /// Consume up to `n` credits, recycling leaked ones first when past the
    /// threshold. Returns the amount actually granted (0 when dry).
    pub fn dec(&self, n: u16) -> u16 {
        if self.leaked() > self.leak_threshold {
            self.recycle_leaked();
        }
        let granted = match self.mode {
            CreditMode::Atomic => {
                let mut cur = self.idle.load(Ordering::Relaxed);
                loop {
                    let take = n.min(cur);
                    match self.idle.compare_exchange_weak(
                        cur,
                        cur - take,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break take,
                        Err(seen) => cur = seen,
                    }
                }
            },
            CreditMode::LockFree => {
                let cur = self.idle.load(Ordering::Relaxed);
                let take = n.min(cur);
                self.idle.store(cur - take, Ordering::Relaxed);
                take
            },
        };
        self.granted_total
            .fetch_add(granted as u64, Ordering::Relaxed);
        granted
    }

    /// Read and reset the idle count in one shot; the lifetime total keeps
    /// the drained amount.
    pub fn exchange_zero(&self) -> u16 {
        let drained = match self.mode {
            CreditMode::Atomic => self.idle.swap(0, Ordering::AcqRel),
            CreditMode::LockFree => {
                let cur = self.idle.load(Ordering::Relaxed);
                self.idle.store(0, Ordering::Relaxed);
                cur
            },
        };
        self.granted_total
            .fetch_add(drained as u64, Ordering::Relaxed);
        drained
    }

    /// Park `n` credits as leaked (queue teardown found them unreturned).
    pub fn leak(&self, n: u16) {
        self.leaked.fetch_add(n, Ordering::AcqRel);
    }

    /// Move every leaked credit back into the idle pool.
    pub fn recycle_leaked(&self) {
        let n = self.leaked.swap(0, Ordering::AcqRel);
        if n == 0 {
            return;
        }
        debug!(recycled = n, "credit pool recycled leaked credits");
        self.inc(n);
        self.recycled_total.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CreditStats {
        CreditStats {
            idle: self.idle(),
            leaked: self.leaked(),
            capacity: self.capacity,
            recycled_total: self.recycled_total.load(Ordering::Relaxed),
            overflow_errs: self.overflow_errs.load(Ordering::Relaxed),
            granted_total: self.granted_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inc_saturates_at_capacity() {
        let pool = CreditPool::new(8, CreditMode::Atomic);
        assert_eq!(pool.dec(3), 3);
        assert_eq!(pool.inc(5), 3); // only 3 were out
        assert_eq!(pool.idle(), 8);
        assert_eq!(pool.stats().overflow_errs, 2);
    }

    #[test]
    fn leak_recycles_past_threshold() {
        let pool = CreditPool::new(16, CreditMode::LockFree);
        // threshold = 16 >> 3 = 2
        assert_eq!(pool.dec(16), 16);
        pool.leak(3);
        assert_eq!(pool.idle(), 0);
        // leaked(3) > threshold(2): next dec recycles first
        assert_eq!(pool.dec(1), 1);
        assert_eq!(pool.idle(), 2);
        assert_eq!(pool.leaked(), 0);
        assert_eq!(pool.stats().recycled_total, 3);
    }

    #[test]
    fn exchange_zero_drains() {
        let pool = CreditPool::new(8, CreditMode::Atomic);
        assert_eq!(pool.exchange_zero(), 8);
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.exchange_zero(), 0);
    }
}

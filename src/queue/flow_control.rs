// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Receive-window flow control, advertised on completions instead of a
//! separate control message.
//!
//! The local side counts RX buffers it posts (`local_rx_posted`); once the
//! count crosses the notify interval it is drained into the credits byte of
//! the next outgoing immediate word. The remote side accumulates those
//! credits as `remote_rx_window` and every send consumes one. An empty
//! window is backpressure, never an error.
//!
//! This module owns only the counters and decisions; the queue wires them
//! to actual WRITE/READ/SEND_IMM postings.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};

use crate::queue::credit::CreditMode;

pub const FLOW_CONTROL_NOTIFY_FLOOR: u16 = 4;

/// What the caller should do after accounting newly posted RX buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advert {
    /// Nothing to do yet.
    None,
    /// First crossing of the initial window: run the one-shot window
    /// bootstrap (WRITE our counter, READ theirs), advertising this much.
    Bootstrap(u16),
    /// Send a dedicated flow-control immediate advertising this much.
    Notify(u16),
}

#[derive(Debug, Clone)]
pub struct FlowControlCfg {
    pub enabled: bool,
    pub local_rx_depth: u16,
    pub remote_rx_depth: u16,
    pub initial_window: Option<u16>,
    pub notify_interval: Option<u16>,
    pub mode: CreditMode,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FlowControlStats {
    pub local_rx_posted: u16,
    pub remote_rx_window: u16,
    pub flow_controlled: u64,
    pub rx_allocated_total: u64,
    pub rx_consumed_total: u64,
    pub credit_req_dropped: u64,
}

#[derive(Debug)]
pub struct FlowControl {
    enabled: bool,
    mode: CreditMode,
    pub local_rx_depth: u16,
    pub remote_rx_depth: u16,
    initial_window: u16,
    notify_interval: u16,

    local_rx_posted: AtomicU16,
    remote_rx_window: AtomicU16,
    local_set: AtomicBool,
    remote_get: AtomicBool,

    rx_allocated_total: AtomicU64,
    rx_consumed_total: AtomicU64,
    flow_controlled: AtomicU64,

    is_credit_applying: AtomicBool,
    credit_req_dropped: AtomicU64,
}

impl FlowControl {
    pub fn new(cfg: &FlowControlCfg) -> Self {
        let initial_window = cfg.initial_window.unwrap_or(cfg.local_rx_depth / 2).max(1);
        let notify_interval = cfg
            .notify_interval
            .unwrap_or((cfg.local_rx_depth / 16).max(FLOW_CONTROL_NOTIFY_FLOOR));
        Self {
            enabled: cfg.enabled,
            mode: cfg.mode,
            local_rx_depth: cfg.local_rx_depth,
            remote_rx_depth: cfg.remote_rx_depth,
            initial_window,
            notify_interval,
            local_rx_posted: AtomicU16::new(0),
            remote_rx_window: AtomicU16::new(0),
            local_set: AtomicBool::new(false),
            remote_get: AtomicBool::new(false),
            rx_allocated_total: AtomicU64::new(0),
            rx_consumed_total: AtomicU64::new(0),
            flow_controlled: AtomicU64::new(0),
            is_credit_applying: AtomicBool::new(false),
            credit_req_dropped: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Account `n` freshly posted RX buffers and decide whether to
    /// advertise.
    pub fn rq_posted_inc(&self, n: u16) -> Advert {
        if !self.enabled {
            return Advert::None;
        }
        self.rx_allocated_total.fetch_add(n as u64, Ordering::Relaxed);
        let acc = self.posted_add(n);
        if !self.local_set.load(Ordering::Acquire) {
            if acc >= self.initial_window {
                self.local_set.store(true, Ordering::Release);
                return Advert::Bootstrap(self.posted_exchange());
            }
            return Advert::None;
        }
        if acc >= self.notify_interval {
            Advert::Notify(self.posted_exchange())
        } else {
            Advert::None
        }
    }

    /// Try to consume window for one send. Whole-or-nothing: a short window
    /// consumes nothing and the send must be reported as flow-controlled.
    pub fn try_consume(&self, n: u16) -> bool {
        if !self.enabled {
            return true;
        }
        let ok = match self.mode {
            CreditMode::Atomic => {
                let mut cur = self.remote_rx_window.load(Ordering::Relaxed);
                loop {
                    if cur < n {
                        break false;
                    }
                    match self.remote_rx_window.compare_exchange_weak(
                        cur,
                        cur - n,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break true,
                        Err(seen) => cur = seen,
                    }
                }
            },
            CreditMode::LockFree => {
                let cur = self.remote_rx_window.load(Ordering::Relaxed);
                if cur < n {
                    false
                } else {
                    self.remote_rx_window.store(cur - n, Ordering::Relaxed);
                    true
                }
            },
        };
        if !ok {
            self.flow_controlled.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Credits arrived from the peer (immediate word, CDC, window read).
    pub fn remote_window_inc(&self, credits: u16) {
        if credits == 0 {
            return;
        }
        self.remote_get.store(true, Ordering::Release);
        let cap = self.remote_rx_depth;
        match self.mode {
            CreditMode::Atomic => {
                let mut cur = self.remote_rx_window.load(Ordering::Relaxed);
                loop {
                    let next = (cur + credits).min(cap);
                    match self.remote_rx_window.compare_exchange_weak(
                        cur,
                        next,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(seen) => cur = seen,
                    }
                }
            },
            CreditMode::LockFree => {
                let cur = self.remote_rx_window.load(Ordering::Relaxed);
                self.remote_rx_window
                    .store((cur + credits).min(cap), Ordering::Relaxed);
            },
        }
    }

    /// Drain the posted counter into the credits byte of an outgoing
    /// immediate word. Anything above one byte stays accumulated.
    pub fn fill_tx_imm(&self) -> u8 {
        if !self.enabled {
            return 0;
        }
        let acc = self.posted_exchange();
        if acc > u8::MAX as u16 {
            self.posted_add(acc - u8::MAX as u16);
            u8::MAX
        } else {
            acc as u8
        }
    }

    /// A post carrying `credits` failed before reaching the wire; put the
    /// advertisement back so the peer eventually still hears about it.
    pub fn recover_tx_imm(&self, credits: u16) {
        if credits > 0 {
            self.posted_add(credits);
        }
    }

    /// One RX completion was consumed by the application.
    pub fn rx_consumed_inc(&self, n: u64) {
        self.rx_consumed_total.fetch_add(n, Ordering::Relaxed);
    }

    /// Teardown accounting: whatever was allocated but never consumed is a
    /// leak the credit pool should recycle later.
    pub fn teardown_leak(&self) -> u16 {
        let allocated = self.rx_allocated_total.load(Ordering::Acquire);
        let consumed = self.rx_consumed_total.load(Ordering::Acquire);
        allocated.saturating_sub(consumed).min(u16::MAX as u64) as u16
    }

    /// Claim the single outstanding shared-credit request slot.
    pub fn credit_apply_begin(&self) -> bool {
        let won = self
            .is_credit_applying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !won {
            self.credit_req_dropped.fetch_add(1, Ordering::Relaxed);
        }
        won
    }

    pub fn credit_apply_end(&self) {
        self.is_credit_applying.store(false, Ordering::Release);
    }

    #[inline]
    pub fn remote_window(&self) -> u16 {
        self.remote_rx_window.load(Ordering::Acquire)
    }

    #[inline]
    pub fn window_exchange_ready(&self) -> bool {
        self.local_set.load(Ordering::Acquire) && self.remote_get.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> FlowControlStats {
        FlowControlStats {
            local_rx_posted: self.local_rx_posted.load(Ordering::Relaxed),
            remote_rx_window: self.remote_window(),
            flow_controlled: self.flow_controlled.load(Ordering::Relaxed),
            rx_allocated_total: self.rx_allocated_total.load(Ordering::Relaxed),
            rx_consumed_total: self.rx_consumed_total.load(Ordering::Relaxed),
            credit_req_dropped: self.credit_req_dropped.load(Ordering::Relaxed),
        }
    }

    fn posted_add(&self, n: u16) -> u16 {
        match self.mode {
            CreditMode::Atomic => self.local_rx_posted.fetch_add(n, Ordering::AcqRel) + n,
            CreditMode::LockFree => {
                let next = self.local_rx_posted.load(Ordering::Relaxed) + n;
                self.local_rx_posted.store(next, Ordering::Relaxed);
                next
            },
        }
    }

    fn posted_exchange(&self) -> u16 {
        match self.mode {
            CreditMode::Atomic => self.local_rx_posted.swap(0, Ordering::AcqRel),
            CreditMode::LockFree => {
                let cur = self.local_rx_posted.load(Ordering::Relaxed);
                self.local_rx_posted.store(0, Ordering::Relaxed);
                cur
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(depth: u16) -> FlowControlCfg {
        FlowControlCfg {
            enabled: true,
            local_rx_depth: depth,
            remote_rx_depth: depth,
            initial_window: None,
            notify_interval: None,
            mode: CreditMode::Atomic,
        }
    }

    #[test]
    fn bootstrap_fires_at_initial_window() {
        let fc = FlowControl::new(&cfg(64));
        assert_eq!(fc.rq_posted_inc(16), Advert::None);
        assert_eq!(fc.rq_posted_inc(16), Advert::Bootstrap(32));
    }

    #[test]
    fn window_zero_is_backpressure_not_error() {
        let fc = FlowControl::new(&cfg(4));
        fc.remote_window_inc(4);
        for _ in 0..4 {
            assert!(fc.try_consume(1));
        }
        assert!(!fc.try_consume(1));
        assert_eq!(fc.stats().flow_controlled, 1);
        // recovery after the peer advertises again
        fc.remote_window_inc(1);
        assert!(fc.try_consume(1));
    }

    #[test]
    fn failed_post_returns_advertisement() {
        let mut c = cfg(64);
        c.notify_interval = Some(8);
        let fc = FlowControl::new(&c);
        fc.rq_posted_inc(40); // bootstrap drains the counter
        fc.rq_posted_inc(6); // below the notify interval, stays accumulated
        let credits = fc.fill_tx_imm();
        assert_eq!(credits, 6);
        fc.recover_tx_imm(credits.into());
        assert_eq!(fc.stats().local_rx_posted, 6);
    }

    #[test]
    fn single_outstanding_credit_request() {
        let fc = FlowControl::new(&cfg(8));
        assert!(fc.credit_apply_begin());
        assert!(!fc.credit_apply_begin());
        assert_eq!(fc.stats().credit_req_dropped, 1);
        fc.credit_apply_end();
        assert!(fc.credit_apply_begin());
    }
}

// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Timing wheel with 1 ms granularity and pooled per-channel timer slots.
//!
//! Slots are pre-granted per channel (`pool_add`) so a runaway channel
//! cannot starve the wheel; expiry drains deterministically in tick order.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{UrpcError, UrpcResult};

pub const WHEEL_SLOTS: usize = 1024;
pub const TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Invalid,
    Inited,
    Pending,
    Running,
    Finish,
}

type TimerCallback = Box<dyn FnMut() + Send>;

struct TimerEntry {
    state: TimerState,
    chid: u32,
    is_server: bool,
    timeout_ms: u32,
    periodic: bool,
    /// Remaining full wheel turns before this entry fires.
    rounds: u32,
    slot: usize,
    cb: Option<TimerCallback>,
}

#[derive(Default)]
struct WheelInner {
    slots: Vec<Vec<u64>>,
    timers: HashMap<u64, TimerEntry>,
    /// Remaining pooled entries per `(chid, is_server)`.
    pool: HashMap<(u32, bool), u32>,
    current: usize,
}

pub struct TimerWheel {
    inner: Mutex<WheelInner>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

/// Handle to one pooled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

impl TimerWheel {
    pub fn new() -> Arc<Self> {
        let inner = WheelInner {
            slots: (0..WHEEL_SLOTS).map(|_| Vec::new()).collect(),
            ..Default::default()
        };
        Arc::new(Self {
            inner: Mutex::new(inner),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        })
    }

    /// Drive the wheel off the tokio clock until shut down.
    pub fn spawn_driver(self: &Arc<Self>) {
        let wheel = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => wheel.tick(1),
                }
            }
        });
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Grant `num` timer slots to a channel.
    pub fn pool_add(&self, chid: u32, num: u32, is_server: bool) {
        let mut inner = self.inner.lock().expect("wheel lock poisoned");
        *inner.pool.entry((chid, is_server)).or_insert(0) += num;
    }

    pub fn pool_delete(&self, chid: u32, is_server: bool) {
        let mut inner = self.inner.lock().expect("wheel lock poisoned");
        inner.pool.remove(&(chid, is_server));
        // drop every timer the channel still holds
        let stale: Vec<u64> = inner
            .timers
            .iter()
            .filter(|(_, t)| t.chid == chid && t.is_server == is_server)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(t) = inner.timers.remove(&id) {
                let slot = t.slot;
                inner.slots[slot].retain(|x| *x != id);
            }
        }
    }

    /// Take a timer out of the channel's pool.
    pub fn create(&self, chid: u32, is_server: bool) -> UrpcResult<TimerHandle> {
        let mut inner = self.inner.lock().expect("wheel lock poisoned");
        let left = inner
            .pool
            .get_mut(&(chid, is_server))
            .ok_or(UrpcError::State("no timer pool for channel"))?;
        if *left == 0 {
            return Err(UrpcError::Exhausted("timer pool"));
        }
        *left -= 1;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        inner.timers.insert(id, TimerEntry {
            state: TimerState::Inited,
            chid,
            is_server,
            timeout_ms: 0,
            periodic: false,
            rounds: 0,
            slot: 0,
            cb: None,
        });
        Ok(TimerHandle(id))
    }

    pub fn start<F>(
        &self,
        handle: TimerHandle,
        timeout_ms: u32,
        cb: F,
        periodic: bool,
    ) -> UrpcResult<()>
    where
        F: FnMut() + Send + 'static,
    {
        let mut inner = self.inner.lock().expect("wheel lock poisoned");
        let current = inner.current;
        let entry = inner
            .timers
            .get_mut(&handle.0)
            .ok_or(UrpcError::BadHandle)?;
        if entry.state == TimerState::Pending {
            return Err(UrpcError::State("timer already pending"));
        }
        entry.timeout_ms = timeout_ms.max(1);
        entry.periodic = periodic;
        entry.cb = Some(Box::new(cb));
        let (slot, rounds) = slot_for(current, entry.timeout_ms);
        entry.slot = slot;
        entry.rounds = rounds;
        entry.state = TimerState::Pending;
        inner.slots[slot].push(handle.0);
        Ok(())
    }

    /// Re-arm with the previous timeout and callback.
    pub fn restart(&self, handle: TimerHandle) -> UrpcResult<()> {
        let mut inner = self.inner.lock().expect("wheel lock poisoned");
        let current = inner.current;
        let entry = inner
            .timers
            .get_mut(&handle.0)
            .ok_or(UrpcError::BadHandle)?;
        if entry.cb.is_none() {
            return Err(UrpcError::State("timer was never started"));
        }
        if entry.state == TimerState::Pending {
            return Err(UrpcError::State("timer already pending"));
        }
        let (slot, rounds) = slot_for(current, entry.timeout_ms);
        entry.slot = slot;
        entry.rounds = rounds;
        entry.state = TimerState::Pending;
        inner.slots[slot].push(handle.0);
        Ok(())
    }

    pub fn destroy(&self, handle: TimerHandle) {
        let mut inner = self.inner.lock().expect("wheel lock poisoned");
        if let Some(t) = inner.timers.remove(&handle.0) {
            let slot = t.slot;
            inner.slots[slot].retain(|x| *x != handle.0);
            *inner.pool.entry((t.chid, t.is_server)).or_insert(0) += 1;
        }
    }

    pub fn state(&self, handle: TimerHandle) -> TimerState {
        let inner = self.inner.lock().expect("wheel lock poisoned");
        inner
            .timers
            .get(&handle.0)
            .map(|t| t.state)
            .unwrap_or(TimerState::Invalid)
    }

    /// Advance `n` ticks, firing due timers in slot order. Callbacks run
    /// outside the wheel lock.
    pub fn tick(&self, n: usize) {
        for _ in 0..n {
            let mut due: Vec<(u64, TimerCallback, bool)> = Vec::new();
            {
                let mut inner = self.inner.lock().expect("wheel lock poisoned");
                inner.current = (inner.current + 1) % WHEEL_SLOTS;
                let cur = inner.current;
                let ids = std::mem::take(&mut inner.slots[cur]);
                let mut keep = Vec::new();
                for id in ids {
                    let Some(entry) = inner.timers.get_mut(&id) else {
                        continue;
                    };
                    if entry.rounds > 0 {
                        entry.rounds -= 1;
                        keep.push(id);
                        continue;
                    }
                    entry.state = TimerState::Running;
                    if let Some(cb) = entry.cb.take() {
                        due.push((id, cb, entry.periodic));
                    }
                }
                inner.slots[cur] = keep;
            }
            for (id, mut cb, periodic) in due {
                cb();
                let mut inner = self.inner.lock().expect("wheel lock poisoned");
                let current = inner.current;
                if let Some(entry) = inner.timers.get_mut(&id) {
                    entry.cb = Some(cb);
                    if periodic {
                        let (slot, rounds) = slot_for(current, entry.timeout_ms);
                        entry.slot = slot;
                        entry.rounds = rounds;
                        entry.state = TimerState::Pending;
                        inner.slots[slot].push(id);
                    } else {
                        entry.state = TimerState::Finish;
                    }
                } else {
                    debug!(id, "timer destroyed from its own callback");
                }
            }
        }
    }
}

fn slot_for(current: usize, timeout_ms: u32) -> (usize, u32) {
    let ticks = timeout_ms as usize;
    let slot = (current + ticks) % WHEEL_SLOTS;
    let rounds = (ticks / WHEEL_SLOTS) as u32;
    (slot, rounds)
}

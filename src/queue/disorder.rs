// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Disorder-mode dispatch: a pool of jetty nodes per destination EID.
//!
//! Ordered queues tie every message to one jetty; disorder mode spreads
//! requests across whichever node has a free slot, so one slow peer cannot
//! head-of-line block the rest. Each node tracks its available depth and a
//! bitmap of in-flight slots; nodes that take CQE errors move to the error
//! list, nodes whose recovery `modify` fails move to the fatal list and stay
//! there until the periodic sweep retires them.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU32, Ordering},
};

use tracing::{debug, warn};

use crate::{
    errors::{UrpcError, UrpcResult},
    provider::{Jetty, JettyState},
};

pub const NODE_MAX_DEPTH: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeList {
    Working,
    Error,
    Fatal,
}

#[derive(Debug)]
pub struct JettyNode {
    pub dest_eid: [u8; 16],
    pub jetty: Arc<dyn Jetty>,
    depth: u32,
    available_depth: AtomicU32,
    /// Bit `i` set means slot `i` carries an in-flight request.
    inflight: Mutex<u64>,
    list: Mutex<NodeList>,
}

impl JettyNode {
    pub fn new(dest_eid: [u8; 16], jetty: Arc<dyn Jetty>, depth: u32) -> UrpcResult<Self> {
        if depth == 0 || depth > NODE_MAX_DEPTH {
            return Err(UrpcError::Config("disorder node depth out of range"));
        }
        Ok(Self {
            dest_eid,
            jetty,
            depth,
            available_depth: AtomicU32::new(depth),
            inflight: Mutex::new(0),
            list: Mutex::new(NodeList::Working),
        })
    }

    /// A node may take traffic while the provider reports `Working` and at
    /// least one slot is free.
    pub fn sendable(&self) -> bool {
        *self.list.lock().expect("list lock poisoned") == NodeList::Working
            && self.jetty.state() == JettyState::Working
            && self.available_depth.load(Ordering::Acquire) >= 1
    }

    /// Claim a slot; the CAS keeps `available_depth` from ever going
    /// negative under concurrent claimants.
    pub fn reserve_slot(&self) -> Option<u32> {
        let mut avail = self.available_depth.load(Ordering::Acquire);
        loop {
            if avail == 0 {
                return None;
            }
            match self.available_depth.compare_exchange_weak(
                avail,
                avail - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(seen) => avail = seen,
            }
        }
        let mut map = self.inflight.lock().expect("inflight lock poisoned");
        for slot in 0..self.depth {
            if *map & (1u64 << slot) == 0 {
                *map |= 1u64 << slot;
                return Some(slot);
            }
        }
        // depth and bitmap disagree; give the depth back
        self.available_depth.fetch_add(1, Ordering::AcqRel);
        None
    }

    /// Return a slot after its completion was polled.
    pub fn release_slot(&self, slot: u32) {
        let mut map = self.inflight.lock().expect("inflight lock poisoned");
        if *map & (1u64 << slot) == 0 {
            warn!(slot, "disorder slot released twice");
            return;
        }
        *map &= !(1u64 << slot);
        drop(map);
        self.available_depth.fetch_add(1, Ordering::AcqRel);
    }

    pub fn in_flight(&self) -> u32 {
        self.inflight
            .lock()
            .expect("inflight lock poisoned")
            .count_ones()
    }

    pub fn available_depth(&self) -> u32 {
        self.available_depth.load(Ordering::Acquire)
    }

    fn mark_error(&self) {
        *self.list.lock().expect("list lock poisoned") = NodeList::Error;
    }

    fn mark_fatal(&self) {
        *self.list.lock().expect("list lock poisoned") = NodeList::Fatal;
    }

    fn try_recover(&self) -> bool {
        match self.jetty.modify_to_working() {
            Ok(()) => {
                *self.list.lock().expect("list lock poisoned") = NodeList::Working;
                true
            },
            Err(_) => {
                self.mark_fatal();
                false
            },
        }
    }
}

/// Node pool for one disorder queue, indexed by destination EID.
#[derive(Debug, Default)]
pub struct DisorderPool {
    nodes: Mutex<Vec<Arc<JettyNode>>>,
}

impl DisorderPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, node: JettyNode) -> Arc<JettyNode> {
        let node = Arc::new(node);
        self.nodes
            .lock()
            .expect("nodes lock poisoned")
            .push(Arc::clone(&node));
        node
    }

    /// Pick a sendable node for `dest` and reserve one slot on it.
    pub fn acquire(&self, dest: [u8; 16]) -> UrpcResult<(Arc<JettyNode>, u32)> {
        let nodes = self.nodes.lock().expect("nodes lock poisoned");
        for node in nodes.iter().filter(|n| n.dest_eid == dest) {
            if !node.sendable() {
                continue;
            }
            if let Some(slot) = node.reserve_slot() {
                return Ok((Arc::clone(node), slot));
            }
        }
        Err(UrpcError::Exhausted("no sendable disorder node"))
    }

    /// A CQE error arrived on `node`: park it on the error list.
    pub fn on_node_error(&self, node: &Arc<JettyNode>) {
        debug!("disorder node moved to error list");
        node.mark_error();
    }

    /// Periodic sweep: try to recover errored nodes; nodes that refuse the
    /// modify go fatal.
    pub fn recover(&self) -> (usize, usize) {
        let nodes = self.nodes.lock().expect("nodes lock poisoned");
        let mut recovered = 0;
        let mut fatal = 0;
        for node in nodes.iter() {
            let listed = *node.list.lock().expect("list lock poisoned");
            if listed == NodeList::Error {
                if node.try_recover() {
                    recovered += 1;
                } else {
                    fatal += 1;
                }
            }
        }
        (recovered, fatal)
    }

    /// Total in-flight across every node; equals the sum of per-node
    /// in-flight at any sampled point.
    pub fn in_flight_total(&self) -> u32 {
        self.nodes
            .lock()
            .expect("nodes lock poisoned")
            .iter()
            .map(|n| n.in_flight())
            .sum()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().expect("nodes lock poisoned").len()
    }
}

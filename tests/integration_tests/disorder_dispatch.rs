// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Disorder-mode dispatch across two jetty nodes toward one destination:
//! 64 concurrent requests from 4 threads, with the depth accounting staying
//! consistent throughout.

use std::sync::Arc;

use anyhow::Result;
use urpc_rs::{
    provider::{JettyCfg, Provider, loopback::LoopbackFabric},
    queue::disorder::{DisorderPool, JettyNode},
};

use crate::integration_tests::common::eid;

#[test]
fn sixty_four_requests_across_two_nodes() -> Result<()> {
    let fabric = LoopbackFabric::new();
    let provider = fabric.provider(eid(20));
    let dest = eid(21);

    let pool = Arc::new(DisorderPool::new());
    for qid in [100u32, 101] {
        let jetty = provider.create_jetty(&JettyCfg {
            qid,
            tx_depth: 32,
            rx_depth: 32,
            max_sge: 4,
            tx_cq_depth: 66,
            priority: 0,
        })?;
        pool.add_node(JettyNode::new(dest, jetty, 32)?);
    }

    // phase one: 4 threads each claim 16 slots and hold them
    let claims = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut workers = Vec::new();
    for _ in 0..4 {
        let pool = Arc::clone(&pool);
        let claims = Arc::clone(&claims);
        workers.push(std::thread::spawn(move || {
            for _ in 0..16 {
                loop {
                    match pool.acquire(dest) {
                        Ok(got) => {
                            // the pool never over-claims a node
                            assert!(got.0.available_depth() <= 32);
                            claims.lock().expect("claims lock").push(got);
                            break;
                        },
                        Err(_) => std::thread::yield_now(),
                    }
                }
            }
        }));
    }
    for w in workers {
        w.join().expect("worker panicked");
    }

    // 2 nodes x depth 32 = exactly 64 slots, all claimed
    assert_eq!(pool.in_flight_total(), 64);
    let claims = Arc::try_unwrap(claims)
        .expect("sole owner")
        .into_inner()
        .expect("claims lock");
    assert_eq!(claims.len(), 64);

    // per-node in-flight sums to the total at this sampled point
    let mut nodes: Vec<&Arc<JettyNode>> = Vec::new();
    for (node, _) in &claims {
        if !nodes.iter().any(|n| Arc::ptr_eq(n, node)) {
            nodes.push(node);
        }
    }
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes.iter().map(|n| n.in_flight()).sum::<u32>(), 64);
    for node in &nodes {
        assert_eq!(node.available_depth(), 0);
    }

    // phase two: release everything, as completions would
    for (node, slot) in claims {
        node.release_slot(slot);
    }
    assert_eq!(pool.in_flight_total(), 0);

    // with every slot back, a fresh acquire succeeds immediately
    let (node, slot) = pool.acquire(dest).expect("slot available");
    assert!(node.available_depth() < 32 + 1);
    node.release_slot(slot);
    Ok(())
}

#[test]
fn errored_node_is_skipped_until_recovered() -> Result<()> {
    let fabric = LoopbackFabric::new();
    let provider = fabric.provider(eid(22));
    let dest = eid(23);

    let pool = DisorderPool::new();
    let jetty = provider.create_jetty(&JettyCfg {
        qid: 200,
        tx_depth: 8,
        rx_depth: 8,
        max_sge: 4,
        tx_cq_depth: 18,
        priority: 0,
    })?;
    let node = pool.add_node(JettyNode::new(dest, jetty, 8)?);

    pool.on_node_error(&node);
    assert!(
        pool.acquire(dest).is_err(),
        "errored node must not take traffic"
    );

    let (recovered, fatal) = pool.recover();
    assert_eq!((recovered, fatal), (1, 0));
    assert!(pool.acquire(dest).is_ok());
    Ok(())
}

// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Flow-controlled backpressure: a peer with four RX buffers that never
//! polls grants a four-message window; the fifth send must be reported as
//! backpressure without touching the wire.

use std::sync::Arc;

use anyhow::Result;
use urpc_rs::{
    errors::UrpcError,
    provider::{IoDirection, Provider, loopback::LoopbackFabric},
    queue::{Queue, QueueCfg, TxMsg},
};

use crate::integration_tests::common::eid;

#[tokio::test]
async fn fifth_send_is_flow_controlled() -> Result<()> {
    let fabric = LoopbackFabric::new();
    let prov_a: Arc<dyn Provider> = fabric.provider(eid(10));
    let prov_b: Arc<dyn Provider> = fabric.provider(eid(11));

    let cli_q = Queue::create(
        Arc::clone(&prov_a),
        1,
        QueueCfg {
            rx_depth: 64,
            tx_depth: 8,
            rx_buf_size: 4096,
            tx_buf_size: 4096,
            flow_control: true,
            ..Default::default()
        },
    )?;
    let srv_q = Queue::create(
        Arc::clone(&prov_b),
        1,
        QueueCfg {
            rx_depth: 4,
            tx_depth: 8,
            rx_buf_size: 4096,
            tx_buf_size: 4096,
            flow_control: true,
            ..Default::default()
        },
    )?;

    cli_q.bind_peer(srv_q.export_binding())?;
    // binding posts the server's four RX buffers and runs the window
    // bootstrap toward the client
    srv_q.bind_peer(cli_q.export_binding())?;

    // a poll absorbs the advertised window
    let _ = cli_q.poll(IoDirection::Tx, 1);
    assert_eq!(cli_q.fc.remote_window(), 4, "bootstrap window must be 4");

    let payload = [0x5au8; 4096];
    for i in 0..4 {
        cli_q
            .tx_post(&TxMsg {
                data: &payload,
                user_ctx: i,
            })
            .unwrap_or_else(|e| panic!("send {i} must pass the window: {e}"));
    }

    // window is gone; the fifth send must be backpressured, not errored
    let err = cli_q
        .tx_post(&TxMsg {
            data: &payload,
            user_ctx: 4,
        })
        .expect_err("fifth send must not reach the wire");
    assert!(matches!(err, UrpcError::Backpressure), "got {err:?}");
    assert_eq!(cli_q.fc.stats().flow_controlled, 1);

    // the four delivered messages sit in the peer's RX plane untouched
    let comps = srv_q.poll(IoDirection::Rx, 16);
    assert_eq!(comps.len(), 4);
    Ok(())
}

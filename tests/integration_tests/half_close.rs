// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Half-close over the CDC channel: transfer a megabyte, shut down the
//! write side, and walk both peers through the close automaton.

use anyhow::Result;
use urpc_rs::sock::{
    ConnState,
    close::{close_active, close_shutdown_write},
    connection::ConnCfg,
};

use crate::integration_tests::common::connected_pair;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn half_close_after_one_megabyte() -> Result<()> {
    let cfg = ConnCfg {
        sndbuf_len: 65536,
        rmb_len: 65536,
        peer_rmbe_size: 65536,
        ..Default::default()
    };
    let (client, server) = connected_pair(cfg.clone(), cfg);

    // move 1 MiB in bounded chunks, the server consuming as it goes
    let total: u64 = 1 << 20;
    let mut sent: u64 = 0;
    let mut received: u64 = 0;
    while sent < total {
        let staged = client.sendmsg(65536)?;
        sent += staged as u64;
        client.tx_flush()?;
        loop {
            match server.recvmsg(65536) {
                Ok(0) => break,
                Ok(n) => {
                    received += n as u64;
                    if received >= sent {
                        break;
                    }
                },
                Err(urpc_rs::errors::UrpcError::Backpressure) => break,
                Err(e) => return Err(e.into()),
            }
        }
    }
    assert_eq!(received, total, "transfer must be lossless");

    // client shuts down writes only
    close_shutdown_write(&client, None).await?;
    assert_eq!(client.state(), ConnState::PeerCloseWait1);

    // the peer observes peer_done_writing: next recv is an orderly EOF
    assert_eq!(server.state(), ConnState::AppCloseWait1);
    assert_eq!(server.recvmsg(4096)?, 0, "recv after half-close must be 0");

    // the peer closes; our side never sent a full close yet, so it parks
    // waiting for it instead of jumping straight to Closed
    close_active(&server, None).await?;
    assert_eq!(server.state(), ConnState::PeerFinCloseWait);

    // the server's close reached the client: confirm ours and finish
    assert_eq!(client.state(), ConnState::AppCloseWait1);
    close_active(&client, None).await?;
    assert_eq!(client.state(), ConnState::Closed);
    // the client's close frame releases the parked server side
    assert_eq!(server.state(), ConnState::Closed);
    Ok(())
}

// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Attaching to a peer that is not listening must fail within the task
//! timeout and surface as a `ChannelAttach` async event.

use std::time::{Duration, Instant};

use anyhow::Result;
use urpc_rs::{
    errors::ErrCode,
    events::{AsyncEvent, AsyncEventType},
    runtime::Runtime,
};

use crate::integration_tests::common::client_config;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attach_to_dead_peer_reports_within_a_second() -> Result<()> {
    let client = Runtime::init(client_config(3)).await?;
    let channel = client.channel_create()?;
    let chid = channel.chid();

    // nothing listens here
    let dead = "127.0.0.1:9".parse().expect("addr");

    let started = Instant::now();
    let result = client.channel_server_attach(chid, dead, 500).await;
    let elapsed = started.elapsed();
    assert!(result.is_err(), "attach to a dead peer must fail");
    assert!(
        elapsed < Duration::from_secs(1),
        "failure took {elapsed:?}, expected under 1s"
    );

    let mut events = [AsyncEvent {
        channel_id: 0,
        event_type: AsyncEventType::ChannelAttach,
        err_code: ErrCode::Success,
        l_qh: 0,
        r_qh: 0,
        ctx: 0,
    }; 4];
    let n = client.event_get(&mut events);
    assert_eq!(n, 1);
    assert_eq!(events[0].channel_id, chid);
    assert_eq!(events[0].event_type, AsyncEventType::ChannelAttach);
    assert!(
        matches!(events[0].err_code, ErrCode::TransportErr | ErrCode::Timeout),
        "unexpected err_code {:?}",
        events[0].err_code
    );

    client.uninit();
    Ok(())
}

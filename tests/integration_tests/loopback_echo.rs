// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! End-to-end loopback echo: attach over the side-band, announce a queue,
//! refresh to pair, then run one keepalive request/response over the data
//! plane.

use anyhow::Result;
use urpc_rs::{
    errors::ErrCode,
    events::{AsyncEvent, AsyncEventType},
    models::{
        common::{REQ_HEAD_LEN, RSP_HEAD_LEN},
        opcode::{KEEPALIVE_FUNCTION_ID, MsgStatus},
        response::RspHead,
    },
    provider::IoDirection,
    queue::{QueueCfg, TxMsg},
    runtime::Runtime,
};

use crate::integration_tests::common::{client_config, server_config};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loopback_echo() -> Result<()> {
    let server = Runtime::init(server_config(1)).await?;
    let addr = server.listen_addr().expect("listener up");

    // the server side offers one queue to attaching peers
    let srv_q = server.queue_create(QueueCfg {
        rx_depth: 64,
        tx_depth: 64,
        rx_buf_size: 4096,
        tx_buf_size: 4096,
        ..Default::default()
    })?;
    server.server_queue_register(srv_q.clone());

    let client = Runtime::init(client_config(2)).await?;
    let channel = client.channel_create()?;
    let chid = channel.chid();

    // attach first, then announce the local queue, then refresh to pair
    let status = client.channel_server_attach(chid, addr, 2000).await?;
    assert_eq!(status.server_chid, channel.mapped_chid());

    let cli_q = client.queue_create(QueueCfg {
        rx_depth: 64,
        tx_depth: 64,
        rx_buf_size: 4096,
        tx_buf_size: 4096,
        ..Default::default()
    })?;
    client.queue_add_local(chid, cli_q.qid(), 2000).await?;
    let paired = client.channel_refresh(chid, 2000).await?;
    assert_eq!(paired, 1, "refresh must pair the announced queue");

    // events for attach, queue add and refresh were emitted
    let mut events = [AsyncEvent {
        channel_id: 0,
        event_type: AsyncEventType::ChannelAttach,
        err_code: ErrCode::Success,
        l_qh: 0,
        r_qh: 0,
        ctx: 0,
    }; 8];
    let n = client.event_get(&mut events);
    assert!(n >= 3);
    assert!(events[..n].iter().any(|e| {
        e.event_type == AsyncEventType::ChannelAttach && e.err_code == ErrCode::Success
    }));

    // 64-byte keepalive request over the paired queue
    let req_id = client.next_req_id();
    let (head, _dma) = urpc_rs::models::request::ReqHeadBuilder::new(chid)
        .function(KEEPALIVE_FUNCTION_ID)
        .req_id(req_id)
        .build(64 - REQ_HEAD_LEN as u32)?;
    let mut frame = vec![0u8; 64];
    head.to_wire_bytes(&mut frame[..REQ_HEAD_LEN])?;
    cli_q.tx_post(&TxMsg {
        data: &frame,
        user_ctx: req_id as u64,
    })?;

    // server drains its RX and answers through the default dispatch
    let handled = server.queue_poll(srv_q.qid(), IoDirection::Rx, 16)?;
    assert_eq!(handled, 1, "server must see exactly one request");

    // client receives the response
    let comps = cli_q.poll(IoDirection::Rx, 16);
    let rsp = comps
        .iter()
        .find(|c| c.dir == IoDirection::Rx)
        .expect("response completion");
    let mut payload = cli_q.rx_payload(rsp);
    assert!(payload.len() >= RSP_HEAD_LEN);
    let rsp_head = RspHead::from_wire_bytes(&mut payload[..RSP_HEAD_LEN])?;
    assert_eq!(rsp_head.req_id.get(), req_id, "response must match the request");
    assert_eq!(rsp_head.status_known(), Some(MsgStatus::Success));

    client.uninit();
    server.uninit();
    Ok(())
}

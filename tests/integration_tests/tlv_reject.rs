// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! A crafted control message whose inner TLV overruns the buffer must be
//! rejected by the parser and answered with a protocol error, without the
//! server reading past the payload.

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use urpc_rs::{
    models::{
        common::CTL_HEAD_LEN,
        control::{CTL_VERSION_1, CtlHead},
        opcode::CtlOpcode,
        tlv::TlvType,
    },
    runtime::Runtime,
};

use crate::integration_tests::common::server_config;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overrunning_tlv_is_rejected_with_protocol_error() -> Result<()> {
    let server = Runtime::init(server_config(30)).await?;
    let addr = server.listen_addr().expect("listener up");

    let mut stream = tokio::net::TcpStream::connect(addr).await?;

    // payload: a TLV claiming one byte more than the buffer holds
    let mut payload = Vec::new();
    payload.extend_from_slice(&(TlvType::AttachMsg as u32).to_le_bytes());
    payload.extend_from_slice(&9u32.to_le_bytes()); // 8 value bytes follow
    payload.extend_from_slice(&[0u8; 8]);

    let mut head = CtlHead::new(
        CTL_VERSION_1,
        CtlOpcode::QueueInfoAttach,
        1,
        payload.len() as u32,
    );
    head.task_id.set(7);
    let mut head_buf = [0u8; CTL_HEAD_LEN];
    head.to_wire_bytes(&mut head_buf)?;

    stream.write_all(&head_buf).await?;
    stream.write_all(&payload).await?;

    // the reply must be an error head addressed to our task
    let mut reply_buf = [0u8; CTL_HEAD_LEN];
    tokio::time::timeout(
        std::time::Duration::from_secs(2),
        stream.read_exact(&mut reply_buf),
    )
    .await
    .expect("server must answer")?;
    let reply = CtlHead::from_wire_bytes(&reply_buf)?;
    assert_eq!(reply.task_id.get(), 7);
    assert_ne!(reply.error_code.get(), 0, "error must be reported");
    assert_eq!(reply.data_size.get(), 0);

    server.uninit();
    Ok(())
}

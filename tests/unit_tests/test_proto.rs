// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

use anyhow::Result;
use urpc_rs::models::{
    ack::AckHead,
    cdc::{CdcMessage, ConnStateFlags, HostCdcState, ProducerFlags},
    common::{
        ACK_HEAD_LEN, CDC_MSG_LEN, CTL_HEAD_LEN, KEEPALIVE_HEAD_LEN, REQ_HEAD_LEN,
        RSP_HEAD_LEN, WireHead,
    },
    control::{CTL_VERSION_1, CtlCapability, CtlHead},
    imm::{ImmData, ImmType, TOKEN_DATA},
    keepalive::KeepaliveHead,
    opcode::{CtlOpcode, MsgStatus, MsgType, PROTO_VERSION},
    parse::Msg,
    request::{ARG_DMA_LEN, ReqHead, ReqHeadBuilder},
    response::{RspHead, RspHeadBuilder},
};
use urpc_rs::queue::cursor::Cursor;

#[test]
fn req_head_roundtrip_with_dma_table() -> Result<()> {
    let (head, dma) = ReqHeadBuilder::new(0x00ab_cdef)
        .with_ack()
        .function(0x0000_1234_5678_9abc)
        .req_id(77)
        .function_defined(9)
        .arg_dma(0xdead_beef_0000, 4096, 0x5555)
        .arg_dma(0xfeed_f00d_0000, 8192, 0x6666)
        .build(100)?;

    let mut wire = vec![0u8; REQ_HEAD_LEN + dma.len()];
    head.to_wire_bytes(&mut wire[..REQ_HEAD_LEN])?;
    wire[REQ_HEAD_LEN..].copy_from_slice(&dma);

    let parsed = ReqHead::from_wire_bytes(&mut wire[..REQ_HEAD_LEN])?;
    assert_eq!(parsed.ver_type.version(), PROTO_VERSION);
    assert_eq!(parsed.ver_type.type_known(), Some(MsgType::Req));
    assert!(parsed.flags.ack());
    assert_eq!(parsed.flags.arg_dma_count(), 2);
    assert_eq!(parsed.function(), 0x0000_1234_5678_9abc);
    assert_eq!(parsed.req_id.get(), 77);
    assert_eq!(parsed.client_channel(), 0x00ab_cdef);
    assert_eq!(parsed.function_defined(), 9);
    assert_eq!(
        parsed.req_total_size.get() as usize,
        REQ_HEAD_LEN + 2 * ARG_DMA_LEN + 100
    );

    let tail = wire[REQ_HEAD_LEN..].to_vec();
    let parsed = ReqHead::from_wire_bytes(&mut wire[..REQ_HEAD_LEN])?;
    let table = parsed.parse_dma_table(&tail)?;
    assert_eq!(table.len(), 2);
    assert_eq!(table[0].address.get(), 0xdead_beef_0000);
    assert_eq!(table[1].size.get(), 8192);
    Ok(())
}

#[test]
fn ack_head_roundtrip() -> Result<()> {
    let head = AckHead::new(0x123456, 42);
    let mut wire = [0u8; ACK_HEAD_LEN];
    head.to_wire_bytes(&mut wire)?;
    let parsed = AckHead::from_wire_bytes(&mut wire)?;
    assert_eq!(parsed.req_id.get(), 42);
    assert_eq!(parsed.client_channel(), 0x123456);
    assert_eq!(parsed.req_id_range.get(), 1);
    Ok(())
}

#[test]
fn rsp_head_roundtrip_and_ack_fold() -> Result<()> {
    let head = RspHeadBuilder::new(MsgStatus::RemoteLenErr, 0x0f0f0f, true)
        .req_id(1000)
        .function_defined(3)
        .response_total_size(RSP_HEAD_LEN as u32 + 64)
        .header;
    let mut wire = [0u8; RSP_HEAD_LEN];
    head.to_wire_bytes(&mut wire)?;
    let parsed = RspHead::from_wire_bytes(&mut wire)?;
    assert_eq!(parsed.ver_type.type_known(), Some(MsgType::AckAndRsp));
    assert_eq!(parsed.status_known(), Some(MsgStatus::RemoteLenErr));
    assert_eq!(parsed.req_id.get(), 1000);
    assert_eq!(parsed.tail_len(), 64);
    Ok(())
}

#[test]
fn keepalive_head_roundtrip() -> Result<()> {
    let head = KeepaliveHead::new(false, 17, 0x00cafe);
    let mut wire = [0u8; KEEPALIVE_HEAD_LEN];
    head.to_wire_bytes(&mut wire)?;
    let parsed = KeepaliveHead::from_wire_bytes(&mut wire)?;
    assert!(!parsed.bits.is_rsp());
    assert_eq!(parsed.l_qid.get(), 17);
    assert_eq!(parsed.server_channel(), 0x00cafe);
    parsed.fill_rsp();
    assert!(parsed.bits.is_rsp());
    Ok(())
}

#[test]
fn ctl_head_roundtrip_rejects_garbage() -> Result<()> {
    let mut head = CtlHead::new(CTL_VERSION_1, CtlOpcode::QueueInfoAttach, 5, 128);
    head.task_id.set(-3);
    head.set_capability(CtlCapability::KEEPALIVE | CtlCapability::IS_START);
    let mut wire = [0u8; CTL_HEAD_LEN];
    head.to_wire_bytes(&mut wire)?;
    let parsed = CtlHead::from_wire_bytes(&wire)?;
    assert_eq!(parsed.ctl_opcode_known(), Some(CtlOpcode::QueueInfoAttach));
    assert_eq!(parsed.task_id.get(), -3);
    assert!(parsed.capability().contains(CtlCapability::IS_START));

    // foreign opcode byte
    let mut bad = wire;
    bad[1] = 0x7f;
    assert!(CtlHead::from_wire_bytes(&bad).is_err());

    // oversized payload
    let mut oversized = CtlHead::new(CTL_VERSION_1, CtlOpcode::SessionUpdate, 0, 0);
    oversized.data_size.set(u32::MAX);
    let mut wire2 = [0u8; CTL_HEAD_LEN];
    oversized.to_wire_bytes(&mut wire2)?;
    assert!(CtlHead::from_wire_bytes(&wire2).is_err());
    Ok(())
}

#[test]
fn cdc_message_roundtrip_and_monotonic_guard() -> Result<()> {
    let mut local = HostCdcState {
        seqno: 2,
        token: 0xabcd,
        prod: Cursor::new(100, 2),
        cons: Cursor::new(50, 1),
        prod_flags: ProducerFlags::WRITE_BLOCKED,
        conn_state_flags: ConnStateFlags::PEER_DONE_WRITING,
        credits: 7,
    };
    let msg = CdcMessage::from_host(&local);
    let mut wire = [0u8; CDC_MSG_LEN];
    msg.to_wire_bytes(&mut wire)?;
    let parsed = CdcMessage::from_wire_bytes(&wire)?;
    assert_eq!(parsed.seqno.get(), 2);
    assert_eq!(parsed.prod.to_host(), Cursor::new(100, 2));
    assert!(parsed.prod_flags().contains(ProducerFlags::WRITE_BLOCKED));
    assert!(parsed
        .conn_state_flags()
        .contains(ConnStateFlags::PEER_DONE_WRITING));
    assert_eq!(parsed.credits, 7);

    // a stale cursor (older non-zero wrap) must not rewind the local view
    let stale_state = HostCdcState {
        prod: Cursor::new(10, 1),
        ..Default::default()
    };
    let older = CdcMessage::from_host(&stale_state);
    older.merge_to_host(&mut local);
    assert_eq!(local.prod, Cursor::new(100, 2), "stale prod applied");
    Ok(())
}

#[test]
fn imm_word_packs_and_unpacks() {
    let imm = ImmData::new(200, true, false, 0x1f_2e3d);
    assert_eq!(imm.credits(), 200);
    assert!(imm.write_blocked());
    assert!(!imm.skip_flag());
    assert_eq!(imm.token(), 0x1f_2e3d);
    assert_eq!(ImmData::from_raw(imm.raw()), imm);

    let fc = ImmData::new(3, false, false, ImmType::FlowControl as u32);
    assert_eq!(fc.imm_type(), Some(ImmType::FlowControl));

    // plain data words carry the reserved zero token and can never alias a
    // flow-control sub-opcode
    let data = ImmData::new(9, true, false, TOKEN_DATA);
    assert_eq!(data.imm_type(), None);
    assert_eq!(data.credits(), 9);
}

#[test]
fn parse_dispatches_on_first_octet() -> Result<()> {
    let (head, _) = ReqHeadBuilder::new(1).function(2).req_id(3).build(0)?;
    let mut wire = vec![0u8; REQ_HEAD_LEN];
    head.to_wire_bytes(&mut wire)?;
    match Msg::from_wire_bytes(&mut wire)? {
        Msg::ReqHead(h) => assert_eq!(h.req_id.get(), 3),
        other => panic!("wrong dispatch: {other:?}"),
    }

    let mut short = vec![wire[0]];
    assert!(Msg::from_wire_bytes(&mut short).is_err());
    Ok(())
}

// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

use urpc_rs::models::handshake::{
    AttachInfo, AttachMsgV1, ChannelInfo, ChannelMsg, DetachInfo, DetachMsgV1,
    InstanceKey, NegMsgV1, QueueBindInfo, QueueInfo,
};

fn sample_queue_info(qid: u32) -> QueueInfo {
    let mut q = QueueInfo::default();
    q.qid.set(qid);
    q.trans_mode.set(0);
    q.rx_depth.set(64);
    q.tx_depth.set(64);
    q.rx_buf_size.set(4096);
    q.priority = 2;
    q.token.set(0xbeef + qid);
    q.seg_addr.set(0x1000_0000 + qid as u64);
    q.seg_len.set(64 * 4096);
    q.window_addr.set(0x2000_0000 + qid as u64);
    q.window_token.set(0xcafe + qid);
    q
}

#[test]
fn neg_msg_roundtrip() {
    for key in [None, Some(vec![1u8, 2, 3, 4, 5])] {
        let msg = NegMsgV1 { crypto_key: key };
        let wire = msg.serialize();
        let back = NegMsgV1::deserialize(&wire).expect("deserialize");
        assert_eq!(back, msg);
    }
}

#[test]
fn attach_msg_roundtrip() {
    let mut attach_info = AttachInfo::default();
    attach_info.keepalive_attr.set(5000);
    attach_info.server_chid.set(0x42);

    let mut chinfo = ChannelInfo::default();
    chinfo.chid.set(7);
    chinfo.key = InstanceKey::new([9u8; 16], 4242, 0x55aa55aa);

    let msg = AttachMsgV1 {
        attach_info,
        chmsgs: vec![ChannelMsg {
            chinfo,
            qinfos: vec![sample_queue_info(1), sample_queue_info(2)],
        }],
    };
    let wire = msg.serialize().expect("serialize");
    let back = AttachMsgV1::deserialize(&wire).expect("deserialize");
    assert_eq!(back, msg);
}

#[test]
fn attach_msg_with_manage_channel_roundtrip() {
    let msg = AttachMsgV1 {
        attach_info: AttachInfo::default(),
        chmsgs: vec![
            ChannelMsg {
                chinfo: ChannelInfo::default(),
                qinfos: vec![sample_queue_info(1)],
            },
            ChannelMsg {
                chinfo: ChannelInfo::default(),
                qinfos: vec![sample_queue_info(100)],
            },
        ],
    };
    let wire = msg.serialize().expect("serialize");
    let back = AttachMsgV1::deserialize(&wire).expect("deserialize");
    assert_eq!(back.chmsgs.len(), 2);
    assert_eq!(back, msg);
}

#[test]
fn detach_msg_roundtrip() {
    let mut detach_info = DetachInfo::default();
    detach_info.client_chid.set(3);
    detach_info.server_chid.set(9);
    let msg = DetachMsgV1 { detach_info };
    let wire = msg.serialize();
    assert_eq!(DetachMsgV1::deserialize(&wire).expect("deserialize"), msg);
}

#[test]
fn queue_bind_info_roundtrip() {
    let bind = QueueBindInfo {
        l_qid: zerocopy::U32::new(4),
        r_qid: zerocopy::U32::new(8),
        mapped_server_chid: zerocopy::U32::new(0x77),
        queue_side: 1,
        ..Default::default()
    };
    let wire = bind.serialize();
    assert_eq!(QueueBindInfo::deserialize(&wire).expect("deserialize"), bind);
}

#[test]
fn attach_msg_declared_count_mismatch_rejected() {
    let msg = AttachMsgV1 {
        attach_info: AttachInfo::default(),
        chmsgs: vec![ChannelMsg {
            chinfo: ChannelInfo::default(),
            qinfos: vec![sample_queue_info(1)],
        }],
    };
    let mut wire = msg.serialize().expect("serialize");
    // flip the array count to claim one more channel msg than present
    let pos = wire
        .windows(4)
        .position(|w| w == 1u32.to_le_bytes())
        .expect("array count present");
    wire[pos..pos + 4].copy_from_slice(&2u32.to_le_bytes());
    assert!(AttachMsgV1::deserialize(&wire).is_err());
}

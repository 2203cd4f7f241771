// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Versioned control-plane message bodies carried as TLV streams behind the
//! control head: negotiation, attach, detach.
//!
//! Each message has a `serialize` producing the TLV buffer and a
//! `deserialize` that rebuilds the typed form, rejecting anything whose
//! declared lengths disagree with the buffer.

use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U32, U64,
    Unaligned,
};

use crate::{
    errors::{UrpcError, UrpcResult},
    models::tlv::{self, TlvIter, TlvType, TlvWriter},
};

pub const MAX_QUEUE_INFO_NUM: usize = 128;
pub const MAX_CHANNEL_MSG_NUM: usize = 2;

/// Endpoint identity: fabric EID + process id + per-boot nonce.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct InstanceKey {
    pub eid: [u8; 16],
    pub pid: U32<LittleEndian>,
    pub instance_nonce: U32<LittleEndian>,
}

impl InstanceKey {
    pub fn new(eid: [u8; 16], pid: u32, nonce: u32) -> Self {
        Self {
            eid,
            pid: U32::new(pid),
            instance_nonce: U32::new(nonce),
        }
    }
}

/// Per-queue descriptor exchanged during attach: everything the peer needs
/// to import the queue and address its registered buffer.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct QueueInfo {
    pub qid: U32<LittleEndian>,
    pub trans_mode: U32<LittleEndian>,
    pub rx_depth: U32<LittleEndian>,
    pub tx_depth: U32<LittleEndian>,
    pub rx_buf_size: U32<LittleEndian>,
    pub priority: u8,
    pub custom_flag: u8,
    pub rsvd: [u8; 2],
    pub token: U32<LittleEndian>,
    pub seg_addr: U64<LittleEndian>,
    pub seg_len: U32<LittleEndian>,
    pub window_addr: U64<LittleEndian>,
    pub window_token: U32<LittleEndian>,
    pub rsvd2: [u8; 4],
}

/// Channel identity as seen by its owner.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ChannelInfo {
    pub chid: U32<LittleEndian>,
    pub key: InstanceKey,
}

/// Attach metadata beside the channel/queue arrays.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct AttachInfo {
    pub keepalive_attr: U64<LittleEndian>,
    /// Filled by the server so the client can address the mapped channel.
    pub server_chid: U32<LittleEndian>,
    rsvd: [u8; 4],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct DetachInfo {
    pub client_chid: U32<LittleEndian>,
    pub server_chid: U32<LittleEndian>,
}

/// Which side of the channel a queue operation targets.
pub const QUEUE_SIDE_LOCAL: u8 = 0;
pub const QUEUE_SIDE_REMOTE: u8 = 1;

/// Parameters of the queue add/rm/pair/unpair operations.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct QueueBindInfo {
    pub l_qid: U32<LittleEndian>,
    pub r_qid: U32<LittleEndian>,
    /// Server channel the peer should resolve remote queues from.
    pub mapped_server_chid: U32<LittleEndian>,
    pub queue_side: u8,
    pub rsvd: [u8; 3],
}

impl QueueBindInfo {
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = TlvWriter::new();
        w.push(TlvType::QueueBindInfo, self.as_bytes());
        w.finish()
    }

    pub fn deserialize(buf: &[u8]) -> UrpcResult<Self> {
        let el = tlv::search(buf, TlvType::QueueBindInfo)?
            .ok_or_else(|| UrpcError::Protocol("queue bind info missing".into()))?;
        QueueBindInfo::read_from_bytes(el.value)
            .map_err(|e| UrpcError::Protocol(format!("bad queue bind info: {e}")))
    }
}

/// One channel plus the queues it is offering.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChannelMsg {
    pub chinfo: ChannelInfo,
    pub qinfos: Vec<QueueInfo>,
}

impl ChannelMsg {
    fn serialize(&self) -> UrpcResult<Vec<u8>> {
        if self.qinfos.len() > MAX_QUEUE_INFO_NUM {
            return Err(UrpcError::Config("too many queues in channel message"));
        }
        let mut elems = TlvWriter::new();
        for q in &self.qinfos {
            elems.push(TlvType::QueueInfo, q.as_bytes());
        }
        let elems = elems.finish();

        let mut inner = TlvWriter::new();
        inner.push(TlvType::ChannelInfo, self.chinfo.as_bytes());
        inner.push_array(self.qinfos.len() as u32, &elems);
        Ok(inner.finish())
    }

    fn deserialize(value: &[u8]) -> UrpcResult<Self> {
        let chinfo_el = tlv::search(value, TlvType::ChannelInfo)?
            .ok_or_else(|| UrpcError::Protocol("channel msg missing info".into()))?;
        let chinfo = ChannelInfo::read_from_bytes(chinfo_el.value)
            .map_err(|e| UrpcError::Protocol(format!("bad channel info: {e}")))?;

        let arr_el = tlv::search(value, TlvType::Array)?
            .ok_or_else(|| UrpcError::Protocol("channel msg missing queue array".into()))?;
        let (num, body) = arr_el.as_array()?;
        if num as usize > MAX_QUEUE_INFO_NUM {
            return Err(UrpcError::Protocol(format!("queue array too large: {num}")));
        }

        let mut qinfos = Vec::with_capacity(num as usize);
        for el in TlvIter::new(body) {
            let el = el?;
            if el.tlv_type != TlvType::QueueInfo as u32 {
                continue;
            }
            let q = QueueInfo::read_from_bytes(el.value)
                .map_err(|e| UrpcError::Protocol(format!("bad queue info: {e}")))?;
            qinfos.push(q);
        }
        if qinfos.len() != num as usize {
            return Err(UrpcError::Protocol(format!(
                "queue array count mismatch: declared {num}, found {}",
                qinfos.len()
            )));
        }
        Ok(Self { chinfo, qinfos })
    }
}

/// Negotiation message (first frame after TCP/TLS): versions and capability
/// bits ride the control head, the optional crypto key rides here.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct NegMsgV1 {
    pub crypto_key: Option<Vec<u8>>,
}

impl NegMsgV1 {
    pub fn serialize(&self) -> Vec<u8> {
        let mut inner = TlvWriter::new();
        if let Some(key) = &self.crypto_key {
            inner.push(TlvType::CryptoKey, key);
        }
        let mut w = TlvWriter::new();
        w.push(TlvType::NegMsg, &inner.finish());
        w.finish()
    }

    pub fn deserialize(buf: &[u8]) -> UrpcResult<Self> {
        let el = tlv::search(buf, TlvType::NegMsg)?
            .ok_or_else(|| UrpcError::Protocol("negotiation msg missing".into()))?;
        let crypto_key =
            tlv::search(el.value, TlvType::CryptoKey)?.map(|k| k.value.to_vec());
        Ok(Self { crypto_key })
    }
}

/// Attach request/response body: attach info + up to two channel messages
/// (the user channel and, when keepalive is on, the manage channel).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AttachMsgV1 {
    pub attach_info: AttachInfo,
    pub chmsgs: Vec<ChannelMsg>,
}

impl AttachMsgV1 {
    pub fn serialize(&self) -> UrpcResult<Vec<u8>> {
        if self.chmsgs.len() > MAX_CHANNEL_MSG_NUM {
            return Err(UrpcError::Config("too many channel messages"));
        }
        let mut elems = TlvWriter::new();
        for ch in &self.chmsgs {
            elems.push(TlvType::ChannelMsg, &ch.serialize()?);
        }
        let elems = elems.finish();

        let mut inner = TlvWriter::new();
        inner.push(TlvType::AttachInfo, self.attach_info.as_bytes());
        inner.push_array(self.chmsgs.len() as u32, &elems);

        let mut w = TlvWriter::new();
        w.push(TlvType::AttachMsg, &inner.finish());
        Ok(w.finish())
    }

    pub fn deserialize(buf: &[u8]) -> UrpcResult<Self> {
        let msg = tlv::search(buf, TlvType::AttachMsg)?
            .ok_or_else(|| UrpcError::Protocol("attach msg missing".into()))?;

        let info_el = tlv::search(msg.value, TlvType::AttachInfo)?
            .ok_or_else(|| UrpcError::Protocol("attach msg missing info".into()))?;
        let attach_info = AttachInfo::read_from_bytes(info_el.value)
            .map_err(|e| UrpcError::Protocol(format!("bad attach info: {e}")))?;

        let arr_el = tlv::search(msg.value, TlvType::Array)?
            .ok_or_else(|| UrpcError::Protocol("attach msg missing channel array".into()))?;
        let (num, body) = arr_el.as_array()?;
        if num as usize > MAX_CHANNEL_MSG_NUM {
            return Err(UrpcError::Protocol(format!("channel array too large: {num}")));
        }

        let mut chmsgs = Vec::with_capacity(num as usize);
        for el in TlvIter::new(body) {
            let el = el?;
            if el.tlv_type != TlvType::ChannelMsg as u32 {
                continue;
            }
            chmsgs.push(ChannelMsg::deserialize(el.value)?);
        }
        if chmsgs.len() != num as usize {
            return Err(UrpcError::Protocol(format!(
                "channel array count mismatch: declared {num}, found {}",
                chmsgs.len()
            )));
        }
        Ok(Self {
            attach_info,
            chmsgs,
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DetachMsgV1 {
    pub detach_info: DetachInfo,
}

impl DetachMsgV1 {
    pub fn serialize(&self) -> Vec<u8> {
        let mut inner = TlvWriter::new();
        inner.push(TlvType::DetachInfo, self.detach_info.as_bytes());
        let mut w = TlvWriter::new();
        w.push(TlvType::DetachMsg, &inner.finish());
        w.finish()
    }

    pub fn deserialize(buf: &[u8]) -> UrpcResult<Self> {
        let msg = tlv::search(buf, TlvType::DetachMsg)?
            .ok_or_else(|| UrpcError::Protocol("detach msg missing".into()))?;
        let info_el = tlv::search(msg.value, TlvType::DetachInfo)?
            .ok_or_else(|| UrpcError::Protocol("detach msg missing info".into()))?;
        let detach_info = DetachInfo::read_from_bytes(info_el.value)
            .map_err(|e| UrpcError::Protocol(format!("bad detach info: {e}")))?;
        Ok(Self { detach_info })
    }
}

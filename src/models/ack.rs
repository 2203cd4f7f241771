// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

use anyhow::{Result, anyhow, bail};
use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32,
    Unaligned,
};

use crate::models::{
    common::{ACK_HEAD_LEN, WireHead, ZeroCopyType, field24_get, field24_put},
    opcode::{MsgType, RawVerType},
};

pub const DEFAULT_REQ_ID_RANGE: u16 = 1;

/// Fixed 12-byte ACK head: confirms `req_id_range` requests starting at
/// `req_id` reached the server.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct AckHead {
    pub ver_type: RawVerType,            // 0
    rsvd1: u8,                           // 1
    pub req_id_range: U16<LittleEndian>, // 2..4
    pub req_id: U32<LittleEndian>,       // 4..8
    chan_rsvd: [u8; 4],                  // 8..12, channel:24 | rsvd:8
}

impl AckHead {
    pub fn new(client_channel: u32, req_id: u32) -> Self {
        let mut head = AckHead {
            ver_type: RawVerType::new(MsgType::Ack),
            req_id_range: U16::new(DEFAULT_REQ_ID_RANGE),
            req_id: U32::new(req_id),
            ..Default::default()
        };
        field24_put(&mut head.chan_rsvd, client_channel);
        head
    }

    pub fn to_wire_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != ACK_HEAD_LEN {
            bail!("buffer length must be {ACK_HEAD_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn from_wire_bytes(buf: &mut [u8]) -> Result<&mut Self> {
        let hdr = <Self as ZFromBytes>::mut_from_bytes(buf)
            .map_err(|e| anyhow!("failed to convert buffer into AckHead: {e}"))?;
        if hdr.ver_type.type_known() != Some(MsgType::Ack) {
            bail!("AckHead: invalid type 0x{:02x}", hdr.ver_type.type_raw());
        }
        Ok(hdr)
    }

    #[inline]
    pub fn client_channel(&self) -> u32 {
        field24_get(self.chan_rsvd)
    }
}

impl WireHead for AckHead {
    #[inline]
    fn to_wire_bytes(&self, buf: &mut [u8]) -> Result<()> {
        self.to_wire_bytes(buf)
    }

    #[inline]
    fn get_msg_type(&self) -> Result<MsgType> {
        self.ver_type
            .type_known()
            .ok_or_else(|| anyhow!("unknown msg type 0x{:02x}", self.ver_type.type_raw()))
    }

    #[inline]
    fn get_req_id(&self) -> u32 {
        self.req_id.get()
    }

    #[inline]
    fn get_channel(&self) -> u32 {
        self.client_channel()
    }

    #[inline]
    fn head_len(&self) -> usize {
        ACK_HEAD_LEN
    }

    #[inline]
    fn tail_len(&self) -> usize {
        0
    }
}

impl ZeroCopyType for AckHead {}

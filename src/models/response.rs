// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

use anyhow::{Result, anyhow, bail};
use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32,
    Unaligned,
};

use crate::models::{
    ack::DEFAULT_REQ_ID_RANGE,
    common::{RSP_HEAD_LEN, WireHead, ZeroCopyType, field24_get, field24_put},
    opcode::{MsgStatus, MsgType, RawVerType},
};

/// Fixed 16-byte RSP head, optionally followed by `return_data_offset[]`
/// words and the return data itself.
///
/// `response_total_size` counts head + return data but not the offset table,
/// mirroring the sender's framing.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct RspHead {
    pub ver_type: RawVerType,                // 0
    pub status: u8,                          // 1
    pub req_id_range: U16<LittleEndian>,     // 2..4
    pub req_id: U32<LittleEndian>,           // 4..8
    chan_fd: [u8; 4],                        // 8..12, channel:24 | function_defined:8
    pub response_total_size: U32<LittleEndian>, // 12..16
}

impl RspHead {
    pub fn to_wire_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != RSP_HEAD_LEN {
            bail!("buffer length must be {RSP_HEAD_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn from_wire_bytes(buf: &mut [u8]) -> Result<&mut Self> {
        let hdr = <Self as ZFromBytes>::mut_from_bytes(buf)
            .map_err(|e| anyhow!("failed to convert buffer into RspHead: {e}"))?;
        match hdr.ver_type.type_known() {
            Some(MsgType::Rsp) | Some(MsgType::AckAndRsp) => Ok(hdr),
            _ => bail!("RspHead: invalid type 0x{:02x}", hdr.ver_type.type_raw()),
        }
    }

    #[inline]
    pub fn status_known(&self) -> Option<MsgStatus> {
        MsgStatus::from_u8(self.status)
    }

    #[inline]
    pub fn client_channel(&self) -> u32 {
        field24_get(self.chan_fd)
    }

    #[inline]
    pub fn function_defined(&self) -> u8 {
        self.chan_fd[3]
    }
}

#[derive(Debug, Default)]
pub struct RspHeadBuilder {
    pub header: RspHead,
}

impl RspHeadBuilder {
    /// `ack` folds the pending ACK into the response (`AckAndRsp`).
    pub fn new(status: MsgStatus, client_channel: u32, ack: bool) -> Self {
        let mut header = RspHead {
            ver_type: RawVerType::new(if ack { MsgType::AckAndRsp } else { MsgType::Rsp }),
            status: status as u8,
            req_id_range: U16::new(DEFAULT_REQ_ID_RANGE),
            ..Default::default()
        };
        field24_put(&mut header.chan_fd, client_channel);
        RspHeadBuilder { header }
    }

    pub fn req_id(mut self, id: u32) -> Self {
        self.header.req_id.set(id);
        self
    }

    pub fn function_defined(mut self, v: u8) -> Self {
        self.header.chan_fd[3] = v;
        self
    }

    /// Total return-data size, excluding the offset table.
    pub fn response_total_size(mut self, size: u32) -> Self {
        self.header.response_total_size.set(size);
        self
    }
}

impl WireHead for RspHead {
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
        RSP_HEAD_LEN
    }

    #[inline]
    fn tail_len(&self) -> usize {
        (self.response_total_size.get() as usize).saturating_sub(RSP_HEAD_LEN)
    }
}

impl ZeroCopyType for RspHead {}

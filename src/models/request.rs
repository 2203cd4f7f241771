// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

use anyhow::{Result, anyhow, bail};
use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U32, U64,
    Unaligned,
};

use crate::models::{
    common::{REQ_HEAD_LEN, WireHead, ZeroCopyType, field24_get, field24_put, field48_get,
        field48_put},
    opcode::{MsgType, RawVerType},
};

const ACK_MASK: u8 = 0b1000_0000;
const DMA_COUNT_MASK: u8 = 0b0001_1111;

/// Second octet of a REQ head: `ack:1 | rsvd:2 | arg_dma_count:5`.
#[repr(transparent)]
#[derive(Debug, Clone, Default, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct RawReqFlags(u8);

impl RawReqFlags {
    #[inline]
    pub const fn ack(&self) -> bool {
        (self.0 & ACK_MASK) != 0
    }

    #[inline]
    pub fn set_ack(&mut self, on: bool) {
        if on {
            self.0 |= ACK_MASK;
        } else {
            self.0 &= !ACK_MASK;
        }
    }

    #[inline]
    pub const fn arg_dma_count(&self) -> u8 {
        self.0 & DMA_COUNT_MASK
    }

    #[inline]
    pub fn set_arg_dma_count(&mut self, n: u8) {
        self.0 = (self.0 & !DMA_COUNT_MASK) | (n & DMA_COUNT_MASK);
    }
}

/// One entry of the argument DMA table that may trail a REQ head: a remote
/// region the server is expected to READ, guarded by its segment token.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ArgDma {
    pub size: U32<LittleEndian>,
    pub address: U64<LittleEndian>,
    pub token: U32<LittleEndian>,
}

pub const ARG_DMA_LEN: usize = 16;

/// Fixed 20-byte head of a REQ message.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ReqHead {
    pub ver_type: RawVerType,              // 0
    pub flags: RawReqFlags,                // 1
    function: [u8; 6],                     // 2..8, 48-bit LE
    pub req_total_size: U32<LittleEndian>, // 8..12
    pub req_id: U32<LittleEndian>,         // 12..16
    chan_fd: [u8; 4],                      // 16..20, channel:24 | function_defined:8
}

impl ReqHead {
    pub fn to_wire_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != REQ_HEAD_LEN {
            bail!("buffer length must be {REQ_HEAD_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn from_wire_bytes(buf: &mut [u8]) -> Result<&mut Self> {
        let hdr = <Self as ZFromBytes>::mut_from_bytes(buf)
            .map_err(|e| anyhow!("failed to convert buffer into ReqHead: {e}"))?;
        match hdr.ver_type.type_known() {
            Some(MsgType::Req) | Some(MsgType::Read) => Ok(hdr),
            _ => bail!("ReqHead: invalid type 0x{:02x}", hdr.ver_type.type_raw()),
        }
    }

    #[inline]
    pub fn function(&self) -> u64 {
        field48_get(self.function)
    }

    #[inline]
    pub fn set_function(&mut self, f: u64) {
        field48_put(&mut self.function, f);
    }

    #[inline]
    pub fn client_channel(&self) -> u32 {
        field24_get(self.chan_fd)
    }

    #[inline]
    pub fn set_client_channel(&mut self, ch: u32) {
        field24_put(&mut self.chan_fd, ch);
    }

    #[inline]
    pub fn function_defined(&self) -> u8 {
        self.chan_fd[3]
    }

    #[inline]
    pub fn set_function_defined(&mut self, v: u8) {
        self.chan_fd[3] = v;
    }

    /// Parse the DMA table trailing the fixed head.
    pub fn parse_dma_table<'a>(&self, tail: &'a [u8]) -> Result<&'a [ArgDma]> {
        let want = self.flags.arg_dma_count() as usize * ARG_DMA_LEN;
        if tail.len() < want {
            bail!(
                "ReqHead: dma table truncated: have {}, need {want}",
                tail.len()
            );
        }
        let (table, _) = <[ArgDma]>::ref_from_prefix_with_elems(
            &tail[..want],
            self.flags.arg_dma_count() as usize,
        )
        .map_err(|e| anyhow!("bad dma table: {e}"))?;
        Ok(table)
    }
}

/// Builder for a REQ head plus its optional argument DMA table.
///
/// The `ack` flag asks the server to emit a standalone ACK as soon as the
/// request is parsed, ahead of the RSP (or folded into it as `AckAndRsp`).
#[derive(Debug, Default)]
pub struct ReqHeadBuilder {
    pub header: ReqHead,
    dma: Vec<ArgDma>,
}

impl ReqHeadBuilder {
    pub fn new(client_channel: u32) -> Self {
        let mut header = ReqHead {
            ver_type: RawVerType::new(MsgType::Req),
            ..Default::default()
        };
        header.set_client_channel(client_channel);
        ReqHeadBuilder {
            header,
            dma: Vec::new(),
        }
    }

    /// Ask for an ACK ahead of the response.
    pub fn with_ack(mut self) -> Self {
        self.header.flags.set_ack(true);
        self
    }

    /// Function id called on the server (48-bit).
    pub fn function(mut self, f: u64) -> Self {
        self.header.set_function(f);
        self
    }

    /// Unique request id within the client channel.
    pub fn req_id(mut self, id: u32) -> Self {
        self.header.req_id.set(id);
        self
    }

    /// Customized per-function byte.
    pub fn function_defined(mut self, v: u8) -> Self {
        self.header.set_function_defined(v);
        self
    }

    /// Append one remote argument region to the DMA table.
    pub fn arg_dma(mut self, address: u64, size: u32, token: u32) -> Self {
        self.dma.push(ArgDma {
            size: U32::new(size),
            address: U64::new(address),
            token: U32::new(token),
        });
        self
    }

    /// Finish: fixes up `arg_dma_count` and `req_total_size` (head + table +
    /// `inline_size` payload bytes the caller will append).
    pub fn build(mut self, inline_size: u32) -> Result<(ReqHead, Vec<u8>)> {
        if self.dma.len() > DMA_COUNT_MASK as usize {
            bail!("dma table too large: {}", self.dma.len());
        }
        self.header.flags.set_arg_dma_count(self.dma.len() as u8);
        let total =
            REQ_HEAD_LEN as u32 + (self.dma.len() * ARG_DMA_LEN) as u32 + inline_size;
        self.header.req_total_size.set(total);

        let mut table = Vec::with_capacity(self.dma.len() * ARG_DMA_LEN);
        for d in &self.dma {
            table.extend_from_slice(d.as_bytes());
        }
        Ok((self.header, table))
    }
}

impl WireHead for ReqHead {
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
        REQ_HEAD_LEN
    }

    #[inline]
    fn tail_len(&self) -> usize {
        (self.req_total_size.get() as usize).saturating_sub(REQ_HEAD_LEN)
    }
}

impl ZeroCopyType for ReqHead {}

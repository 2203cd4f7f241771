// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Control head framing every message on the TCP side-band.
//!
//! Frame layout is always `CtlHead` (24 bytes) followed by `data_size`
//! payload bytes, where the payload is a TLV stream
//! ([`crate::models::handshake`]). The head is the only part the transport
//! inspects; `data_size` drives the two-phase read.

use anyhow::{Result, anyhow, bail};
use bitflags::bitflags;
use zerocopy::{
    FromBytes as ZFromBytes, I16, I32, Immutable, IntoBytes, KnownLayout, LittleEndian,
    U16, U32, Unaligned,
};

use crate::models::{
    common::CTL_HEAD_LEN,
    opcode::{CTL_HDR_OPCODE, CtlOpcode},
};

/// Hard upper bound of a side-band payload; checked once, at the parser.
pub const CTL_BUF_MAX_LEN: u32 = 1 << 28;

pub const CTL_VERSION_0: u8 = 0;
pub const CTL_VERSION_1: u8 = 1;
pub const CTL_VERSION_MAX: u8 = CTL_VERSION_1;

bitflags! {
    /// Capability bits negotiated on the side-band and echoed in every head.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct CtlCapability: u16 {
        const DP_ENCRYPT             = 1 << 0;
        const KEEPALIVE              = 1 << 1;
        /// Primary keepalive task is driven by the server side.
        const PRIMARY_IS_SERVER      = 1 << 2;
        /// Detach the manage channel once the client holds no channel.
        const DETACH_MANAGE          = 1 << 3;
        /// Client created a fresh manage channel during this attach.
        const MANAGE_CHANNEL_CREATED = 1 << 4;
        const FUNC_INFO_ENABLED      = 1 << 5;
        /// Marks the first fragment of a new task.
        const IS_START               = 1 << 6;
        const MULTIPLEX_ENABLED      = 1 << 7;
    }
}

/// 24-byte control head.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct CtlHead {
    pub version: u8,                     // 0
    pub opcode: u8,                      // 1, always CTL_HDR_OPCODE
    pub error_code: I16<LittleEndian>,   // 2..4
    flags: U16<LittleEndian>,            // 4..6, CtlCapability bits
    rsvd2: U16<LittleEndian>,            // 6..8
    pub channel: U32<LittleEndian>,      // 8..12
    pub data_size: U32<LittleEndian>,    // 12..16
    pub ctl_opcode: U32<LittleEndian>,   // 16..20
    pub task_id: I32<LittleEndian>,      // 20..24
}

impl CtlHead {
    pub fn new(version: u8, ctl_opcode: CtlOpcode, channel: u32, data_size: u32) -> Self {
        CtlHead {
            version,
            opcode: CTL_HDR_OPCODE,
            channel: U32::new(channel),
            data_size: U32::new(data_size),
            ctl_opcode: U32::new(ctl_opcode as u32),
            ..Default::default()
        }
    }

    pub fn to_wire_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != CTL_HEAD_LEN {
            bail!("buffer length must be {CTL_HEAD_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }

    /// Parse and sanity-check an inbound head. Rejects foreign opcodes,
    /// unsupported versions and oversized payloads up front so no later
    /// stage needs to re-validate.
    pub fn from_wire_bytes(buf: &[u8]) -> Result<Self> {
        let head = CtlHead::read_from_bytes(buf)
            .map_err(|e| anyhow!("failed to convert buffer into CtlHead: {e}"))?;
        if head.opcode != CTL_HDR_OPCODE {
            bail!("CtlHead: invalid opcode 0x{:02x}", head.opcode);
        }
        if head.version > CTL_VERSION_MAX {
            bail!("CtlHead: unsupported version {}", head.version);
        }
        if head.data_size.get() > CTL_BUF_MAX_LEN {
            bail!("CtlHead: data_size {} exceeds limit", head.data_size.get());
        }
        Ok(head)
    }

    #[inline]
    pub fn capability(&self) -> CtlCapability {
        CtlCapability::from_bits_truncate(self.flags.get())
    }

    #[inline]
    pub fn set_capability(&mut self, cap: CtlCapability) {
        self.flags.set(cap.bits());
    }

    #[inline]
    pub fn ctl_opcode_known(&self) -> Option<CtlOpcode> {
        CtlOpcode::from_u32(self.ctl_opcode.get())
    }

    pub fn set_error(&mut self, code: i16) {
        self.error_code.set(code);
    }
}

// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

use anyhow::{Result, anyhow, bail};
use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16,
    Unaligned,
};

use crate::models::common::{
    KEEPALIVE_HEAD_LEN, SECURITY_EXT_LEN, field24_get, field24_put,
};

pub const KEEPALIVE_VERSION: u8 = 1;

const IS_RSP_MASK: u8 = 0b0000_0001;
const VERSION_SHIFT: u8 = 4;
const VERSION_MASK: u8 = 0xf0;

/// First octet of a keepalive head: `version:4 | rsvd:3 | is_rsp:1`.
#[repr(transparent)]
#[derive(Debug, Clone, Default, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct RawKeepaliveBits(u8);

impl RawKeepaliveBits {
    #[inline]
    pub const fn version(&self) -> u8 {
        (self.0 & VERSION_MASK) >> VERSION_SHIFT
    }

    #[inline]
    pub fn set_version(&mut self, v: u8) {
        self.0 = (self.0 & !VERSION_MASK) | (v << VERSION_SHIFT);
    }

    #[inline]
    pub const fn is_rsp(&self) -> bool {
        (self.0 & IS_RSP_MASK) != 0
    }

    #[inline]
    pub fn set_is_rsp(&mut self, on: bool) {
        if on {
            self.0 |= IS_RSP_MASK;
        } else {
            self.0 &= !IS_RSP_MASK;
        }
    }
}

/// 44-byte keepalive head exchanged over the manage-queue pair.
///
/// The trailing 28 reserved bytes double as the [`SecurityExtHead`] slot when
/// data-plane encryption is negotiated.
#[repr(C)]
#[derive(Debug, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct KeepaliveHead {
    pub bits: RawKeepaliveBits,     // 0
    pub status: u8,                 // 1
    pub l_qid: U16<LittleEndian>,   // 2..4
    chan_rsvd: [u8; 4],             // 4..8, server manage channel:24 | rsvd:8
    rsvd3: [u8; 36],                // 8..44
}

impl Default for KeepaliveHead {
    fn default() -> Self {
        Self {
            bits: RawKeepaliveBits::default(),
            status: 0,
            l_qid: U16::ZERO,
            chan_rsvd: [0; 4],
            rsvd3: [0; 36],
        }
    }
}

impl KeepaliveHead {
    pub fn new(is_rsp: bool, l_qid: u16, server_channel: u32) -> Self {
        let mut head = KeepaliveHead::default();
        head.bits.set_version(KEEPALIVE_VERSION);
        head.bits.set_is_rsp(is_rsp);
        head.l_qid.set(l_qid);
        field24_put(&mut head.chan_rsvd, server_channel);
        head
    }

    pub fn to_wire_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != KEEPALIVE_HEAD_LEN {
            bail!(
                "buffer length must be {KEEPALIVE_HEAD_LEN}, got {}",
                buf.len()
            );
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn from_wire_bytes(buf: &mut [u8]) -> Result<&mut Self> {
        <Self as ZFromBytes>::mut_from_bytes(buf)
            .map_err(|e| anyhow!("failed to convert buffer into KeepaliveHead: {e}"))
    }

    #[inline]
    pub fn server_channel(&self) -> u32 {
        field24_get(self.chan_rsvd)
    }

    /// Flip an inbound request head into its response in place.
    pub fn fill_rsp(&mut self) {
        self.bits.set_is_rsp(true);
    }
}

pub const AES_IV_LEN: usize = 12;
pub const AES_TAG_LEN: usize = 16;

/// Security extension header (IV + GCM tag) appended when `dp_encrypt` is
/// negotiated. The runtime treats both fields as opaque: filling them is the
/// crypto callback's job.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct SecurityExtHead {
    pub iv: [u8; AES_IV_LEN],
    pub tag: [u8; AES_TAG_LEN],
}

impl SecurityExtHead {
    pub fn to_wire_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != SECURITY_EXT_LEN {
            bail!("buffer length must be {SECURITY_EXT_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn from_wire_bytes(buf: &[u8]) -> Result<&Self> {
        <Self as ZFromBytes>::ref_from_bytes(buf)
            .map_err(|e| anyhow!("failed to convert buffer into SecurityExtHead: {e}"))
    }
}

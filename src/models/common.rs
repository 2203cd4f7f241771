// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

use anyhow::Result;
use enum_dispatch::enum_dispatch;
use zerocopy::{FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout};

use crate::models::opcode::MsgType;

pub const REQ_HEAD_LEN: usize = 20;
pub const ACK_HEAD_LEN: usize = 12;
pub const RSP_HEAD_LEN: usize = 16;
pub const KEEPALIVE_HEAD_LEN: usize = 44;
pub const SECURITY_EXT_LEN: usize = 28;
pub const CTL_HEAD_LEN: usize = 24;
pub const CDC_MSG_LEN: usize = 44;

/// Marker for heads that are safe to view in place on a byte buffer.
pub trait ZeroCopyType: KnownLayout + Immutable + IntoBytes + ZFromBytes {}

/// Common functionality over every fixed-layout data-plane head.
///
/// All multi-byte integers cross the wire little-endian (the CDC cursors are
/// the one big-endian exception and live in their own module); the zerocopy
/// field types do the byte-swap, so implementors only expose typed getters.
/// This trait is what the dispatch enum in [`crate::models::parse`] and the
/// RX completion path program against.
#[enum_dispatch]
pub trait WireHead: Sized {
    /// Serialize the head into `buf`; `buf` must be exactly the head's size.
    fn to_wire_bytes(&self, buf: &mut [u8]) -> Result<()>;

    /// First-octet message type.
    fn get_msg_type(&self) -> Result<MsgType>;

    /// Request id this head refers to (0 where the shape has none).
    fn get_req_id(&self) -> u32;

    /// Channel id carried in the head (24-bit on the wire).
    fn get_channel(&self) -> u32;

    /// Size of the fixed head itself.
    fn head_len(&self) -> usize;

    /// Bytes that follow the fixed head (DMA table, return offsets, payload)
    /// according to the head's own length fields.
    fn tail_len(&self) -> usize;

    #[inline]
    fn total_len(&self) -> usize {
        self.head_len() + self.tail_len()
    }
}

// Forward WireHead to &mut T
impl<T: WireHead> WireHead for &mut T {
    #[inline]
    fn to_wire_bytes(&self, buf: &mut [u8]) -> Result<()> {
        (**self).to_wire_bytes(buf)
    }

    #[inline]
    fn get_msg_type(&self) -> Result<MsgType> {
        (**self).get_msg_type()
    }

    #[inline]
    fn get_req_id(&self) -> u32 {
        (**self).get_req_id()
    }

    #[inline]
    fn get_channel(&self) -> u32 {
        (**self).get_channel()
    }

    #[inline]
    fn head_len(&self) -> usize {
        (**self).head_len()
    }

    #[inline]
    fn tail_len(&self) -> usize {
        (**self).tail_len()
    }
}

/// 24-bit field helpers: the channel id shares a 32-bit word with an 8-bit
/// neighbour (`function_defined` or reserved) in several heads.
#[inline]
pub fn field24_get(word: [u8; 4]) -> u32 {
    u32::from_le_bytes([word[0], word[1], word[2], 0])
}

#[inline]
pub fn field24_put(word: &mut [u8; 4], v: u32) {
    let le = v.to_le_bytes();
    word[0] = le[0];
    word[1] = le[1];
    word[2] = le[2];
}

#[inline]
pub fn field48_get(b: [u8; 6]) -> u64 {
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], 0, 0])
}

#[inline]
pub fn field48_put(b: &mut [u8; 6], v: u64) {
    let le = v.to_le_bytes();
    b.copy_from_slice(&le[..6]);
}

// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Helpers for encoding / decoding the very first byte of every data-plane
//! message head.
//!
//! ```text
//!  7   6   5   4   3   2   1   0      bit position
//! +---------------+-----------------+
//! |  VERSION (4)  |    TYPE (4)     |  ← first octet
//! +---------------+-----------------+
//! ```
//!
//! * **VERSION** – protocol version, currently 1.
//! * **TYPE** – message type ([`MsgType`]).
//!
//! The wrapper below keeps the raw byte wire-safe (it can live inside a
//! zerocopy head struct) while offering typed accessors, so no other layer
//! ever touches the nibbles directly.

use core::fmt;

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const PROTO_VERSION: u8 = 1;

/// Opcode of the control head carried on the TCP side-band.
pub const CTL_HDR_OPCODE: u8 = 2;

/// Function id of the built-in keepalive request.
pub const KEEPALIVE_FUNCTION_ID: u64 = 0x0020_0100_0005;

const TYPE_MASK: u8 = 0x0f;
const VERSION_SHIFT: u8 = 4;

/// Data-plane message types.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    #[default]
    Req = 0,
    Ack = 1,
    Rsp = 2,
    AckAndRsp = 3,
    Read = 4,
}

impl MsgType {
    #[inline]
    pub fn from_u4(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Req,
            1 => Self::Ack,
            2 => Self::Rsp,
            3 => Self::AckAndRsp,
            4 => Self::Read,
            _ => return None,
        })
    }
}

/// Returned when the lower nibble contains an undefined message type.
#[derive(Debug, Error)]
#[error("invalid message type: 0x{0:02x}")]
pub struct UnknownMsgType(pub u8);

/// Status a server puts into a RSP head.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MsgStatus {
    #[default]
    Success = 0,
    ServerDecline = 1,
    FunctionErr = 2,
    RemoteLenErr = 3,
    Timeout = 4,
    VersionErr = 5,
    HdrErr = 6,
}

impl MsgStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Success,
            1 => Self::ServerDecline,
            2 => Self::FunctionErr,
            3 => Self::RemoteLenErr,
            4 => Self::Timeout,
            5 => Self::VersionErr,
            6 => Self::HdrErr,
            _ => return None,
        })
    }
}

/// Sub-operations of the side-band control head.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtlOpcode {
    SessionUpdate = 0,
    WorkerChange = 1,
    FunctionChange = 2,
    TpInfoUpdate = 3,
    ServerReady = 4,
    QueueInfoAttach = 5,
    QueueInfoDetach = 6,
    QueueInfoRefresh = 7,
    QueueInfoBind = 8,
    QueueInfoUnbind = 9,
    QueueInfoAdd = 10,
    QueueInfoRm = 11,
    TaskCancel = 12,
}

impl CtlOpcode {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::SessionUpdate,
            1 => Self::WorkerChange,
            2 => Self::FunctionChange,
            3 => Self::TpInfoUpdate,
            4 => Self::ServerReady,
            5 => Self::QueueInfoAttach,
            6 => Self::QueueInfoDetach,
            7 => Self::QueueInfoRefresh,
            8 => Self::QueueInfoBind,
            9 => Self::QueueInfoUnbind,
            10 => Self::QueueInfoAdd,
            11 => Self::QueueInfoRm,
            12 => Self::TaskCancel,
            _ => return None,
        })
    }
}

/// Wire-safe, zero-copy first octet: `version:4 | type:4`.
#[repr(transparent)]
#[derive(Clone, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct RawVerType(u8);

impl RawVerType {
    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_raw(v: u8) -> Self {
        Self(v)
    }

    pub fn new(msg_type: MsgType) -> Self {
        Self(((PROTO_VERSION) << VERSION_SHIFT) | (msg_type as u8))
    }

    #[inline]
    pub const fn version(&self) -> u8 {
        self.0 >> VERSION_SHIFT
    }

    #[inline]
    pub fn set_version(&mut self, v: u8) {
        self.0 = (self.0 & TYPE_MASK) | (v << VERSION_SHIFT);
    }

    #[inline]
    pub const fn type_raw(&self) -> u8 {
        self.0 & TYPE_MASK
    }

    #[inline]
    pub fn type_known(&self) -> Option<MsgType> {
        MsgType::from_u4(self.type_raw())
    }

    #[inline]
    pub fn set_type_known(&mut self, t: MsgType) {
        self.0 = (self.0 & !TYPE_MASK) | (t as u8);
    }
}

impl fmt::Debug for RawVerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tmp = f.debug_struct("RawVerType");
        tmp.field("version", &self.version());
        match self.type_known() {
            Some(t) => tmp.field("type", &t).finish(),
            None => tmp
                .field("type_raw", &format_args!("0x{:02x}", self.type_raw()))
                .finish(),
        }
    }
}

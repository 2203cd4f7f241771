// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

use anyhow::{Result, bail};
use enum_dispatch::enum_dispatch;

use crate::models::{
    ack::AckHead,
    common::WireHead,
    opcode::{MsgType, RawVerType},
    request::ReqHead,
    response::RspHead,
};

/// Typed view over a raw data-plane frame, dispatched on the first octet.
#[enum_dispatch(WireHead)]
#[derive(Debug)]
pub enum Msg<'a> {
    ReqHead(&'a mut ReqHead),
    AckHead(&'a mut AckHead),
    RspHead(&'a mut RspHead),
}

impl<'a> Msg<'a> {
    /// `bytes` must start with the fixed head of the message; trailing
    /// payload is left for the caller to slice via `tail_len()`.
    pub fn from_wire_bytes(bytes: &'a mut [u8]) -> Result<Self> {
        if bytes.is_empty() {
            bail!("empty frame");
        }
        let vt = RawVerType::from_raw(bytes[0]);
        let need = match vt.type_known() {
            Some(MsgType::Req) | Some(MsgType::Read) => crate::models::common::REQ_HEAD_LEN,
            Some(MsgType::Ack) => crate::models::common::ACK_HEAD_LEN,
            Some(MsgType::Rsp) | Some(MsgType::AckAndRsp) => {
                crate::models::common::RSP_HEAD_LEN
            },
            None => bail!("unsupported msg type: 0x{:02x}", vt.type_raw()),
        };
        if bytes.len() < need {
            bail!("frame shorter than its head: {} < {need}", bytes.len());
        }
        match vt.type_known() {
            Some(MsgType::Req) | Some(MsgType::Read) => {
                Ok(Msg::ReqHead(ReqHead::from_wire_bytes(&mut bytes[..need])?))
            },
            Some(MsgType::Ack) => {
                Ok(Msg::AckHead(AckHead::from_wire_bytes(&mut bytes[..need])?))
            },
            _ => Ok(Msg::RspHead(RspHead::from_wire_bytes(&mut bytes[..need])?)),
        }
    }
}

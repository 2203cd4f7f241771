// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Connection Data Control message: the 44-byte fixed frame that carries
//! cursors, credits and connection-state flags between peers.
//!
//! Unlike the rest of the protocol the CDC cursors travel in network byte
//! order; conversion to host cursors happens here and nowhere else. Inbound
//! cursor updates are guarded for monotonicity so a stale message from an
//! older epoch can never rewind a newer value.

use anyhow::{Result, anyhow, bail};
use bitflags::bitflags;
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16, U32,
    Unaligned,
};

use crate::{models::common::CDC_MSG_LEN, queue::cursor::Cursor};

pub const CDC_MSG_TYPE: u8 = 0xFE;

bitflags! {
    /// Producer-side hints piggybacked on a CDC message.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct ProducerFlags: u8 {
        /// Sender ran out of peer RMB space mid-write.
        const WRITE_BLOCKED      = 1 << 0;
        /// Urgent data byte is in flight.
        const URG_DATA_PENDING   = 1 << 1;
        /// Urgent data byte is present in the RMB.
        const URG_DATA_PRESENT   = 1 << 2;
        /// Ask the peer to confirm its consumer cursor.
        const CONS_CURS_UPD_REQ  = 1 << 3;
    }
}

bitflags! {
    /// Connection lifecycle flags; drive the close state machine.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct ConnStateFlags: u8 {
        const PEER_DONE_WRITING = 1 << 0;
        const PEER_CONN_CLOSED  = 1 << 1;
        const PEER_CONN_ABORT   = 1 << 2;
    }
}

impl ConnStateFlags {
    #[inline]
    pub fn any_close(self) -> bool {
        self.intersects(Self::PEER_CONN_CLOSED | Self::PEER_CONN_ABORT)
    }

    #[inline]
    pub fn any_close_or_senddone(self) -> bool {
        self.any_close() || self.contains(Self::PEER_DONE_WRITING)
    }
}

/// Network-order cursor as carried inside a CDC message.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct CdcCursorWire {
    pub count: U32<BigEndian>,
    pub wrap: U16<BigEndian>,
    reserved: U16<BigEndian>,
}

impl CdcCursorWire {
    #[inline]
    pub fn from_host(c: Cursor) -> Self {
        Self {
            count: U32::new(c.count),
            wrap: U16::new(c.wrap),
            reserved: U16::ZERO,
        }
    }

    #[inline]
    pub fn to_host(self) -> Cursor {
        Cursor::new(self.count.get(), self.wrap.get())
    }
}

/// The 44-byte CDC frame (`type = 0xFE`, `len = 44`).
#[repr(C)]
#[derive(Debug, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct CdcMessage {
    pub msg_type: u8,             // 0, CDC_MSG_TYPE
    pub len: u8,                  // 1, always 44
    pub seqno: U16<BigEndian>,    // 2..4
    pub token: U32<BigEndian>,    // 4..8
    pub prod: CdcCursorWire,      // 8..16
    pub cons: CdcCursorWire,      // 16..24, piggybacked "ack"
    prod_flags: u8,               // 24
    conn_state_flags: u8,         // 25
    pub credits: u8,              // 26, synced by each message
    reserved: [u8; 17],           // 27..44
}

impl Default for CdcMessage {
    fn default() -> Self {
        Self {
            msg_type: CDC_MSG_TYPE,
            len: CDC_MSG_LEN as u8,
            seqno: U16::ZERO,
            token: U32::ZERO,
            prod: CdcCursorWire::default(),
            cons: CdcCursorWire::default(),
            prod_flags: 0,
            conn_state_flags: 0,
            credits: 0,
            reserved: [0; 17],
        }
    }
}

/// Host-side view of the last CDC state sent or received.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostCdcState {
    pub seqno: u16,
    pub token: u32,
    pub prod: Cursor,
    pub cons: Cursor,
    pub prod_flags: ProducerFlags,
    pub conn_state_flags: ConnStateFlags,
    pub credits: u8,
}

impl CdcMessage {
    pub fn to_wire_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != CDC_MSG_LEN {
            bail!("buffer length must be {CDC_MSG_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn from_wire_bytes(buf: &[u8]) -> Result<Self> {
        let msg = CdcMessage::read_from_bytes(buf)
            .map_err(|e| anyhow!("failed to convert buffer into CdcMessage: {e}"))?;
        if msg.msg_type != CDC_MSG_TYPE {
            bail!("CdcMessage: invalid type 0x{:02x}", msg.msg_type);
        }
        if msg.len as usize != CDC_MSG_LEN {
            bail!("CdcMessage: invalid len {}", msg.len);
        }
        Ok(msg)
    }

    #[inline]
    pub fn prod_flags(&self) -> ProducerFlags {
        ProducerFlags::from_bits_truncate(self.prod_flags)
    }

    #[inline]
    pub fn conn_state_flags(&self) -> ConnStateFlags {
        ConnStateFlags::from_bits_truncate(self.conn_state_flags)
    }

    /// Build the wire frame from host state.
    pub fn from_host(local: &HostCdcState) -> Self {
        CdcMessage {
            seqno: U16::new(local.seqno),
            token: U32::new(local.token),
            prod: CdcCursorWire::from_host(local.prod),
            cons: CdcCursorWire::from_host(local.cons),
            prod_flags: local.prod_flags.bits(),
            conn_state_flags: local.conn_state_flags.bits(),
            credits: local.credits,
            ..Default::default()
        }
    }

    /// Merge this inbound frame into `local` host state.
    ///
    /// Cursors only ever move forward: an update whose wrap/count pair lies
    /// behind what we already hold is dropped (stale retransmission or
    /// reordered WRITE_IMM), flags and credits are still taken.
    pub fn merge_to_host(&self, local: &mut HostCdcState) {
        local.seqno = self.seqno.get();
        local.token = self.token.get();
        merge_cursor(&mut local.prod, self.prod.to_host());
        merge_cursor(&mut local.cons, self.cons.to_host());
        local.prod_flags = self.prod_flags();
        local.conn_state_flags = self.conn_state_flags();
        local.credits = self.credits;
    }
}

fn merge_cursor(local: &mut Cursor, incoming: Cursor) {
    let stale = (local.wrap > incoming.wrap && incoming.wrap != 0)
        || (local.wrap == incoming.wrap && local.count > incoming.count);
    if !stale {
        *local = incoming;
    }
}

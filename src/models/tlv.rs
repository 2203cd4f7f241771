// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! TLV framing for versioned control messages.
//!
//! Every element is an 8-byte head `{type: u32, len: u32}` followed by `len`
//! value bytes; arrays (`TlvType::Array`) prefix their element stream with a
//! u32 count. Every traversal step checks the declared length against the
//! remaining buffer before touching the value: a parser either consumes the
//! buffer or reports `Protocol`, and never reads past it.

use zerocopy::{FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U32, Unaligned};

use crate::errors::{UrpcError, UrpcResult};

pub const TLV_HEAD_LEN: usize = 8;
pub const TLV_ARR_NUM_LEN: usize = 4;

/// Basic types range 0..=0xf, complex types 0x10..=0xffff.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvType {
    Array = 0xf,
    NegMsg = 0x10,
    CryptoKey = 0x11,
    AttachMsg = 0x12,
    AttachInfo = 0x13,
    ChannelMsg = 0x14,
    ChannelInfo = 0x15,
    QueueInfo = 0x16,
    MemInfo = 0x17,
    DetachMsg = 0x18,
    DetachInfo = 0x19,
    ConnectMsg = 0x1a,
    ConnectInfo = 0x1b,
    QueueBindInfo = 0x1c,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct TlvHead {
    pub tlv_type: U32<LittleEndian>,
    /// Length of the value only, head excluded.
    pub len: U32<LittleEndian>,
}

/// Borrowed view of one TLV element.
#[derive(Debug, Clone, Copy)]
pub struct TlvElement<'a> {
    pub tlv_type: u32,
    pub value: &'a [u8],
    /// Offset of the element head inside the buffer it was parsed from.
    pub offset: usize,
}

impl<'a> TlvElement<'a> {
    #[inline]
    pub fn total_len(&self) -> usize {
        TLV_HEAD_LEN + self.value.len()
    }

    /// Remaining bytes of the containing buffer starting at this element.
    #[inline]
    pub fn left_len(&self, buf_len: usize) -> usize {
        buf_len - self.offset
    }

    /// Interpret the value as an array: `{num: u32, elements…}`.
    pub fn as_array(&self) -> UrpcResult<(u32, &'a [u8])> {
        if self.tlv_type != TlvType::Array as u32 {
            return Err(UrpcError::Protocol("tlv element is not an array".into()));
        }
        if self.value.len() < TLV_ARR_NUM_LEN {
            return Err(UrpcError::Protocol("tlv array shorter than its count".into()));
        }
        let num = u32::from_le_bytes([
            self.value[0],
            self.value[1],
            self.value[2],
            self.value[3],
        ]);
        Ok((num, &self.value[TLV_ARR_NUM_LEN..]))
    }
}

/// Range-safe iterator over a TLV stream.
pub struct TlvIter<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> TlvIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = UrpcResult<TlvElement<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset == self.buf.len() {
            return None;
        }
        match element_at(self.buf, self.offset) {
            Ok(el) => {
                self.offset += el.total_len();
                Some(Ok(el))
            },
            Err(e) => {
                self.offset = self.buf.len(); // stop after a malformed element
                Some(Err(e))
            },
        }
    }
}

fn element_at(buf: &[u8], offset: usize) -> UrpcResult<TlvElement<'_>> {
    let left = buf.len() - offset;
    if left < TLV_HEAD_LEN {
        return Err(UrpcError::Protocol(format!(
            "tlv head truncated: {left} bytes left at offset {offset}"
        )));
    }
    let head = TlvHead::read_from_bytes(&buf[offset..offset + TLV_HEAD_LEN])
        .map_err(|e| UrpcError::Protocol(format!("bad tlv head: {e}")))?;
    let len = head.len.get() as usize;
    // the hard invariant: declared length must fit the remaining buffer
    if len > left - TLV_HEAD_LEN {
        return Err(UrpcError::Protocol(format!(
            "tlv len {len} exceeds remaining {} bytes",
            left - TLV_HEAD_LEN
        )));
    }
    Ok(TlvElement {
        tlv_type: head.tlv_type.get(),
        value: &buf[offset + TLV_HEAD_LEN..offset + TLV_HEAD_LEN + len],
        offset,
    })
}

/// Find the first element of `want` in `buf`. Malformed streams are an
/// error, a clean miss is `Ok(None)`.
pub fn search(buf: &[u8], want: TlvType) -> UrpcResult<Option<TlvElement<'_>>> {
    search_from(buf, 0, want)
}

/// Continue a search behind `cur`.
pub fn search_next<'a>(
    buf: &'a [u8],
    cur: &TlvElement<'a>,
    want: TlvType,
) -> UrpcResult<Option<TlvElement<'a>>> {
    search_from(buf, cur.offset + cur.total_len(), want)
}

fn search_from(buf: &[u8], mut offset: usize, want: TlvType) -> UrpcResult<Option<TlvElement<'_>>> {
    while offset < buf.len() {
        let el = element_at(buf, offset)?;
        if el.tlv_type == want as u32 {
            return Ok(Some(el));
        }
        offset += el.total_len();
    }
    Ok(None)
}

/// Incremental TLV writer; the inverse of [`TlvIter`].
#[derive(Debug, Default)]
pub struct TlvWriter {
    buf: Vec<u8>,
}

impl TlvWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tlv_type: TlvType, value: &[u8]) -> &mut Self {
        self.push_raw(tlv_type as u32, value)
    }

    pub fn push_raw(&mut self, tlv_type: u32, value: &[u8]) -> &mut Self {
        let head = TlvHead {
            tlv_type: U32::new(tlv_type),
            len: U32::new(value.len() as u32),
        };
        self.buf.extend_from_slice(head.as_bytes());
        self.buf.extend_from_slice(value);
        self
    }

    /// Write an array element wrapping `num` pre-serialized elements.
    pub fn push_array(&mut self, num: u32, elements: &[u8]) -> &mut Self {
        let head = TlvHead {
            tlv_type: U32::new(TlvType::Array as u32),
            len: U32::new((TLV_ARR_NUM_LEN + elements.len()) as u32),
        };
        self.buf.extend_from_slice(head.as_bytes());
        self.buf.extend_from_slice(&num.to_le_bytes());
        self.buf.extend_from_slice(elements);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

//! Page-aligned queue buffers and their fabric registration.
//!
//! Sizing follows the classic ring recipe: entry count is rounded to a power
//! of two, the byte size to the next power of two and then up to whole
//! pages, and the final entry count is re-derived from the padded size so
//! `entry_mask` indexing always stays inside the allocation. A buffer must
//! be unregistered from the fabric before its memory is released; the queue
//! owns that ordering.

use std::alloc::{self, Layout};

use tracing::error;

use crate::{
    errors::{UrpcError, UrpcResult},
    provider::{MemHandle, Provider, RegisteredSeg},
    utils::{align_power2_shift, align_up, roundup_pow_of_two},
};

pub const DEFAULT_PAGE_SIZE: u32 = 4096;

#[derive(Debug)]
pub struct QueueBuf {
    ptr: *mut u8,
    layout: Layout,
    pub buf_size: u32,
    pub entry_cnt: u32,
    pub entry_mask: u32,
    pub base_shift: u32,
    /// Per-entry user contexts, indexed `pi & entry_mask`.
    pub wrid: Option<Box<[u64]>>,
    registered: Option<RegisteredSeg>,
}

// The raw pointer is owned by the buffer and only shared with the provider
// through registered addresses.
unsafe impl Send for QueueBuf {}
unsafe impl Sync for QueueBuf {}

impl QueueBuf {
    /// Allocate a ring of at least `max_entry_cnt` entries of
    /// `base_entry_size` bytes each.
    pub fn alloc(
        max_entry_cnt: u32,
        base_entry_size: u32,
        page_size: u32,
        with_wrid: bool,
    ) -> UrpcResult<Self> {
        if max_entry_cnt == 0 || base_entry_size == 0 {
            return Err(UrpcError::Config("queue buffer with zero geometry"));
        }
        let entry_cnt = roundup_pow_of_two(max_entry_cnt);
        let buf_shift = align_power2_shift(entry_cnt as u64 * base_entry_size as u64);
        let base_shift = align_power2_shift(base_entry_size as u64);
        let buf_size = align_up(1u64 << buf_shift, page_size as u64);
        if buf_size > u32::MAX as u64 {
            return Err(UrpcError::Config("queue buffer too large"));
        }
        let buf_size = buf_size as u32;
        let entry_cnt = buf_size >> base_shift;
        let entry_mask = entry_cnt - 1;

        let layout = Layout::from_size_align(buf_size as usize, page_size as usize)
            .map_err(|_| UrpcError::Config("bad page size"))?;
        // zeroed: RX rings are handed to the peer before first use
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(UrpcError::AllocFailed);
        }

        let wrid = with_wrid.then(|| vec![0u64; entry_cnt as usize].into_boxed_slice());

        Ok(Self {
            ptr,
            layout,
            buf_size,
            entry_cnt,
            entry_mask,
            base_shift,
            wrid,
            registered: None,
        })
    }

    #[inline]
    pub fn base_addr(&self) -> u64 {
        self.ptr as u64
    }

    #[inline]
    pub fn entry_size(&self) -> u32 {
        1 << self.base_shift
    }

    /// Address of entry `idx & entry_mask`.
    #[inline]
    pub fn entry_addr(&self, idx: u32) -> u64 {
        self.base_addr() + (((idx & self.entry_mask) as u64) << self.base_shift)
    }

    /// Ring-increment a byte offset: `(off + delta) mod buf_size`.
    #[inline]
    pub fn inc_ptr_wrap(&self, off: u32, delta: u32) -> u32 {
        let sum = off as u64 + delta as u64;
        (sum % self.buf_size as u64) as u32
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.buf_size as usize) }
    }

    /// Register with the fabric; the peer may hold pointers into the region
    /// only after this returns.
    pub fn register(&mut self, provider: &dyn Provider) -> UrpcResult<RegisteredSeg> {
        if let Some(seg) = self.registered {
            return Ok(seg);
        }
        let seg = provider.register(self.base_addr(), self.buf_size)?;
        self.registered = Some(seg);
        Ok(seg)
    }

    pub fn unregister(&mut self, provider: &dyn Provider) -> UrpcResult<()> {
        if let Some(seg) = self.registered.take() {
            provider.unregister(seg.handle)?;
        }
        Ok(())
    }

    #[inline]
    pub fn mem_handle(&self) -> Option<MemHandle> {
        self.registered.map(|s| s.handle)
    }

    #[inline]
    pub fn token(&self) -> Option<u32> {
        self.registered.map(|s| s.token)
    }

    #[inline]
    pub fn is_registered(&self) -> bool {
        self.registered.is_some()
    }
}

impl Drop for QueueBuf {
    fn drop(&mut self) {
        debug_assert!(
            self.registered.is_none(),
            "queue buffer dropped while registered"
        );
        if self.registered.is_some() {
            // the fabric still holds a segment over this range; leaking the
            // pages beats handing the allocator memory a peer can reach
            error!(
                buf_size = self.buf_size,
                "queue buffer dropped while registered; leaking the allocation"
            );
            return;
        }
        unsafe { alloc::dealloc(self.ptr, self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing_rounds_to_pages() {
        let buf = QueueBuf::alloc(100, 96, DEFAULT_PAGE_SIZE, true).expect("alloc");
        // 128 entries of 96B -> shift over 12288 -> 16384 -> page aligned
        assert!(buf.buf_size % DEFAULT_PAGE_SIZE == 0);
        assert_eq!(buf.entry_cnt & (buf.entry_cnt - 1), 0);
        assert_eq!(buf.entry_mask, buf.entry_cnt - 1);
        assert_eq!(buf.entry_size(), 128); // 96 rounded to pow2
        assert!(buf.wrid.is_some());
    }

    #[test]
    fn ring_increment_wraps() {
        let buf = QueueBuf::alloc(4, 1024, DEFAULT_PAGE_SIZE, false).expect("alloc");
        let end = buf.buf_size - 512;
        assert_eq!(buf.inc_ptr_wrap(end, 1024), 512);
        assert_eq!(buf.inc_ptr_wrap(0, buf.buf_size), 0);
    }

    #[test]
    fn zero_geometry_rejected() {
        assert!(matches!(
            QueueBuf::alloc(0, 64, DEFAULT_PAGE_SIZE, false),
            Err(UrpcError::Config(_))
        ));
    }
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Multi-producer multi-consumer ring of u64 offsets in shared memory.
//
// Layout:
//
//   [ RingHeader ]                      192 bytes, cache-line padded
//   [ AtomicU64 ] × max                 entries
//
// Producers reserve a range by CAS on `prod_head`, fill it, then wait for
// earlier producers before publishing through `prod_tail`. Consumers do the
// same on the `cons_*` pair. Indices are free-running u32 and wrap.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::shm::view::{SegView, ShmPod};
use crate::spin_lock::adaptive_yield;

#[repr(C)]
struct RingHeader {
    max: AtomicU32,
    mask: AtomicU32,
    _pad0: [u8; 64 - 8],
    prod_head: AtomicU32,
    prod_tail: AtomicU32,
    _pad1: [u8; 64 - 8],
    cons_head: AtomicU32,
    cons_tail: AtomicU32,
    _pad2: [u8; 64 - 8],
}

const _: () = assert!(std::mem::size_of::<RingHeader>() == 192);

unsafe impl ShmPod for RingHeader {}

const HDR: usize = std::mem::size_of::<RingHeader>();

/// Handle onto a ring living inside a [`SegView`].
///
/// Header and entries are bounds-checked once when the handle is made; the
/// handle is valid for as long as the view it came from.
#[derive(Clone, Copy)]
pub struct ShmRing {
    hdr: NonNull<RingHeader>,
    entries: NonNull<AtomicU64>,
    max: u32,
}

// Safety: as for `SegView`; everything reached through the handle is atomic.
unsafe impl Send for ShmRing {}
unsafe impl Sync for ShmRing {}

impl ShmRing {
    /// Bytes needed for a ring of `max` entries.
    pub fn total_bytes(max: usize) -> Result<usize> {
        if max == 0 || !max.is_power_of_two() || max > (1 << 31) {
            return Err(Error::NotPowerOfTwo(max));
        }
        Ok(HDR + max * std::mem::size_of::<u64>())
    }

    /// Lay out an empty ring at the start of `view`.
    pub fn init(view: SegView, max: usize) -> Result<Self> {
        let total = Self::total_bytes(max)?;
        let view = view.sub(0, total)?;
        view.zero(0, total)?;
        let hdr: &RingHeader = view.get(0)?;
        hdr.max.store(max as u32, Ordering::Relaxed);
        hdr.mask.store(max as u32 - 1, Ordering::Release);
        Self::bind(view, max)
    }

    /// Attach to a ring previously laid out by [`init`](Self::init).
    pub fn attach(view: SegView) -> Result<Self> {
        let hdr: &RingHeader = view.get(0)?;
        let max = hdr.max.load(Ordering::Acquire) as usize;
        Self::total_bytes(max)?;
        Self::bind(view, max)
    }

    fn bind(view: SegView, max: usize) -> Result<Self> {
        let hdr = NonNull::from(view.get::<RingHeader>(0)?);
        let entries = NonNull::from(view.slice::<AtomicU64>(HDR, max)?).cast::<AtomicU64>();
        Ok(Self { hdr, entries, max: max as u32 })
    }

    fn hdr(&self) -> &RingHeader {
        // Safety: checked in `bind`, mapped as long as the source view.
        unsafe { self.hdr.as_ref() }
    }

    fn entries(&self) -> &[AtomicU64] {
        // Safety: as above, `max` entries checked in `bind`.
        unsafe { std::slice::from_raw_parts(self.entries.as_ptr(), self.max as usize) }
    }

    pub fn capacity(&self) -> usize {
        self.max as usize
    }

    /// Entries published and not yet consumed.
    pub fn len(&self) -> usize {
        let h = self.hdr();
        h.prod_tail.load(Ordering::Acquire).wrapping_sub(h.cons_tail.load(Ordering::Acquire)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push one offset. [`Error::QueueFull`] if no room.
    pub fn push(&self, off: u64) -> Result<()> {
        self.push_bulk(&[off])
    }

    /// Push every offset or none of them.
    pub fn push_bulk(&self, offs: &[u64]) -> Result<()> {
        let n = offs.len() as u32;
        if n == 0 {
            return Ok(());
        }
        let h = self.hdr();
        let mask = self.max - 1;

        let mut k = 0u32;
        let head = loop {
            let head = h.prod_head.load(Ordering::Acquire);
            let tail = h.cons_tail.load(Ordering::Acquire);
            let used = head.wrapping_sub(tail);
            if used > self.max {
                // `head` went stale while `tail` moved on.
                adaptive_yield(&mut k);
                continue;
            }
            if self.max - used < n {
                return Err(Error::QueueFull);
            }
            if h
                .prod_head
                .compare_exchange_weak(head, head.wrapping_add(n), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break head;
            }
            adaptive_yield(&mut k);
        };

        let entries = self.entries();
        for (i, &off) in offs.iter().enumerate() {
            entries[(head.wrapping_add(i as u32) & mask) as usize].store(off, Ordering::Relaxed);
        }

        // Publish in reservation order.
        let mut k = 0u32;
        while h.prod_tail.load(Ordering::Acquire) != head {
            adaptive_yield(&mut k);
        }
        h.prod_tail.store(head.wrapping_add(n), Ordering::Release);
        Ok(())
    }

    /// Pop one offset.
    pub fn pop(&self) -> Option<u64> {
        let mut out = [0u64];
        (self.pop_bulk(&mut out) == 1).then_some(out[0])
    }

    /// Pop up to `out.len()` offsets; returns how many were taken.
    pub fn pop_bulk(&self, out: &mut [u64]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let h = self.hdr();
        let mask = self.max - 1;

        let mut k = 0u32;
        let (head, n) = loop {
            let head = h.cons_head.load(Ordering::Acquire);
            let tail = h.prod_tail.load(Ordering::Acquire);
            let avail = tail.wrapping_sub(head);
            if avail == 0 {
                return 0;
            }
            let n = avail.min(out.len() as u32);
            if h
                .cons_head
                .compare_exchange_weak(head, head.wrapping_add(n), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break (head, n);
            }
            adaptive_yield(&mut k);
        };

        let entries = self.entries();
        for (i, slot) in out.iter_mut().take(n as usize).enumerate() {
            *slot = entries[(head.wrapping_add(i as u32) & mask) as usize].load(Ordering::Relaxed);
        }

        let mut k = 0u32;
        while h.cons_tail.load(Ordering::Acquire) != head {
            adaptive_yield(&mut k);
        }
        h.cons_tail.store(head.wrapping_add(n), Ordering::Release);
        n as usize
    }
}

impl std::fmt::Debug for ShmRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRing").field("max", &self.max).field("len", &self.len()).finish()
    }
}

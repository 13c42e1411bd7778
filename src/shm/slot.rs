// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Fixed-size slot allocator in shared memory.
//
// Layout (all offsets relative to the start of the slot region):
//
//   [ SlotHeader ]                      64 bytes
//   [ ShmRing    ]                      free-slot offsets
//   [ slot ] × max                      `size` bytes each
//
// `init` pushes every slot offset onto the ring, so the allocator starts
// with all slots free. `alloc` pops an offset; `dealloc` validates and
// pushes it back.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::shm::ring::ShmRing;
use crate::shm::view::{SegView, ShmPod};

#[repr(C)]
struct SlotHeader {
    max: AtomicU64,
    size: AtomicU64,
    ring_off: AtomicU64,
    data_off: AtomicU64,
    _pad: [u8; 32],
}

const _: () = assert!(std::mem::size_of::<SlotHeader>() == 64);

unsafe impl ShmPod for SlotHeader {}

const HDR: usize = std::mem::size_of::<SlotHeader>();

/// Slot sizes are rounded up to this.
pub const SLOT_ALIGN: usize = 8;

#[derive(Clone, Copy)]
pub struct ShmSlot {
    view: SegView,
    ring: ShmRing,
    max: usize,
    size: usize,
    data_off: usize,
}

impl ShmSlot {
    /// Bytes needed for `max` slots of `size` bytes. `max` must be a power
    /// of two.
    pub fn total_bytes(max: usize, size: usize) -> Result<usize> {
        let ring = ShmRing::total_bytes(max)?;
        let size = round_size(size)?;
        max.checked_mul(size)
            .and_then(|d| d.checked_add(HDR + ring))
            .ok_or_else(|| Error::invalid("slot region size overflows"))
    }

    /// Lay out `max` free slots of `size` bytes at the start of `view`.
    pub fn init(view: SegView, max: usize, size: usize) -> Result<Self> {
        let total = Self::total_bytes(max, size)?;
        let view = view.sub(0, total)?;
        let size = round_size(size)?;
        let ring_off = HDR;
        let data_off = HDR + ShmRing::total_bytes(max)?;

        let hdr: &SlotHeader = view.get(0)?;
        hdr.max.store(max as u64, Ordering::Relaxed);
        hdr.size.store(size as u64, Ordering::Relaxed);
        hdr.ring_off.store(ring_off as u64, Ordering::Relaxed);
        hdr.data_off.store(data_off as u64, Ordering::Release);

        let ring = ShmRing::init(view.sub(ring_off, data_off - ring_off)?, max)?;
        let offs: Vec<u64> = (0..max).map(|i| (data_off + i * size) as u64).collect();
        ring.push_bulk(&offs)?;

        Ok(Self { view, ring, max, size, data_off })
    }

    /// Attach to slots laid out by [`init`](Self::init).
    pub fn attach(view: SegView) -> Result<Self> {
        let hdr: &SlotHeader = view.get(0)?;
        let max = hdr.max.load(Ordering::Acquire) as usize;
        let size = hdr.size.load(Ordering::Acquire) as usize;
        let ring_off = hdr.ring_off.load(Ordering::Acquire) as usize;
        let data_off = hdr.data_off.load(Ordering::Acquire) as usize;

        let total = Self::total_bytes(max, size)?;
        let view = view.sub(0, total)?;
        if ring_off != HDR || data_off != HDR + ShmRing::total_bytes(max)? {
            return Err(Error::invalid("slot header corrupt"));
        }
        let ring = ShmRing::attach(view.sub(ring_off, data_off - ring_off)?)?;
        Ok(Self { view, ring, max, size, data_off })
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    pub fn slot_size(&self) -> usize {
        self.size
    }

    /// Free slots.
    pub fn available(&self) -> usize {
        self.ring.len()
    }

    /// Allocate a slot offset (relative to the slot region).
    pub fn alloc_off(&self, size: usize) -> Option<usize> {
        if size > self.size {
            return None;
        }
        let off = self.ring.pop()? as usize;
        match self.validate(off) {
            Ok(()) => Some(off),
            Err(e) => {
                tracing::error!(off, error = %e, "corrupt free-slot offset dropped");
                None
            }
        }
    }

    /// Allocate a slot and return its local address.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let off = self.alloc_off(size)?;
        self.view.ptr_at(off, self.size).ok()
    }

    /// Return a slot by offset.
    pub fn dealloc_off(&self, off: usize) -> Result<()> {
        self.validate(off)?;
        self.ring.push(off as u64)
    }

    /// Return a slot by local address.
    pub fn dealloc(&self, ptr: NonNull<u8>) -> Result<()> {
        let off = self.view.offset_of(ptr.as_ptr())?;
        self.dealloc_off(off)
    }

    /// Check that `off` names the start of a slot.
    pub fn validate(&self, off: usize) -> Result<()> {
        let rel = off.checked_sub(self.data_off).ok_or(Error::ForeignPointer)?;
        if rel % self.size != 0 || rel / self.size >= self.max {
            return Err(Error::ForeignPointer);
        }
        Ok(())
    }

    /// The view the slot offsets are relative to.
    pub fn view(&self) -> SegView {
        self.view
    }
}

impl std::fmt::Debug for ShmSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmSlot")
            .field("max", &self.max)
            .field("size", &self.size)
            .field("available", &self.available())
            .finish()
    }
}

fn round_size(size: usize) -> Result<usize> {
    if size == 0 {
        return Err(Error::invalid("slot size is 0"));
    }
    Ok(size.div_ceil(SLOT_ALIGN) * SLOT_ALIGN)
}

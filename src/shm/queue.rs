// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-process queue: a ring of published data offsets next to a slot
// allocator.
//
// Layout (offsets relative to the queue base):
//
//   [ QueueHeader ]                     64 bytes
//   [ ShmRing     ]                     published offsets
//   [ ShmSlot     ]                     storage
//
// A producer allocates a slot, fills it and pushes the slot's offset; a
// consumer pops the offset, reads the slot and deallocates it. Every offset
// read back from the ring is validated before use.

use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::shm::ring::ShmRing;
use crate::shm::slot::ShmSlot;
use crate::shm::view::{Region, SegView, ShmPod};
use crate::shm::{ShmHandle, ShmOpenMode};

const MAGIC: u32 = 0x5344_5451; // "SDTQ"

#[repr(C)]
struct QueueHeader {
    magic: AtomicU32,
    _pad0: u32,
    max: AtomicU64,
    size: AtomicU64,
    ring_off: AtomicU64,
    slot_off: AtomicU64,
    total: AtomicU64,
    _pad1: [u8; 16],
}

const _: () = assert!(std::mem::size_of::<QueueHeader>() == 64);

unsafe impl ShmPod for QueueHeader {}

const HDR: usize = std::mem::size_of::<QueueHeader>();

/// Length prefix stored in front of each element by [`ShmQueue::enqueue`].
const LEN_PREFIX: usize = 8;

enum Backing {
    Shm(ShmHandle),
    Heap(Region),
}

pub struct ShmQueue {
    // Keeps the memory behind `view` mapped.
    _backing: Backing,
    view: SegView,
    ring: ShmRing,
    slot: ShmSlot,
    slot_off: usize,
}

impl ShmQueue {
    /// Bytes needed for `max` elements of up to `size` bytes.
    pub fn total_bytes(max: usize, size: usize) -> Result<usize> {
        let ring = ShmRing::total_bytes(max)?;
        let slot = ShmSlot::total_bytes(max, size + LEN_PREFIX)?;
        Ok(HDR + ring + slot)
    }

    /// Create the queue keyed by `path`, or join it when another handle
    /// already laid out a queue of the same geometry there.
    pub fn create(path: &Path, max: usize, size: usize) -> Result<Self> {
        let total = Self::total_bytes(max, size)?;
        let shm = ShmHandle::acquire_path(path, total, ShmOpenMode::CreateOrOpen)?;
        if shm.len() < total {
            return Err(Error::invalid(format!(
                "existing segment for {} holds {} bytes, need {total}",
                path.display(),
                shm.len()
            )));
        }
        let view = shm.view();
        if !shm.is_creator() {
            let hdr: &QueueHeader = view.get(0)?;
            if hdr.magic.load(Ordering::Acquire) == MAGIC {
                let live = (hdr.max.load(Ordering::Relaxed) as usize, hdr.size.load(Ordering::Relaxed) as usize);
                if live != (max, size) {
                    return Err(Error::invalid(format!(
                        "queue {} in use as {} x {}, asked for {max} x {size}",
                        path.display(),
                        live.0,
                        live.1
                    )));
                }
                return Self::attach_view(Backing::Shm(shm), view);
            }
        }
        Self::init(Backing::Shm(shm), view, max, size)
    }

    /// Attach to a queue created by another party.
    pub fn attach(path: &Path) -> Result<Self> {
        let shm = ShmHandle::open_path(path)?;
        let view = shm.view();
        Self::attach_view(Backing::Shm(shm), view)
    }

    /// A queue in private heap memory, same layout.
    pub fn private(max: usize, size: usize) -> Result<Self> {
        let region = Region::new(Self::total_bytes(max, size)?)?;
        let view = region.view();
        Self::init(Backing::Heap(region), view, max, size)
    }

    fn init(backing: Backing, view: SegView, max: usize, size: usize) -> Result<Self> {
        let ring_off = HDR;
        let slot_off = HDR + ShmRing::total_bytes(max)?;
        let total = Self::total_bytes(max, size)?;

        let hdr: &QueueHeader = view.get(0)?;
        hdr.magic.store(0, Ordering::Release);

        let ring = ShmRing::init(view.sub(ring_off, slot_off - ring_off)?, max)?;
        let slot = ShmSlot::init(view.sub(slot_off, total - slot_off)?, max, size + LEN_PREFIX)?;

        hdr.max.store(max as u64, Ordering::Relaxed);
        hdr.size.store(size as u64, Ordering::Relaxed);
        hdr.ring_off.store(ring_off as u64, Ordering::Relaxed);
        hdr.slot_off.store(slot_off as u64, Ordering::Relaxed);
        hdr.total.store(total as u64, Ordering::Relaxed);
        hdr.magic.store(MAGIC, Ordering::Release);

        Ok(Self { _backing: backing, view, ring, slot, slot_off })
    }

    fn attach_view(backing: Backing, view: SegView) -> Result<Self> {
        let hdr: &QueueHeader = view.get(0)?;
        if hdr.magic.load(Ordering::Acquire) != MAGIC {
            return Err(Error::invalid("queue segment not initialised"));
        }
        let max = hdr.max.load(Ordering::Relaxed) as usize;
        let size = hdr.size.load(Ordering::Relaxed) as usize;
        let ring_off = hdr.ring_off.load(Ordering::Relaxed) as usize;
        let slot_off = hdr.slot_off.load(Ordering::Relaxed) as usize;
        let total = hdr.total.load(Ordering::Relaxed) as usize;
        if total != Self::total_bytes(max, size)? || ring_off != HDR {
            return Err(Error::invalid("queue header corrupt"));
        }
        view.check(0, total)?;
        let ring = ShmRing::attach(view.sub(ring_off, slot_off - ring_off)?)?;
        let slot = ShmSlot::attach(view.sub(slot_off, total - slot_off)?)?;
        Ok(Self { _backing: backing, view, ring, slot, slot_off })
    }

    /// Largest element [`enqueue`](Self::enqueue) accepts.
    pub fn unit_size(&self) -> usize {
        self.slot.slot_size() - LEN_PREFIX
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Published elements.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    // -----------------------------------------------------------------------
    // Raw slot API
    // -----------------------------------------------------------------------

    /// Reserve a slot of at least `size` bytes.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.slot.alloc(size)
    }

    /// Publish a slot obtained from [`alloc`](Self::alloc).
    pub fn push(&self, ptr: NonNull<u8>) -> Result<()> {
        let off = self.view.offset_of(ptr.as_ptr())?;
        self.slot.validate(off.checked_sub(self.slot_off).ok_or(Error::ForeignPointer)?)?;
        self.ring.push(off as u64)
    }

    /// Take the oldest published slot.
    pub fn pop(&self) -> Option<NonNull<u8>> {
        let off = self.ring.pop()? as usize;
        let valid = off
            .checked_sub(self.slot_off)
            .ok_or(Error::ForeignPointer)
            .and_then(|rel| self.slot.validate(rel));
        if let Err(e) = valid {
            tracing::error!(off, error = %e, "corrupt queue offset dropped");
            return None;
        }
        self.view.ptr_at(off, self.slot.slot_size()).ok()
    }

    /// Release a popped slot.
    pub fn dealloc(&self, ptr: NonNull<u8>) -> Result<()> {
        self.slot.dealloc(ptr)
    }

    // -----------------------------------------------------------------------
    // Length-prefixed element API
    // -----------------------------------------------------------------------

    /// Copy the concatenation of `parts` into one element and publish it.
    pub fn enqueue(&self, parts: &[&[u8]]) -> Result<()> {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        if len > self.unit_size() {
            return Err(Error::invalid(format!("element of {len} bytes exceeds unit {}", self.unit_size())));
        }
        let ptr = self.alloc(len + LEN_PREFIX).ok_or(Error::QueueFull)?;
        let off = self.view.offset_of(ptr.as_ptr())?;
        self.view.write(off, &(len as u64).to_le_bytes())?;
        let mut at = off + LEN_PREFIX;
        for p in parts {
            self.view.write(at, p)?;
            at += p.len();
        }
        if let Err(e) = self.push(ptr) {
            self.dealloc(ptr)?;
            return Err(e);
        }
        Ok(())
    }

    /// Pop one element and hand its bytes to `f`.
    pub fn dequeue<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let ptr = self.pop()?;
        let result = self.read_element(ptr).map(f);
        if let Err(e) = self.dealloc(ptr) {
            tracing::error!(error = %e, "queue slot release failed");
        }
        match result {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::error!(error = %e, "corrupt queue element dropped");
                None
            }
        }
    }

    fn read_element(&self, ptr: NonNull<u8>) -> Result<&[u8]> {
        let off = self.view.offset_of(ptr.as_ptr())?;
        let mut len = [0u8; LEN_PREFIX];
        self.view.read(off, &mut len)?;
        let len = u64::from_le_bytes(len) as usize;
        if len > self.unit_size() {
            return Err(Error::OffsetOutOfBounds { off, len, total: self.unit_size() });
        }
        // Safety: the slot is owned by this consumer until dealloc.
        unsafe { self.view.bytes(off + LEN_PREFIX, len) }
    }
}

impl std::fmt::Debug for ShmQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmQueue")
            .field("capacity", &self.capacity())
            .field("unit_size", &self.unit_size())
            .field("len", &self.len())
            .finish()
    }
}

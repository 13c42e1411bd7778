// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bounded in-process block queue.
//
// Storage comes from a `ChunkPool`; the queue itself is a bounded MPMC ring
// of slot pointers. A producer allocates a `Block`, fills it and pushes it;
// ownership moves with the block, and the slot goes back to the pool when
// the consumer drops it.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::error::{Error, Result};
use crate::mem::chunk::ChunkPool;

struct Shared {
    chunk: ChunkPool,
    ring: ArrayQueue<(usize, usize)>,
}

/// A bounded queue of byte blocks of up to [`unit_size`](Queue::unit_size).
#[derive(Clone)]
pub struct Queue {
    shared: Arc<Shared>,
}

impl Queue {
    /// `max` blocks of `size` bytes.
    pub fn new(max: usize, size: usize) -> Result<Self> {
        let chunk = ChunkPool::new(max, size)?;
        let ring = ArrayQueue::new(max);
        Ok(Self { shared: Arc::new(Shared { chunk, ring }) })
    }

    /// Reserve a block of `len` bytes, `None` if the pool is exhausted or
    /// `len` exceeds the unit size.
    pub fn alloc(&self, len: usize) -> Option<Block> {
        if len > self.unit_size() {
            return None;
        }
        let ptr = self.shared.chunk.alloc()?;
        Some(Block { shared: Arc::clone(&self.shared), ptr, len })
    }

    /// Publish a filled block.
    pub fn push(&self, block: Block) -> Result<()> {
        if !Arc::ptr_eq(&block.shared, &self.shared) {
            return Err(Error::ForeignPointer);
        }
        let entry = (block.ptr.as_ptr() as usize, block.len);
        // The ring holds as many entries as the pool has slots, so a block
        // from this pool always fits.
        self.shared.ring.push(entry).map_err(|_| Error::QueueFull)?;
        std::mem::forget(block);
        Ok(())
    }

    /// Take the oldest published block.
    pub fn pop(&self) -> Option<Block> {
        let (addr, len) = self.shared.ring.pop()?;
        let ptr = NonNull::new(addr as *mut u8)?;
        Some(Block { shared: Arc::clone(&self.shared), ptr, len })
    }

    /// Published blocks waiting to be popped.
    pub fn len(&self) -> usize {
        self.shared.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.chunk.capacity()
    }

    pub fn unit_size(&self) -> usize {
        self.shared.chunk.slot_size()
    }

    /// Slots held by producers, the ring or consumers.
    pub fn in_use(&self) -> usize {
        self.shared.chunk.used()
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("unit_size", &self.unit_size())
            .finish()
    }
}

/// An owned queue slot. Returned to the pool on drop.
pub struct Block {
    shared: Arc<Shared>,
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: a block is the only handle to its slot.
unsafe impl Send for Block {}

impl Block {
    /// Shrink the visible length (e.g. after filling less than reserved).
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }
}

impl Deref for Block {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        // Safety: the block exclusively owns `len <= slot_size` bytes at `ptr`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut [u8] {
        // Safety: as above.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Err(e) = self.shared.chunk.dealloc(self.ptr) {
            tracing::error!(error = %e, "queue block release failed");
        }
    }
}

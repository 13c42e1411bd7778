// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Growable arena allocator.
//
// A list of equally sized blocks, each with a bump cursor and a `failed`
// counter. Small requests are served first-fit from `current` onward; a
// block that failed to satisfy more than FAILED_LIMIT requests is skipped
// by advancing `current`. Requests above `max` are "large": they go to the
// system allocator and are tracked individually so they can be freed out of
// arena order. Cleanup handlers run LIFO when the pool is dropped.

use std::alloc::{self, Layout};
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Largest request served from a block (one page minus one).
pub const MAX_ALLOC_FROM_POOL: usize = 4 * 1024 - 1;

/// Default block size.
pub const DEFAULT_POOL_SIZE: usize = 16 * 1024;

/// Alignment of aligned small allocations and of every block.
pub const POOL_ALIGNMENT: usize = 16;

/// Bytes of each block reserved for bookkeeping.
pub const BLOCK_HEADER: usize = 32;

/// Smallest accepted `create` size.
pub const MIN_POOL_SIZE: usize = BLOCK_HEADER + 2 * POOL_ALIGNMENT;

/// Failures before a block is skipped by `current`.
const FAILED_LIMIT: u32 = 4;

/// Large entries inspected for reuse before appending a new one.
const LARGE_REUSE_SCAN: usize = 4;

struct Block {
    mem: NonNull<u8>,
    layout: Layout,
    last: usize,
    failed: u32,
}

impl Block {
    fn new(cap: usize) -> Result<Self> {
        let layout = Layout::from_size_align(cap, POOL_ALIGNMENT)
            .map_err(|e| Error::invalid(e.to_string()))?;
        // Safety: cap > 0 (checked by MemPool::new).
        let mem = NonNull::new(unsafe { alloc::alloc(layout) })
            .ok_or_else(|| Error::invalid("arena block allocation failed"))?;
        Ok(Self { mem, layout, last: 0, failed: 0 })
    }

    fn cap(&self) -> usize {
        self.layout.size()
    }

    fn try_bump(&mut self, size: usize, aligned: bool) -> Option<NonNull<u8>> {
        let start = if aligned { align_up(self.last, POOL_ALIGNMENT) } else { self.last };
        if start <= self.cap() && self.cap() - start >= size {
            self.last = start + size;
            // Safety: start + size <= cap.
            Some(unsafe { NonNull::new_unchecked(self.mem.as_ptr().add(start)) })
        } else {
            None
        }
    }
}

struct Large {
    ptr: NonNull<u8>,
    layout: Layout,
}

enum CleanupKind {
    Call(Box<dyn FnOnce() + Send>),
    Data { data: NonNull<u8>, handler: Box<dyn FnOnce(NonNull<u8>) + Send> },
    File(RawFd),
}

/// Identifies a registered cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupId(usize);

/// nginx-style arena.
pub struct MemPool {
    blocks: Vec<Block>,
    current: usize,
    max: usize,
    // Newest entry last; reuse scan walks back from the end.
    large: Vec<Option<Large>>,
    // Run back to front.
    cleanups: Vec<Option<CleanupKind>>,
}

// Safety: the pool owns every block and large allocation exclusively.
unsafe impl Send for MemPool {}

impl MemPool {
    /// Create a pool whose blocks are `size` bytes (including [`BLOCK_HEADER`]).
    pub fn new(size: usize) -> Result<Self> {
        if size < MIN_POOL_SIZE {
            return Err(Error::invalid(format!("pool size {size} below {MIN_POOL_SIZE}")));
        }
        let cap = size - BLOCK_HEADER;
        Ok(Self {
            blocks: vec![Block::new(cap)?],
            current: 0,
            max: cap.min(MAX_ALLOC_FROM_POOL),
            large: Vec::new(),
            cleanups: Vec::new(),
        })
    }

    /// Largest request served from blocks.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Aligned allocation.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        if size <= self.max {
            return self.alloc_small(size, true);
        }
        self.alloc_large(size, POOL_ALIGNMENT)
    }

    /// Unaligned allocation; packs tighter for byte strings.
    pub fn nalloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        if size <= self.max {
            return self.alloc_small(size, false);
        }
        self.alloc_large(size, 1)
    }

    /// Zero-filled aligned allocation.
    pub fn calloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        let p = self.alloc(size)?;
        // Safety: `p` points at `size` writable bytes.
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0, size) };
        Ok(p)
    }

    /// Allocation with an explicit alignment; always tracked as large.
    pub fn alloc_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if !align.is_power_of_two() {
            return Err(Error::NotPowerOfTwo(align));
        }
        self.alloc_large(size, align)
    }

    fn alloc_small(&mut self, size: usize, aligned: bool) -> Result<NonNull<u8>> {
        for b in &mut self.blocks[self.current..] {
            if let Some(p) = b.try_bump(size, aligned) {
                return Ok(p);
            }
        }
        self.alloc_block(size)
    }

    fn alloc_block(&mut self, size: usize) -> Result<NonNull<u8>> {
        let mut block = Block::new(self.blocks[0].cap())?;
        let last = self.blocks.len() - 1;
        for i in self.current..last {
            let b = &mut self.blocks[i];
            let failed = b.failed;
            b.failed += 1;
            if failed > FAILED_LIMIT {
                self.current = i + 1;
            }
        }
        // A fresh block always fits `size <= max`.
        let p = block
            .try_bump(size, true)
            .ok_or_else(|| Error::invalid("arena block too small"))?;
        self.blocks.push(block);
        Ok(p)
    }

    fn alloc_large(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let layout = Layout::from_size_align(size.max(1), align)
            .map_err(|e| Error::invalid(e.to_string()))?;
        // Safety: non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc(layout) })
            .ok_or_else(|| Error::invalid("large allocation failed"))?;
        let entry = Large { ptr, layout };

        let free = self.large.iter_mut().rev().take(LARGE_REUSE_SCAN).find(|l| l.is_none());
        match free {
            Some(slot) => *slot = Some(entry),
            None => self.large.push(Some(entry)),
        }
        Ok(ptr)
    }

    /// Release a large allocation early. Block allocations are not freeable.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<()> {
        for slot in self.large.iter_mut() {
            if matches!(slot, Some(l) if l.ptr == ptr) {
                if let Some(l) = slot.take() {
                    // Safety: allocated in `alloc_large` with this layout.
                    unsafe { alloc::dealloc(l.ptr.as_ptr(), l.layout) };
                }
                return Ok(());
            }
        }
        Err(Error::ForeignPointer)
    }

    /// Free large allocations and rewind every block. Cleanups stay armed.
    pub fn reset(&mut self) {
        self.release_large();
        for b in &mut self.blocks {
            b.last = 0;
            b.failed = 0;
        }
        self.current = 0;
    }

    fn release_large(&mut self) {
        for l in self.large.drain(..).flatten() {
            // Safety: allocated in `alloc_large` with this layout.
            unsafe { alloc::dealloc(l.ptr.as_ptr(), l.layout) };
        }
    }

    /// `(block index, offset)` of a block allocation, `None` for large or
    /// foreign pointers.
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<(usize, usize)> {
        let addr = ptr.as_ptr() as usize;
        self.blocks.iter().enumerate().find_map(|(i, b)| {
            let base = b.mem.as_ptr() as usize;
            (addr >= base && addr < base + b.cap()).then(|| (i, addr - base))
        })
    }

    /// Number of blocks in the chain.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Live large allocations.
    pub fn large_count(&self) -> usize {
        self.large.iter().filter(|l| l.is_some()).count()
    }

    // -----------------------------------------------------------------------
    // Cleanups
    // -----------------------------------------------------------------------

    /// Register `handler` to run when the pool is dropped.
    pub fn cleanup_add<F>(&mut self, handler: F) -> CleanupId
    where
        F: FnOnce() + Send + 'static,
    {
        self.push_cleanup(CleanupKind::Call(Box::new(handler)))
    }

    /// Allocate `size` pool bytes and register `handler` to receive them at
    /// drop time. Returns the cleanup id and the data pointer.
    pub fn cleanup_add_with_data<F>(&mut self, size: usize, handler: F) -> Result<(CleanupId, NonNull<u8>)>
    where
        F: FnOnce(NonNull<u8>) + Send + 'static,
    {
        let data = self.calloc(size.max(1))?;
        let id = self.push_cleanup(CleanupKind::Data { data, handler: Box::new(handler) });
        Ok((id, data))
    }

    /// Close `fd` when the pool is dropped.
    pub fn cleanup_file(&mut self, fd: RawFd) -> CleanupId {
        self.push_cleanup(CleanupKind::File(fd))
    }

    /// Close `fd` now and disarm its cleanup. Returns whether one was armed.
    pub fn run_cleanup_file(&mut self, fd: RawFd) -> bool {
        for slot in self.cleanups.iter_mut().rev() {
            if matches!(slot, Some(CleanupKind::File(f)) if *f == fd) {
                if let Some(c) = slot.take() {
                    run_cleanup(c);
                }
                return true;
            }
        }
        false
    }

    fn push_cleanup(&mut self, kind: CleanupKind) -> CleanupId {
        self.cleanups.push(Some(kind));
        CleanupId(self.cleanups.len() - 1)
    }
}

fn run_cleanup(c: CleanupKind) {
    match c {
        CleanupKind::Call(f) => f(),
        CleanupKind::Data { data, handler } => handler(data),
        CleanupKind::File(fd) => {
            // Safety: the fd was handed to the pool for ownership.
            if unsafe { libc::close(fd) } == -1 {
                tracing::warn!(fd, err = %std::io::Error::last_os_error(), "cleanup close failed");
            }
        }
    }
}

impl Drop for MemPool {
    fn drop(&mut self) {
        while let Some(slot) = self.cleanups.pop() {
            if let Some(c) = slot {
                run_cleanup(c);
            }
        }
        self.release_large();
        for b in self.blocks.drain(..) {
            // Safety: allocated in `Block::new` with this layout.
            unsafe { alloc::dealloc(b.mem.as_ptr(), b.layout) };
        }
    }
}

#[inline]
fn align_up(v: usize, a: usize) -> usize {
    (v + a - 1) & !(a - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_skips_exhausted_blocks() {
        let mut pool = MemPool::new(BLOCK_HEADER + 64).unwrap();
        // Each 48-byte request fills most of a 64-byte block.
        for _ in 0..10 {
            pool.alloc(48).unwrap();
        }
        assert_eq!(pool.block_count(), 10);
        assert!(pool.current > 0);
    }

    #[test]
    fn unaligned_allocs_pack() {
        let mut pool = MemPool::new(DEFAULT_POOL_SIZE).unwrap();
        let a = pool.nalloc(3).unwrap();
        let b = pool.nalloc(3).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 3);
        let c = pool.alloc(3).unwrap();
        assert_eq!(c.as_ptr() as usize % POOL_ALIGNMENT, 0);
    }
}

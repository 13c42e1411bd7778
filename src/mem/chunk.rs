// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Fixed-size block pool.
//
// Memory layout for `num` slots of `size` bytes:
//
//   [ slot 0 ][ slot 1 ] ... [ slot num-1 ]     one contiguous allocation
//
// Slots are grouped into pages of PAGE_SLOT_NUM. Each page carries its own
// spin lock and a bitmap (1 bit per slot, 1 = used). `alloc` starts at a
// random page so concurrent callers rarely meet on the same lock; `dealloc`
// finds page/word/bit from the pointer offset alone.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use rand::Rng;

use crate::error::{Error, Result};
use crate::spin_lock::SpinLock;

/// Slots per page (one lock per page).
pub const PAGE_SLOT_NUM: usize = 256;

const WORD_BITS: usize = 32;
const PAGE_WORDS: usize = PAGE_SLOT_NUM / WORD_BITS;

/// Slot alignment; every slot starts on this boundary.
pub const SLOT_ALIGN: usize = 16;

struct Page {
    lock: SpinLock,
    // Only written while `lock` is held.
    bits: [AtomicU32; PAGE_WORDS],
}

impl Page {
    fn new(slots: usize) -> Self {
        let page = Page { lock: SpinLock::new(), bits: Default::default() };
        // Bits past the last real slot are permanently "used".
        for bit in slots..PAGE_SLOT_NUM {
            page.bits[bit / WORD_BITS].fetch_or(1 << (bit % WORD_BITS), Ordering::Relaxed);
        }
        page
    }
}

/// A pool of `num` blocks of `size` bytes each.
pub struct ChunkPool {
    base: NonNull<u8>,
    layout: Layout,
    num: usize,
    size: usize,
    pages: Box<[Page]>,
    used: AtomicUsize,
}

// Safety: the raw block storage is only handed out one slot at a time and the
// bitmaps are guarded by per-page locks.
unsafe impl Send for ChunkPool {}
unsafe impl Sync for ChunkPool {}

impl ChunkPool {
    /// Create a pool of `num` slots of at least `size` bytes.
    pub fn new(num: usize, size: usize) -> Result<Self> {
        if num == 0 || size == 0 {
            return Err(Error::invalid(format!("chunk pool {num}x{size}")));
        }
        let size = size.div_ceil(SLOT_ALIGN) * SLOT_ALIGN;
        let total = num
            .checked_mul(size)
            .ok_or_else(|| Error::invalid("chunk pool size overflows"))?;
        let layout = Layout::from_size_align(total, SLOT_ALIGN)
            .map_err(|e| Error::invalid(e.to_string()))?;

        // Safety: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(raw).ok_or_else(|| Error::invalid("chunk pool allocation failed"))?;

        let page_num = num.div_ceil(PAGE_SLOT_NUM);
        let pages = (0..page_num)
            .map(|p| Page::new((num - p * PAGE_SLOT_NUM).min(PAGE_SLOT_NUM)))
            .collect();

        Ok(Self { base, layout, num, size, pages, used: AtomicUsize::new(0) })
    }

    /// Grab a free slot, or `None` if every page is full.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        let n = self.pages.len();
        let start = rand::thread_rng().gen_range(0..n);
        for i in 0..n {
            let pidx = (start + i) % n;
            if let Some(bit) = self.take_bit(&self.pages[pidx]) {
                self.used.fetch_add(1, Ordering::Relaxed);
                let idx = pidx * PAGE_SLOT_NUM + bit;
                // Safety: idx < num, so the offset is inside the allocation.
                return Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(idx * self.size)) });
            }
        }
        None
    }

    fn take_bit(&self, page: &Page) -> Option<usize> {
        let _g = page.lock.guard();
        for (w, word) in page.bits.iter().enumerate() {
            let v = word.load(Ordering::Relaxed);
            if v != u32::MAX {
                let bit = (!v).trailing_zeros() as usize;
                word.store(v | (1 << bit), Ordering::Relaxed);
                return Some(w * WORD_BITS + bit);
            }
        }
        None
    }

    /// Return a slot to the pool.
    ///
    /// Pointers that were not produced by [`alloc`](Self::alloc) on this pool
    /// are rejected with [`Error::ForeignPointer`]; releasing a free slot
    /// yields [`Error::DoubleFree`].
    pub fn dealloc(&self, ptr: NonNull<u8>) -> Result<()> {
        let idx = self.index_of(ptr)?;
        let page = &self.pages[idx / PAGE_SLOT_NUM];
        let bit = idx % PAGE_SLOT_NUM;
        let word = &page.bits[bit / WORD_BITS];
        let mask = 1u32 << (bit % WORD_BITS);

        let _g = page.lock.guard();
        let v = word.load(Ordering::Relaxed);
        if v & mask == 0 {
            return Err(Error::DoubleFree);
        }
        word.store(v & !mask, Ordering::Relaxed);
        self.used.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    fn index_of(&self, ptr: NonNull<u8>) -> Result<usize> {
        let base = self.base.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        let off = addr.checked_sub(base).ok_or(Error::ForeignPointer)?;
        if off >= self.num * self.size || off % self.size != 0 {
            return Err(Error::ForeignPointer);
        }
        Ok(off / self.size)
    }

    /// True if `ptr` lies inside this pool's storage.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.num * self.size
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.num
    }

    /// Usable bytes per slot (rounded up to [`SLOT_ALIGN`]).
    pub fn slot_size(&self) -> usize {
        self.size
    }

    /// Slots currently handed out.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

impl Drop for ChunkPool {
    fn drop(&mut self) {
        // Safety: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for ChunkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkPool")
            .field("num", &self.num)
            .field("size", &self.size)
            .field("pages", &self.pages.len())
            .field("used", &self.used())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_page_padding_is_never_handed_out() {
        let pool = ChunkPool::new(PAGE_SLOT_NUM + 3, 8).unwrap();
        let mut got = Vec::new();
        while let Some(p) = pool.alloc() {
            got.push(p);
        }
        assert_eq!(got.len(), PAGE_SLOT_NUM + 3);
        for p in got {
            assert!(pool.contains(p.as_ptr()));
        }
    }

    #[test]
    fn misaligned_pointer_is_foreign() {
        let pool = ChunkPool::new(4, 32).unwrap();
        let p = pool.alloc().unwrap();
        let inner = unsafe { NonNull::new_unchecked(p.as_ptr().add(1)) };
        assert!(matches!(pool.dealloc(inner), Err(Error::ForeignPointer)));
        pool.dealloc(p).unwrap();
    }
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bounds-checked view over a mapped segment.
//
// Everything placed in shared memory is addressed by byte offset from the
// segment base, never by pointer, because each process maps the segment at
// its own address. `SegView` is the only place those offsets become
// references; every access is checked against the segment length and the
// target type's alignment first.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64};

use crate::error::{Error, Result};

/// Types that may be viewed in shared memory.
///
/// # Safety
/// Implementors must be `#[repr(C)]` (or primitive), contain no pointers,
/// and be valid for every bit pattern including all zeroes.
pub unsafe trait ShmPod: Sized {}

unsafe impl ShmPod for u8 {}
unsafe impl ShmPod for u32 {}
unsafe impl ShmPod for u64 {}
unsafe impl ShmPod for AtomicU32 {}
unsafe impl ShmPod for AtomicI32 {}
unsafe impl ShmPod for AtomicU64 {}

/// A `(base, len)` window onto mapped memory.
#[derive(Clone, Copy)]
pub struct SegView {
    base: NonNull<u8>,
    len: usize,
}

// Safety: the view only hands out `ShmPod` references (atomics for anything
// written concurrently) and raw copies.
unsafe impl Send for SegView {}
unsafe impl Sync for SegView {}

impl SegView {
    /// # Safety
    /// `base..base+len` must stay mapped and writable for as long as this
    /// view, or any view derived from it, is used.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Self { base: NonNull::new(base).unwrap_or(NonNull::dangling()), len: if base.is_null() { 0 } else { len } }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Verify `[off, off+len)` lies inside the view.
    pub fn check(&self, off: usize, len: usize) -> Result<()> {
        match off.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::OffsetOutOfBounds { off, len, total: self.len }),
        }
    }

    /// A narrower view starting at `off`.
    pub fn sub(&self, off: usize, len: usize) -> Result<SegView> {
        self.check(off, len)?;
        // Safety: range checked above, lifetime inherited from `self`.
        Ok(unsafe { SegView::new(self.base.as_ptr().add(off), len) })
    }

    /// Reference a `T` at `off`.
    pub fn get<T: ShmPod>(&self, off: usize) -> Result<&T> {
        let p = self.ptr_at(off, std::mem::size_of::<T>())?;
        if p.as_ptr() as usize % std::mem::align_of::<T>() != 0 {
            return Err(Error::invalid(format!("misaligned offset {off}")));
        }
        // Safety: in bounds, aligned, and any bit pattern is a valid `T`.
        Ok(unsafe { &*(p.as_ptr() as *const T) })
    }

    /// Reference `n` consecutive `T`s at `off`.
    pub fn slice<T: ShmPod>(&self, off: usize, n: usize) -> Result<&[T]> {
        let bytes = n
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| Error::invalid("slice length overflows"))?;
        let p = self.ptr_at(off, bytes)?;
        if p.as_ptr() as usize % std::mem::align_of::<T>() != 0 {
            return Err(Error::invalid(format!("misaligned offset {off}")));
        }
        // Safety: as in `get`.
        Ok(unsafe { std::slice::from_raw_parts(p.as_ptr() as *const T, n) })
    }

    /// Pointer to `len` bytes at `off`.
    pub fn ptr_at(&self, off: usize, len: usize) -> Result<NonNull<u8>> {
        self.check(off, len)?;
        // Safety: in bounds.
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(off)) })
    }

    /// Offset of a pointer into this view.
    pub fn offset_of(&self, p: *const u8) -> Result<usize> {
        let base = self.base.as_ptr() as usize;
        let addr = p as usize;
        match addr.checked_sub(base) {
            Some(off) if off < self.len => Ok(off),
            _ => Err(Error::ForeignPointer),
        }
    }

    /// Copy `data` into the view at `off`.
    ///
    /// The caller must own `[off, off+len)` by protocol (e.g. a slot it
    /// allocated); no other party may access the range concurrently.
    pub fn write(&self, off: usize, data: &[u8]) -> Result<()> {
        let p = self.ptr_at(off, data.len())?;
        // Safety: in bounds; exclusive by protocol.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), p.as_ptr(), data.len()) };
        Ok(())
    }

    /// Copy `out.len()` bytes at `off` out of the view.
    pub fn read(&self, off: usize, out: &mut [u8]) -> Result<()> {
        let p = self.ptr_at(off, out.len())?;
        // Safety: in bounds.
        unsafe { std::ptr::copy_nonoverlapping(p.as_ptr(), out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    /// Borrow `len` bytes at `off`.
    ///
    /// # Safety
    /// No one may write the range while the slice is alive.
    pub unsafe fn bytes(&self, off: usize, len: usize) -> Result<&[u8]> {
        let p = self.ptr_at(off, len)?;
        Ok(std::slice::from_raw_parts(p.as_ptr(), len))
    }

    /// Zero `len` bytes at `off`.
    pub fn zero(&self, off: usize, len: usize) -> Result<()> {
        let p = self.ptr_at(off, len)?;
        // Safety: in bounds; used only during single-party initialisation.
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0, len) };
        Ok(())
    }
}

impl std::fmt::Debug for SegView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegView").field("base", &self.base).field("len", &self.len).finish()
    }
}

/// Heap-backed, zeroed, cache-line aligned region.
///
/// Lets the shared-memory structures run inside one process without a
/// named segment.
pub struct Region {
    ptr: NonNull<u8>,
    layout: Layout,
}

// Safety: the region owns its allocation; access goes through `SegView`.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub const ALIGN: usize = 64;

    pub fn new(len: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len.max(1), Self::ALIGN)
            .map_err(|e| Error::invalid(e.to_string()))?;
        // Safety: non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or_else(|| Error::invalid("region allocation failed"))?;
        Ok(Self { ptr, layout })
    }

    pub fn view(&self) -> SegView {
        // Safety: lives as long as `self`.
        unsafe { SegView::new(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // Safety: allocated in `new` with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Reference-counted segment table.
//
// Maps address ranges [addr, addr+size) to an atomic count and the release
// function of the pool that produced them. Any address inside a range
// resolves to that range's entry. Count changes run under the shared lock;
// insert and remove take the exclusive lock.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::rw_lock::RwLock;

/// Returned by [`SegRefTable::incr`] for addresses the table does not track.
pub const UNTRACKED_INCR: i32 = -1;
/// Returned by [`SegRefTable::decr`] for addresses the table does not track.
pub const UNTRACKED_DECR: i32 = 0;

type Release = Box<dyn FnOnce(NonNull<u8>) + Send + Sync>;

struct Entry {
    size: usize,
    count: AtomicI32,
    release: Option<Release>,
}

#[derive(Default)]
pub struct SegRefTable {
    map: RwLock<BTreeMap<usize, Entry>>,
}

fn find(map: &BTreeMap<usize, Entry>, addr: usize) -> Option<(usize, &Entry)> {
    let (&start, e) = map.range(..=addr).next_back()?;
    (addr < start + e.size.max(1)).then_some((start, e))
}

impl SegRefTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `size` bytes through `alloc_fn` and track the result with a
    /// count of 1. `dealloc_fn` runs once, when the count drops to zero.
    pub fn alloc<P, A, D>(&self, size: usize, pool: P, alloc_fn: A, dealloc_fn: D) -> Option<NonNull<u8>>
    where
        P: Send + Sync + 'static,
        A: FnOnce(&P, usize) -> Option<NonNull<u8>>,
        D: FnOnce(&P, NonNull<u8>) + Send + Sync + 'static,
    {
        let ptr = alloc_fn(&pool, size)?;
        let release: Release = Box::new(move |p| dealloc_fn(&pool, p));
        let entry = Entry { size, count: AtomicI32::new(1), release: Some(release) };
        self.map.write().insert(ptr.as_ptr() as usize, entry);
        Some(ptr)
    }

    /// Add a reference. Returns the new count or [`UNTRACKED_INCR`].
    pub fn incr(&self, addr: *const u8) -> i32 {
        let map = self.map.read();
        match find(&map, addr as usize) {
            Some((_, e)) => e.count.fetch_add(1, Ordering::AcqRel) + 1,
            None => UNTRACKED_INCR,
        }
    }

    /// Drop a reference. Releases the allocation at zero. Returns the new
    /// count, which is also [`UNTRACKED_DECR`] for untracked addresses.
    pub fn decr(&self, addr: *const u8) -> i32 {
        {
            let map = self.map.read();
            let Some((_, e)) = find(&map, addr as usize) else {
                return UNTRACKED_DECR;
            };
            let n = e.count.fetch_sub(1, Ordering::AcqRel) - 1;
            if n > 0 {
                return n;
            }
        }

        let removed = {
            let mut map = self.map.write();
            let start = match find(&map, addr as usize) {
                // Someone re-incremented between the two locks.
                Some((_, e)) if e.count.load(Ordering::Acquire) > 0 => {
                    return e.count.load(Ordering::Acquire);
                }
                Some((start, _)) => start,
                None => return UNTRACKED_DECR,
            };
            map.remove(&start).map(|e| (start, e))
        };

        if let Some((start, mut e)) = removed {
            if let (Some(release), Some(p)) = (e.release.take(), NonNull::new(start as *mut u8)) {
                release(p);
            }
        }
        0
    }

    /// Alias of [`decr`](Self::decr); the owning pool is already recorded.
    pub fn dealloc(&self, addr: *const u8) -> i32 {
        self.decr(addr)
    }

    /// Current count, `None` if untracked.
    pub fn count(&self, addr: *const u8) -> Option<i32> {
        let map = self.map.read();
        find(&map, addr as usize).map(|(_, e)| e.count.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

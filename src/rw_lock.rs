// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Single-word atomic read-write lock owning its data.
// - High bit (W_FLAG) marks exclusive/write lock.
// - Low bits count concurrent shared/read locks.
// Guards the routing table and the segment reference table.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::spin_lock::adaptive_yield;

const W_MASK: u32 = i32::MAX as u32; // 0x7FFF_FFFF, reader count mask
const W_FLAG: u32 = W_MASK + 1; // 0x8000_0000, writer flag

/// A spinning read-write lock around a value of type `T`.
///
/// Writers get exclusive access, multiple readers can hold the lock
/// concurrently. A writer that has set `W_FLAG` blocks new readers and then
/// waits for the current ones to drain.
pub struct RwLock<T> {
    state: AtomicU32,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialised by `state`.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub const fn new(value: T) -> Self {
        Self { state: AtomicU32::new(0), data: UnsafeCell::new(value) }
    }

    fn lock_exclusive(&self) {
        let mut k = 0u32;
        loop {
            let old = self.state.fetch_or(W_FLAG, Ordering::AcqRel);
            if old == 0 {
                return;
            }
            if old & W_FLAG == 0 {
                break; // readers present, no other writer
            }
            adaptive_yield(&mut k);
        }
        let mut k = 0u32;
        while self.state.load(Ordering::Acquire) & W_MASK != 0 {
            adaptive_yield(&mut k);
        }
    }

    fn lock_shared(&self) {
        let mut old = self.state.load(Ordering::Acquire);
        let mut k = 0u32;
        loop {
            if old & W_FLAG != 0 {
                adaptive_yield(&mut k);
                old = self.state.load(Ordering::Acquire);
            } else {
                match self.state.compare_exchange_weak(old, old + 1, Ordering::Acquire, Ordering::Relaxed) {
                    Ok(_) => return,
                    Err(cur) => old = cur,
                }
            }
        }
    }

    /// Acquire a shared (read) lock.
    pub fn read(&self) -> ReadGuard<'_, T> {
        self.lock_shared();
        ReadGuard { lock: self }
    }

    /// Acquire the exclusive (write) lock.
    pub fn write(&self) -> WriteGuard<'_, T> {
        self.lock_exclusive();
        WriteGuard { lock: self }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct ReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: shared lock held, no writer can exist.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

pub struct WriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: exclusive lock held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: exclusive lock held.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

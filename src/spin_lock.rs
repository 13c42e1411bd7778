// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Spin locks with adaptive backoff: pause → yield → sleep.
// `SpinLock` guards chunk-pool pages; `TicketLock` is `#[repr(C)]` and lives
// inside shared-memory page headers, so it must be valid when zero-filled.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// One step of contention backoff; `k` counts the failed attempts so far.
/// Spins bare, then with a pause hint, then yields, and finally sleeps 1ms
/// per step without advancing `k` further.
#[inline]
pub(crate) fn adaptive_yield(k: &mut u32) {
    match *k {
        0..=3 => {}
        4..=15 => std::hint::spin_loop(),
        16..=31 => std::thread::yield_now(),
        _ => return std::thread::sleep(Duration::from_millis(1)),
    }
    *k += 1;
}

/// Test-and-test-and-set lock over a single flag.
pub struct SpinLock {
    held: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self { held: AtomicBool::new(false) }
    }

    pub fn lock(&self) {
        let mut k = 0u32;
        while !self.try_lock() {
            while self.held.load(Ordering::Relaxed) {
                adaptive_yield(&mut k);
            }
        }
    }

    /// Take the lock if it is free right now.
    pub fn try_lock(&self) -> bool {
        self.held.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed).is_ok()
    }

    pub fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }

    /// Lock, unlocking again when the guard drops.
    pub fn guard(&self) -> SpinGuard<'_> {
        self.lock();
        SpinGuard { lock: self }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// FIFO ticket lock.
///
/// Two counters: `next` hands out tickets, `serving` names the holder.
/// The all-zero state is unlocked, so a freshly truncated shm page is usable.
#[repr(C)]
pub struct TicketLock {
    next: AtomicU32,
    serving: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<TicketLock>() == 8);

impl TicketLock {
    pub const fn new() -> Self {
        Self { next: AtomicU32::new(0), serving: AtomicU32::new(0) }
    }

    pub fn lock(&self) {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        let mut k = 0u32;
        while self.serving.load(Ordering::Acquire) != ticket {
            adaptive_yield(&mut k);
        }
    }

    pub fn unlock(&self) {
        self.serving.fetch_add(1, Ordering::Release);
    }

    pub fn guard(&self) -> TicketGuard<'_> {
        self.lock();
        TicketGuard { lock: self }
    }

    /// Reset to unlocked. Only valid while no other party can touch the lock.
    pub(crate) fn reset(&self) {
        self.next.store(0, Ordering::Relaxed);
        self.serving.store(0, Ordering::Release);
    }
}

impl Default for TicketLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TicketGuard<'a> {
    lock: &'a TicketLock,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

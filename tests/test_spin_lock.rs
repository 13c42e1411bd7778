// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// SpinLock and TicketLock: exclusion and fairness under contention.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sdtp::{SpinLock, TicketLock};

/// A counter that is only correct if every increment is serialised.
struct Unsync(UnsafeCell<u64>);
unsafe impl Sync for Unsync {}

impl Unsync {
    fn bump(&self) {
        // Safety: callers hold the lock under test.
        unsafe {
            let v = *self.0.get();
            thread::yield_now();
            *self.0.get() = v + 1;
        }
    }

    fn get(&self) -> u64 {
        unsafe { *self.0.get() }
    }
}

#[test]
fn spin_lock_and_guard() {
    let lock = SpinLock::new();
    lock.lock();
    assert!(!lock.try_lock());
    lock.unlock();
    {
        let _g = lock.guard();
        assert!(!lock.try_lock());
    }
    assert!(lock.try_lock());
    lock.unlock();
}

#[test]
fn spin_lock_serialises_writers() {
    let lock = Arc::new(SpinLock::new());
    let cell = Arc::new(Unsync(UnsafeCell::new(0)));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let cell = Arc::clone(&cell);
            thread::spawn(move || {
                for _ in 0..250 {
                    let _g = lock.guard();
                    cell.bump();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(cell.get(), 1000);
}

#[test]
fn spin_lock_never_admits_two() {
    let lock = Arc::new(SpinLock::new());
    let inside = Arc::new(AtomicU32::new(0));
    let broken = Arc::new(AtomicBool::new(false));
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let (lock, inside, broken) = (Arc::clone(&lock), Arc::clone(&inside), Arc::clone(&broken));
            thread::spawn(move || {
                for _ in 0..60 {
                    let _g = lock.guard();
                    if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                        broken.store(true, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_micros(20));
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert!(!broken.load(Ordering::SeqCst));
}

#[test]
fn ticket_lock_zeroed_is_unlocked() {
    // Page headers in shared memory start out zero-filled.
    let lock: TicketLock = unsafe { std::mem::zeroed() };
    lock.lock();
    lock.unlock();
    let _g = lock.guard();
}

#[test]
fn ticket_lock_serialises_writers() {
    let lock = Arc::new(TicketLock::new());
    let cell = Arc::new(Unsync(UnsafeCell::new(0)));
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let cell = Arc::clone(&cell);
            thread::spawn(move || {
                for _ in 0..200 {
                    lock.lock();
                    cell.bump();
                    lock.unlock();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(cell.get(), 1200);
}

#[test]
fn ticket_lock_serves_in_arrival_order() {
    let lock = Arc::new(TicketLock::new());
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let g = lock.guard();
    let mut handles = Vec::new();
    for id in 0..3 {
        let (lock, order) = (Arc::clone(&lock), Arc::clone(&order));
        handles.push(thread::spawn(move || {
            let _g = lock.guard();
            order.lock().unwrap().push(id);
        }));
        // Let this thread take its ticket before the next one starts.
        thread::sleep(Duration::from_millis(30));
    }
    drop(g);
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

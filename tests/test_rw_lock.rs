// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// RwLock: shared readers, exclusive writers, writer preference.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sdtp::RwLock;

#[test]
fn guards_give_access() {
    let lock = RwLock::new(vec![1, 2, 3]);
    assert_eq!(lock.read().len(), 3);
    lock.write().push(4);
    assert_eq!(*lock.read(), vec![1, 2, 3, 4]);
    assert_eq!(lock.into_inner(), vec![1, 2, 3, 4]);
}

#[test]
fn readers_overlap() {
    let lock = Arc::new(RwLock::new(0u32));
    let inside = Arc::new(AtomicI32::new(0));
    let peak = Arc::new(AtomicI32::new(0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let (lock, inside, peak) = (Arc::clone(&lock), Arc::clone(&inside), Arc::clone(&peak));
            thread::spawn(move || {
                for _ in 0..10 {
                    let _r = lock.read();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) > 1);
}

#[test]
fn writers_exclude_readers() {
    let lock = Arc::new(RwLock::new(BTreeMap::<i32, i32>::new()));
    let torn = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..2)
        .map(|w| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                for i in 0..200 {
                    let mut m = lock.write();
                    // Two keys always updated together.
                    m.insert(0, w * 1000 + i);
                    thread::yield_now();
                    m.insert(1, w * 1000 + i);
                }
            })
        })
        .collect();
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let (lock, torn) = (Arc::clone(&lock), Arc::clone(&torn));
            thread::spawn(move || {
                for _ in 0..300 {
                    let m = lock.read();
                    if m.get(&0) != m.get(&1) {
                        torn.store(true, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();
    for h in writers.into_iter().chain(readers) {
        h.join().unwrap();
    }
    assert!(!torn.load(Ordering::SeqCst));
    assert_eq!(lock.read().len(), 2);
}

#[test]
fn waiting_writer_is_not_starved() {
    let lock = Arc::new(RwLock::new(0u64));
    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let (lock, stop) = (Arc::clone(&lock), Arc::clone(&stop));
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let _r = lock.read();
                    thread::sleep(Duration::from_micros(200));
                }
            })
        })
        .collect();
    thread::sleep(Duration::from_millis(10));
    for _ in 0..20 {
        *lock.write() += 1;
    }
    stop.store(true, Ordering::Relaxed);
    for h in readers {
        h.join().unwrap();
    }
    assert_eq!(*lock.read(), 20);
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-memory segments and the cross-process element queue.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use sdtp::shm::{ShmHandle, ShmOpenMode, ShmQueue};
use sdtp::Error;

static SEQ: AtomicUsize = AtomicUsize::new(0);

/// A key path no other test (or concurrent test run) uses.
fn key(tag: &str) -> PathBuf {
    PathBuf::from(format!(
        "/tmp/sdtp-test/{tag}_{}_{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ))
}

#[test]
fn handle_ref_counts_and_unlinks_on_last_drop() {
    let path = key("seg");
    let a = ShmHandle::acquire_path(&path, 4096, ShmOpenMode::Create).unwrap();
    assert!(a.is_creator());
    assert_eq!(a.len(), 4096);
    assert!(ShmHandle::acquire_path(&path, 4096, ShmOpenMode::Create).is_err());

    let b = ShmHandle::open_path(&path).unwrap();
    assert!(!b.is_creator());
    assert_eq!(b.len(), 4096);

    a.view().write(100, b"shared").unwrap();
    let mut out = [0u8; 6];
    b.view().read(100, &mut out).unwrap();
    assert_eq!(&out, b"shared");

    drop(a);
    let c = ShmHandle::acquire_path(&path, 16, ShmOpenMode::CreateOrOpen).unwrap();
    assert!(!c.is_creator());
    assert_eq!(c.len(), 4096);
    drop(b);
    drop(c);
    assert!(ShmHandle::open_path(&path).is_err());
}

#[test]
fn view_bounds_are_checked() {
    let path = key("bounds");
    let h = ShmHandle::acquire_path(&path, 256, ShmOpenMode::Create).unwrap();
    let v = h.view();
    assert!(v.write(250, &[0u8; 6]).is_ok());
    assert!(matches!(v.write(251, &[0u8; 6]), Err(Error::OffsetOutOfBounds { .. })));
    assert!(v.sub(200, 100).is_err());
}

#[test]
fn queue_round_trip_between_handles() {
    let path = key("distq");
    let owner = ShmQueue::create(&path, 8, 64).unwrap();
    let peer = ShmQueue::attach(&path).unwrap();
    assert_eq!(peer.capacity(), 8);
    assert_eq!(peer.unit_size(), owner.unit_size());

    peer.enqueue(&[b"head|", b"body"]).unwrap();
    peer.enqueue(&[b"second"]).unwrap();
    assert_eq!(owner.len(), 2);

    assert_eq!(owner.dequeue(|b| b.to_vec()).unwrap(), b"head|body");
    assert_eq!(owner.dequeue(|b| b.to_vec()).unwrap(), b"second");
    assert!(owner.dequeue(|b| b.len()).is_none());
}

#[test]
fn second_create_joins_a_live_queue() {
    let path = key("rejoin");
    let first = ShmQueue::create(&path, 8, 64).unwrap();
    first.enqueue(&[b"kept"]).unwrap();

    let second = ShmQueue::create(&path, 8, 64).unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second.dequeue(|b| b.to_vec()).unwrap(), b"kept");
    assert!(first.is_empty());

    assert!(matches!(ShmQueue::create(&path, 8, 32), Err(Error::InvalidArgument(_))));
}

#[test]
fn queue_full_and_oversize() {
    let q = ShmQueue::private(4, 16).unwrap();
    for i in 0..4u8 {
        q.enqueue(&[&[i; 8]]).unwrap();
    }
    assert!(matches!(q.enqueue(&[b"x"]), Err(Error::QueueFull)));
    assert!(q.dequeue(|_| ()).is_some());
    q.enqueue(&[b"x"]).unwrap();

    let too_big = vec![0u8; q.unit_size() + 1];
    assert!(matches!(q.enqueue(&[&too_big]), Err(Error::InvalidArgument(_))));
}

#[test]
fn queue_attach_requires_initialised_segment() {
    let path = key("raw");
    let _raw = ShmHandle::acquire_path(&path, 4096, ShmOpenMode::Create).unwrap();
    assert!(ShmQueue::attach(&path).is_err());
    assert!(ShmQueue::attach(&key("missing")).is_err());
}

#[test]
fn queue_many_producers_one_consumer() {
    let path = key("mpsc");
    let consumer = ShmQueue::create(&path, 64, 32).unwrap();
    let producers: Vec<_> = (0..4u32)
        .map(|t| {
            let path = path.clone();
            thread::spawn(move || {
                let q = ShmQueue::attach(&path).unwrap();
                let mut i = 0u32;
                while i < 500 {
                    match q.enqueue(&[&t.to_le_bytes(), &i.to_le_bytes()]) {
                        Ok(()) => i += 1,
                        Err(Error::QueueFull) => thread::yield_now(),
                        Err(e) => panic!("{e}"),
                    }
                }
            })
        })
        .collect();

    let mut next = [0u32; 4];
    let mut got = 0;
    while got < 2000 {
        let Some((t, i)) = consumer.dequeue(|b| {
            let t = u32::from_le_bytes(b[0..4].try_into().unwrap());
            let i = u32::from_le_bytes(b[4..8].try_into().unwrap());
            (t as usize, i)
        }) else {
            thread::yield_now();
            continue;
        };
        // Per producer, elements arrive in order.
        assert_eq!(i, next[t]);
        next[t] += 1;
        got += 1;
    }
    for p in producers {
        p.join().unwrap();
    }
    assert_eq!(next, [500; 4]);
}

#[test]
fn unlink_path_removes_a_stale_key() {
    let path = key("stale");
    let h = ShmHandle::acquire_path(&path, 128, ShmOpenMode::Create).unwrap();
    assert!(h.is_creator());
    ShmHandle::unlink_path(&path);
    // Still mapped here, but the key is free for a new segment.
    h.view().write(0, b"old").unwrap();
    let fresh = ShmHandle::acquire_path(&path, 128, ShmOpenMode::Create).unwrap();
    assert!(fresh.is_creator());
    let mut out = [0u8; 3];
    fresh.view().read(0, &mut out).unwrap();
    assert_eq!(out, [0; 3]);
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Page-switching send pool in shared memory.
//
//   [ PoolHeader ][ PageHeader × PAGE_NUM ][ page 0 ][ page 1 ] ...
//
// Producers (any process) append encoded frames to a page in write mode
// under the page's ticket lock. The owning send thread periodically
// switches one page to read mode and stages its bytes for the socket; on the
// next switch every read-mode page goes back to write mode, empty.

use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::error::{Error, Result};
use crate::frame::{Header, HEADER_LEN, TYPE_MAX};
use crate::shm::{Region, SegView, ShmHandle, ShmOpenMode, ShmPod};
use crate::spin_lock::TicketLock;

/// Pages per pool: more pages, less lock contention, more memory.
pub const PAGE_NUM: usize = 4;

const MAGIC: u32 = 0x5344_5350; // "SDSP"

const MODE_WR: u32 = 0;
const MODE_RD: u32 = 1;

#[repr(C)]
struct PoolHeader {
    magic: AtomicU32,
    page_num: AtomicU32,
    page_size: AtomicU64,
    _pad: [u8; 48],
}

#[repr(C)]
struct PageHeader {
    lock: TicketLock,
    mode: AtomicU32,
    num: AtomicU32,
    begin: AtomicU64,
    size: AtomicU64,
    off: AtomicU64,
    /// Last switch, ms since the epoch.
    send_tm: AtomicU64,
    _pad: [u8; 16],
}

const _: () = assert!(std::mem::size_of::<PoolHeader>() == 64);
const _: () = assert!(std::mem::size_of::<PageHeader>() == 64);

unsafe impl ShmPod for PoolHeader {}
unsafe impl ShmPod for PageHeader {}

const PAGES_OFF: usize = std::mem::size_of::<PoolHeader>();
const DATA_OFF: usize = PAGES_OFF + PAGE_NUM * std::mem::size_of::<PageHeader>();

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// A page switched to read mode: `len` bytes of frames at `begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRef {
    pub idx: usize,
    pub begin: usize,
    pub len: usize,
    pub num: u32,
}

enum Backing {
    Shm(ShmHandle),
    Heap(Region),
}

pub struct PagePool {
    _backing: Backing,
    view: SegView,
    pages: NonNull<PageHeader>,
    page_size: usize,
}

// Safety: `pages` points into the mapping owned by `_backing`; page headers
// are atomics and change only under the page lock.
unsafe impl Send for PagePool {}
unsafe impl Sync for PagePool {}

impl PagePool {
    /// Bytes for pages of `max` × `size` bytes.
    pub fn total_bytes(max: usize, size: usize) -> Result<usize> {
        max.checked_mul(size)
            .and_then(|p| p.checked_mul(PAGE_NUM))
            .and_then(|d| d.checked_add(DATA_OFF))
            .ok_or_else(|| Error::invalid(format!("pool of {max} x {size} overflows")))
    }

    pub fn create(path: &Path, max: usize, size: usize) -> Result<Self> {
        let total = Self::total_bytes(max, size)?;
        let shm = ShmHandle::acquire_path(path, total, ShmOpenMode::CreateOrOpen)?;
        if shm.len() < total {
            return Err(Error::invalid(format!(
                "existing pool for {} holds {} bytes, need {total}",
                path.display(),
                shm.len()
            )));
        }
        let view = shm.view();
        if !shm.is_creator() {
            let hdr: &PoolHeader = view.get(0)?;
            if hdr.magic.load(Ordering::Acquire) == MAGIC {
                let live = hdr.page_size.load(Ordering::Relaxed) as usize;
                if live != max * size {
                    return Err(Error::invalid(format!(
                        "pool {} in use with {live}-byte pages, asked for {}",
                        path.display(),
                        max * size
                    )));
                }
                return Self::attach_view(Backing::Shm(shm), view, path);
            }
        }
        Self::init(Backing::Shm(shm), view, max * size)
    }

    /// Join a pool laid out by [`create`](Self::create).
    pub fn attach(path: &Path) -> Result<Self> {
        let shm = ShmHandle::open_path(path)?;
        let view = shm.view();
        Self::attach_view(Backing::Shm(shm), view, path)
    }

    fn attach_view(backing: Backing, view: SegView, path: &Path) -> Result<Self> {
        let hdr: &PoolHeader = view.get(0)?;
        if hdr.magic.load(Ordering::Acquire) != MAGIC {
            return Err(Error::invalid(format!("pool {} not initialised", path.display())));
        }
        let page_size = hdr.page_size.load(Ordering::Relaxed) as usize;
        if hdr.page_num.load(Ordering::Relaxed) as usize != PAGE_NUM {
            return Err(Error::invalid("pool page count mismatch"));
        }
        view.check(0, DATA_OFF + PAGE_NUM * page_size)?;
        let pages = Self::headers(&view)?;
        Ok(Self { _backing: backing, view, pages, page_size })
    }

    /// Same layout in private memory.
    pub fn private(max: usize, size: usize) -> Result<Self> {
        let region = Region::new(Self::total_bytes(max, size)?)?;
        let view = region.view();
        Self::init(Backing::Heap(region), view, max * size)
    }

    fn init(backing: Backing, view: SegView, page_size: usize) -> Result<Self> {
        if page_size < HEADER_LEN {
            return Err(Error::invalid(format!("page of {page_size} bytes cannot hold a frame")));
        }
        let hdr: &PoolHeader = view.get(0)?;
        hdr.magic.store(0, Ordering::Release);
        let now = now_ms();
        for idx in 0..PAGE_NUM {
            let page: &PageHeader = view.get(PAGES_OFF + idx * std::mem::size_of::<PageHeader>())?;
            page.lock.reset();
            page.mode.store(MODE_WR, Ordering::Relaxed);
            page.num.store(0, Ordering::Relaxed);
            page.begin.store((DATA_OFF + idx * page_size) as u64, Ordering::Relaxed);
            page.size.store(page_size as u64, Ordering::Relaxed);
            page.off.store(0, Ordering::Relaxed);
            page.send_tm.store(now, Ordering::Relaxed);
        }
        hdr.page_num.store(PAGE_NUM as u32, Ordering::Relaxed);
        hdr.page_size.store(page_size as u64, Ordering::Relaxed);
        hdr.magic.store(MAGIC, Ordering::Release);
        let pages = Self::headers(&view)?;
        Ok(Self { _backing: backing, view, pages, page_size })
    }

    fn headers(view: &SegView) -> Result<NonNull<PageHeader>> {
        Ok(NonNull::from(view.slice::<PageHeader>(PAGES_OFF, PAGE_NUM)?).cast())
    }

    /// `idx` is always below `PAGE_NUM`.
    fn page(&self, idx: usize) -> &PageHeader {
        debug_assert!(idx < PAGE_NUM);
        // Safety: `PAGE_NUM` headers were bounds-checked in `headers`.
        unsafe { &*self.pages.as_ptr().add(idx % PAGE_NUM) }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bytes waiting in write-mode pages.
    pub fn pending(&self) -> usize {
        (0..PAGE_NUM)
            .map(|i| self.page(i))
            .filter(|p| p.mode.load(Ordering::Relaxed) == MODE_WR)
            .map(|p| p.off.load(Ordering::Relaxed) as usize)
            .sum()
    }

    /// Append one user frame. `QueueFull` when no write-mode page has room.
    pub fn push(&self, ty: u16, node_id: i32, data: &[u8]) -> Result<()> {
        if ty >= TYPE_MAX {
            return Err(Error::TypeOutOfRange(ty));
        }
        let total = HEADER_LEN + data.len();
        if total > self.page_size {
            return Err(Error::invalid(format!("frame of {total} bytes exceeds page of {}", self.page_size)));
        }
        let head = Header::user(ty, node_id, data.len() as u32).encode();
        let start = rand::thread_rng().gen_range(0..PAGE_NUM);
        for i in 0..PAGE_NUM {
            let page = self.page((start + i) % PAGE_NUM);
            let _g = page.lock.guard();
            if page.mode.load(Ordering::Relaxed) != MODE_WR {
                continue;
            }
            let off = page.off.load(Ordering::Relaxed) as usize;
            if off + total > page.size.load(Ordering::Relaxed) as usize {
                continue;
            }
            let at = page.begin.load(Ordering::Relaxed) as usize + off;
            self.view.write(at, &head)?;
            self.view.write(at + HEADER_LEN, data)?;
            page.off.store((off + total) as u64, Ordering::Relaxed);
            page.num.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        Err(Error::QueueFull)
    }

    /// Recycle pages handed out earlier, then hand out one page worth
    /// sending: more than half full, or non-empty and untouched for at
    /// least `flush_age`. Oldest switch first.
    ///
    /// The caller must be done with the previously returned page.
    pub fn switch(&self, flush_age: Duration) -> Option<PageRef> {
        let now = now_ms();
        for idx in 0..PAGE_NUM {
            let page = self.page(idx);
            let _g = page.lock.guard();
            if page.mode.load(Ordering::Relaxed) == MODE_RD {
                page.off.store(0, Ordering::Relaxed);
                page.num.store(0, Ordering::Relaxed);
                page.mode.store(MODE_WR, Ordering::Relaxed);
                page.send_tm.store(now, Ordering::Relaxed);
            }
        }

        let mut order: [usize; PAGE_NUM] = std::array::from_fn(|i| i);
        order.sort_by_key(|&i| self.page(i).send_tm.load(Ordering::Relaxed));
        let age = flush_age.as_millis() as u64;
        for idx in order {
            let page = self.page(idx);
            let _g = page.lock.guard();
            let off = page.off.load(Ordering::Relaxed) as usize;
            let size = page.size.load(Ordering::Relaxed) as usize;
            let old = now.saturating_sub(page.send_tm.load(Ordering::Relaxed)) >= age;
            if off > size / 2 || (off > 0 && old) {
                page.mode.store(MODE_RD, Ordering::Relaxed);
                page.send_tm.store(now, Ordering::Relaxed);
                return Some(PageRef {
                    idx,
                    begin: page.begin.load(Ordering::Relaxed) as usize,
                    len: off,
                    num: page.num.load(Ordering::Relaxed),
                });
            }
        }
        None
    }

    /// Bytes of a page returned by [`switch`](Self::switch).
    pub fn page_bytes(&self, r: &PageRef) -> Result<&[u8]> {
        if r.idx >= PAGE_NUM || self.page(r.idx).mode.load(Ordering::Acquire) != MODE_RD {
            return Err(Error::invalid(format!("page {} is not switched out", r.idx)));
        }
        // Safety: a read-mode page is written by no one until the next switch.
        unsafe { self.view.bytes(r.begin, r.len) }
    }
}

impl std::fmt::Debug for PagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagePool").field("page_size", &self.page_size).field("pending", &self.pending()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode_frame;

    #[test]
    fn young_small_page_waits() {
        let pool = PagePool::private(16, 64).unwrap();
        pool.push(1, 9, b"hello").unwrap();
        assert_eq!(pool.switch(Duration::from_secs(60)), None);
        let r = pool.switch(Duration::ZERO).unwrap();
        assert_eq!(r.num, 1);
        let bytes = pool.page_bytes(&r).unwrap();
        let (h, body) = decode_frame(bytes).unwrap();
        assert_eq!((h.ty, h.node_id), (1, 9));
        assert_eq!(body, b"hello");
    }

    #[test]
    fn half_full_page_goes_at_once() {
        let pool = PagePool::private(4, 64).unwrap();
        let body = [0u8; 100];
        // One page is 256 bytes; two frames of 118 put it over half.
        loop {
            pool.push(2, 1, &body).unwrap();
            if let Some(r) = pool.switch(Duration::from_secs(60)) {
                assert!(r.len > pool.page_size() / 2);
                break;
            }
        }
    }

    #[test]
    fn read_pages_return_on_next_switch() {
        let pool = PagePool::private(1, 64).unwrap();
        let body = [7u8; 40];
        for _ in 0..PAGE_NUM {
            pool.push(1, 1, &body).unwrap();
        }
        assert!(matches!(pool.push(1, 1, &body), Err(Error::QueueFull)));
        let r = pool.switch(Duration::ZERO).unwrap();
        assert_eq!(r.len, HEADER_LEN + 40);
        assert!(matches!(pool.push(1, 1, &body), Err(Error::QueueFull)));
        pool.switch(Duration::from_secs(60));
        pool.push(1, 1, &body).unwrap();
    }

    #[test]
    fn oversized_or_bad_type_rejected() {
        let pool = PagePool::private(1, 32).unwrap();
        assert!(pool.push(1, 1, &[0u8; 32]).is_err());
        assert!(matches!(pool.push(TYPE_MAX, 1, b""), Err(Error::TypeOutOfRange(_))));
    }
}

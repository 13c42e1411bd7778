// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared memory: named segments, the bounds-checked segment view, and the
// offset-based ring / slot / queue structures laid out inside a segment.

use std::io;
use std::path::Path;

use crate::platform::{Disposition, Segment};
use crate::shm_name;

pub mod queue;
pub mod ring;
pub mod slot;
pub mod view;

pub use queue::ShmQueue;
pub use ring::ShmRing;
pub use slot::ShmSlot;
pub use view::{Region, SegView, ShmPod};

/// How [`ShmHandle::acquire_path`] treats an existing segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOpenMode {
    /// Fail if the key already names a segment.
    Create,
    /// Fail unless it does.
    Open,
    CreateOrOpen,
}

/// A segment keyed by a filesystem path and mapped into this process.
///
/// Every process mapping the segment shares one attach counter; the handle
/// that drops it to zero removes the segment.
pub struct ShmHandle {
    seg: Segment,
}

impl ShmHandle {
    /// Map `len` usable bytes of the segment keyed by `path`.
    pub fn acquire_path(path: &Path, len: usize, mode: ShmOpenMode) -> io::Result<Self> {
        let how = match mode {
            ShmOpenMode::Create => Disposition::Create,
            ShmOpenMode::Open => Disposition::Open,
            ShmOpenMode::CreateOrOpen => Disposition::CreateOrOpen,
        };
        Ok(Self { seg: Segment::acquire(&shm_name::key_name(path), len, how)? })
    }

    /// Attach to an existing segment; its length comes from the object.
    pub fn open_path(path: &Path) -> io::Result<Self> {
        Ok(Self { seg: Segment::open(&shm_name::key_name(path))? })
    }

    pub fn len(&self) -> usize {
        self.seg.user_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if this handle brought the segment into existence.
    pub fn is_creator(&self) -> bool {
        self.seg.created()
    }

    pub fn view(&self) -> SegView {
        // Safety: the mapping lives as long as `self`; callers keep the
        // handle alive next to any view derived from it.
        unsafe { SegView::new(self.seg.base(), self.seg.user_len()) }
    }

    /// Remove a stale segment left by a crashed process.
    pub fn unlink_path(path: &Path) {
        Segment::unlink_name(&shm_name::key_name(path));
    }
}

impl std::fmt::Debug for ShmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmHandle").field("os_name", &self.seg.os_name()).field("len", &self.len()).finish()
    }
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX shared memory (shm_open + mmap) and thread CPU affinity.
//
// A mapped segment is `user bytes | pad | AtomicI32 refs`; the trailer is
// shared by every process that maps the object, and the handle that brings
// it to zero unlinks the name.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI32, Ordering};

use crate::shm_name;

const REFS_LEN: usize = std::mem::size_of::<AtomicI32>();
const MODE: libc::mode_t = 0o666;

/// Offset of the refs trailer for a segment with `user` usable bytes.
fn trailer_at(user: usize) -> usize {
    user.next_multiple_of(std::mem::align_of::<AtomicI32>())
}

fn invalid_input(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

fn os_name(name: &str) -> io::Result<CString> {
    CString::new(shm_name::make_shm_name(name)).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn open_fd(name: &CString, flags: libc::c_int) -> io::Result<OwnedFd> {
    // Safety: `name` is NUL-terminated; a non-negative return is a fresh fd we own.
    let fd = unsafe { libc::shm_open(name.as_ptr(), flags, MODE as libc::c_uint) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// # Safety
/// `base` must map at least `trailer_at(user) + REFS_LEN` bytes, and the
/// returned reference must not outlive the mapping.
unsafe fn refs_of<'a>(base: NonNull<u8>, user: usize) -> &'a AtomicI32 {
    &*base.as_ptr().add(trailer_at(user)).cast::<AtomicI32>()
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Create,
    Open,
    CreateOrOpen,
}

pub struct Segment {
    base: NonNull<u8>,
    user: usize,
    mapped: usize,
    name: CString,
    creator: bool,
}

// Safety: the mapping is plain shared bytes; synchronisation is the job of
// the structures laid out inside it.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    pub fn acquire(name: &str, user: usize, how: Disposition) -> io::Result<Self> {
        if name.is_empty() {
            return Err(invalid_input("empty segment name"));
        }
        if user == 0 {
            return Err(invalid_input("zero-sized segment"));
        }
        let cname = os_name(name)?;
        let fresh = libc::O_RDWR | libc::O_CREAT | libc::O_EXCL;
        let (fd, created) = match how {
            Disposition::Create => (open_fd(&cname, fresh)?, true),
            Disposition::Open => (open_fd(&cname, libc::O_RDWR)?, false),
            Disposition::CreateOrOpen => match open_fd(&cname, fresh) {
                Ok(fd) => (fd, true),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => (open_fd(&cname, libc::O_RDWR)?, false),
                Err(e) => return Err(e),
            },
        };
        // umask may have narrowed the mode; peers in other accounts must map it.
        unsafe { libc::fchmod(fd.as_raw_fd(), MODE) };

        if !created {
            // The trailer sits where the creator sized it, not where we would.
            return Self::map_existing(fd, cname);
        }
        let mapped = trailer_at(user) + REFS_LEN;
        // Safety: plain syscall on an fd we own.
        check(unsafe { libc::ftruncate(fd.as_raw_fd(), mapped as libc::off_t) })?;
        Self::map(&fd, cname, user, mapped)
    }

    /// Open an existing segment, taking its size from the object.
    pub fn open(name: &str) -> io::Result<Self> {
        let cname = os_name(name)?;
        let fd = open_fd(&cname, libc::O_RDWR)?;
        Self::map_existing(fd, cname)
    }

    fn map_existing(fd: OwnedFd, name: CString) -> io::Result<Self> {
        // Safety: `st` is plain data filled by fstat.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        check(unsafe { libc::fstat(fd.as_raw_fd(), &mut st) })?;
        let mapped = st.st_size as usize;
        if mapped <= REFS_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "segment not sized yet"));
        }
        Self::map(&fd, name, mapped - REFS_LEN, mapped)
    }

    fn map(fd: &OwnedFd, name: CString, user: usize, mapped: usize) -> io::Result<Self> {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        // Safety: maps `mapped` bytes of a shared object we hold open; the
        // fd may be closed once the mapping exists.
        let raw = unsafe { libc::mmap(ptr::null_mut(), mapped, prot, libc::MAP_SHARED, fd.as_raw_fd(), 0) };
        if raw == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = NonNull::new(raw.cast::<u8>()).ok_or_else(io::Error::last_os_error)?;
        let before = unsafe { refs_of(base, user) }.fetch_add(1, Ordering::AcqRel);
        Ok(Self { base, user, mapped, name, creator: before == 0 })
    }

    fn refs(&self) -> &AtomicI32 {
        unsafe { refs_of(self.base, self.user) }
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn user_len(&self) -> usize {
        self.user
    }

    pub fn os_name(&self) -> &str {
        self.name.to_str().unwrap_or("")
    }

    /// True if no other handle had the segment mapped when this one attached.
    pub fn created(&self) -> bool {
        self.creator
    }

    /// Remove the name; existing mappings stay valid.
    fn unlink(&self) {
        unsafe { libc::shm_unlink(self.name.as_ptr()) };
    }

    pub fn unlink_name(name: &str) {
        if let Ok(c) = os_name(name) {
            unsafe { libc::shm_unlink(c.as_ptr()) };
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let last = self.refs().fetch_sub(1, Ordering::AcqRel) <= 1;
        // Safety: `base`/`mapped` describe the mapping created in `map`.
        unsafe { libc::munmap(self.base.as_ptr().cast(), self.mapped) };
        if last {
            self.unlink();
        }
    }
}

// ---------------------------------------------------------------------------
// CPU affinity
// ---------------------------------------------------------------------------

/// Pin the calling thread to `cpu`, wrapped to the online CPU count.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> bool {
    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if online < 1 {
        return false;
    }
    // Safety: cpu_set_t is plain data; CPU_SET stays in range after the modulo.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu % online as usize, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of_val(&set), &set) == 0
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpu: usize) -> bool {
    false
}

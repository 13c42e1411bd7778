// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Readiness multiplexing over poll(2). Each server thread rebuilds its set
// every iteration and waits once with a bounded timeout.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Interest = Interest { read: true, write: false };
    pub const WRITE: Interest = Interest { read: false, write: true };
    pub const BOTH: Interest = Interest { read: true, write: true };
}

#[derive(Default)]
pub struct Poller {
    fds: Vec<libc::pollfd>,
}

impl Poller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }

    /// Watch `fd`; returns the slot to query after [`wait`](Self::wait).
    pub fn add(&mut self, fd: RawFd, interest: Interest) -> usize {
        let mut events = 0;
        if interest.read {
            events |= libc::POLLIN;
        }
        if interest.write {
            events |= libc::POLLOUT;
        }
        self.fds.push(libc::pollfd { fd, events, revents: 0 });
        self.fds.len() - 1
    }

    /// Block until something is ready or `timeout` passes. Returns the
    /// number of ready descriptors; 0 on timeout or signal interruption.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        let ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let n = unsafe { libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, ms) };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(e);
        }
        Ok(n as usize)
    }

    /// Readable, or hung up / errored (a read will report which).
    pub fn readable(&self, slot: usize) -> bool {
        self.fds
            .get(slot)
            .is_some_and(|p| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
    }

    pub fn writable(&self, slot: usize) -> bool {
        self.fds.get(slot).is_some_and(|p| p.revents & (libc::POLLOUT | libc::POLLERR) != 0)
    }
}

/// Wait until `fd` is readable. `Ok(false)` on timeout.
pub fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut p = Poller::new();
    let slot = p.add(fd, Interest::READ);
    Ok(p.wait(timeout)? > 0 && p.readable(slot))
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Outbound buffering for one connection: a system lane (auth, keep-alive)
// and a bulk lane, each a message list feeding a `Snap`.
//
// Lane switching happens only when the active snap is empty, so a frame is
// never interleaved with another. When both lanes have data the system lane
// goes first.

use std::collections::VecDeque;
use std::io::{self, Write};

use crate::snap::Snap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Sys,
    Bulk,
}

struct LaneBuf {
    snap: Snap,
    list: VecDeque<Vec<u8>>,
}

impl LaneBuf {
    fn new(cap: usize) -> Self {
        Self { snap: Snap::new(cap), list: VecDeque::new() }
    }

    fn is_idle(&self) -> bool {
        self.snap.is_empty() && self.list.is_empty()
    }

    /// Move whole frames from the list into the snap while they fit.
    fn refill(&mut self) {
        while let Some(front) = self.list.front() {
            if front.len() > self.snap.capacity() {
                tracing::warn!(len = front.len(), cap = self.snap.capacity(), "outbound frame exceeds buffer, dropped");
                self.list.pop_front();
                continue;
            }
            if front.len() > self.snap.room() {
                break;
            }
            if let Some(f) = self.list.pop_front() {
                self.snap.push(&f);
            }
        }
    }
}

pub struct Outbox {
    sys: LaneBuf,
    bulk: LaneBuf,
    lane: Lane,
}

impl Outbox {
    /// `sys_cap` bytes for system frames, `bulk_cap` for everything else.
    pub fn new(sys_cap: usize, bulk_cap: usize) -> Self {
        Self { sys: LaneBuf::new(sys_cap), bulk: LaneBuf::new(bulk_cap), lane: Lane::Sys }
    }

    pub fn push_sys(&mut self, frame: Vec<u8>) {
        self.sys.list.push_back(frame);
    }

    pub fn push_bulk(&mut self, frame: Vec<u8>) {
        self.bulk.list.push_back(frame);
    }

    pub fn has_pending(&self) -> bool {
        !self.sys.is_idle() || !self.bulk.is_idle()
    }

    fn switch_lane(&mut self) {
        match self.lane {
            Lane::Sys if self.sys.is_idle() => self.lane = Lane::Bulk,
            Lane::Bulk if self.bulk.snap.is_empty() && !self.sys.is_idle() => self.lane = Lane::Sys,
            _ => {}
        }
    }

    /// Write as much as `w` accepts. Returns the bytes written; stops at
    /// `WouldBlock`, which is not reported as an error.
    pub fn flush<W: Write>(&mut self, w: &mut W) -> io::Result<usize> {
        let mut written = 0;
        loop {
            self.switch_lane();
            let buf = match self.lane {
                Lane::Sys => &mut self.sys,
                Lane::Bulk => &mut self.bulk,
            };
            if buf.snap.is_empty() {
                buf.refill();
                if buf.snap.is_empty() {
                    if self.has_pending() {
                        continue;
                    }
                    return Ok(written);
                }
            }
            match w.write(buf.snap.pending()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    buf.snap.consume(n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(written),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("lane", &self.lane)
            .field("sys_pending", &(self.sys.snap.pending_len(), self.sys.list.len()))
            .field("bulk_pending", &(self.bulk.snap.pending_len(), self.bulk.list.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts at most `quota` bytes per call, then blocks after `budget`.
    struct Trickle {
        out: Vec<u8>,
        quota: usize,
        budget: usize,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.quota).min(self.budget);
            self.out.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn sys_goes_first() {
        let mut o = Outbox::new(64, 64);
        o.push_bulk(vec![b'b'; 4]);
        o.push_sys(vec![b's'; 4]);
        let mut w = Trickle { out: Vec::new(), quota: 100, budget: 100 };
        assert_eq!(o.flush(&mut w).unwrap(), 8);
        assert_eq!(w.out, b"ssssbbbb");
        assert!(!o.has_pending());
    }

    #[test]
    fn bulk_in_flight_is_not_preempted() {
        let mut o = Outbox::new(64, 64);
        o.push_bulk(vec![b'b'; 6]);
        let mut w = Trickle { out: Vec::new(), quota: 4, budget: 4 };
        o.flush(&mut w).unwrap();
        assert_eq!(o.lane, Lane::Bulk);

        o.push_sys(vec![b's'; 2]);
        w.budget = 100;
        o.flush(&mut w).unwrap();
        assert_eq!(w.out, b"bbbbbbss");
    }
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-thread counters, written by their owning thread and read by anyone.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::cmd::{ProcStat, RecvStat};

/// Counters of one receive-server (or send-server) thread.
#[derive(Debug, Default)]
pub struct ServerCounters {
    pub connections: AtomicU32,
    pub recv_total: AtomicU64,
    pub drop_total: AtomicU64,
    pub err_total: AtomicU64,
}

impl ServerCounters {
    pub fn snapshot(&self) -> RecvStat {
        RecvStat {
            connections: self.connections.load(Ordering::Relaxed),
            recv_total: self.recv_total.load(Ordering::Relaxed),
            drop_total: self.drop_total.load(Ordering::Relaxed),
            err_total: self.err_total.load(Ordering::Relaxed),
        }
    }
}

/// Counters of one worker thread.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    pub proc_total: AtomicU64,
    pub drop_total: AtomicU64,
    pub err_total: AtomicU64,
}

impl WorkerCounters {
    pub fn snapshot(&self) -> ProcStat {
        ProcStat {
            proc_total: self.proc_total.load(Ordering::Relaxed),
            drop_total: self.drop_total.load(Ordering::Relaxed),
            err_total: self.err_total.load(Ordering::Relaxed),
        }
    }
}

/// All counters of a running pipeline.
#[derive(Debug)]
pub struct Stats {
    pub servers: Box<[ServerCounters]>,
    pub workers: Box<[WorkerCounters]>,
    /// Distribution thread of a receive service: `recv_total` counts entries
    /// taken from the distribution queue, `drop_total` those with no route.
    pub dist: ServerCounters,
}

impl Stats {
    pub fn new(servers: usize, workers: usize) -> Self {
        Self {
            servers: (0..servers).map(|_| ServerCounters::default()).collect(),
            workers: (0..workers).map(|_| WorkerCounters::default()).collect(),
            dist: ServerCounters::default(),
        }
    }

    /// Sum over every server.
    pub fn recv_total(&self) -> RecvStat {
        self.servers.iter().map(ServerCounters::snapshot).fold(RecvStat::default(), |a, s| RecvStat {
            connections: a.connections + s.connections,
            recv_total: a.recv_total + s.recv_total,
            drop_total: a.drop_total + s.drop_total,
            err_total: a.err_total + s.err_total,
        })
    }

    /// Sum over every worker.
    pub fn proc_total(&self) -> ProcStat {
        self.workers.iter().map(WorkerCounters::snapshot).fold(ProcStat::default(), |a, s| ProcStat {
            proc_total: a.proc_total + s.proc_total,
            drop_total: a.drop_total + s.drop_total,
            err_total: a.err_total + s.err_total,
        })
    }
}

pub(crate) fn bump(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn add(c: &AtomicU64, n: u64) {
    c.fetch_add(n, Ordering::Relaxed);
}

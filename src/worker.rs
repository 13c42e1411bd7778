// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Worker threads: drain receive queues on request and run the registered
// handler for every frame in each batch. Shared by both pipelines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::batch;
use crate::cmd::{Cmd, CmdSocket};
use crate::conf::{CpuConf, WORKER_HDL_QNUM};
use crate::error::Result;
use crate::mem::Queue;
use crate::poll::wait_readable;
use crate::reg::{Dispatch, Registry};
use crate::stats::{bump, Stats, WorkerCounters};

/// Spawn a named thread.
pub(crate) fn spawn<F>(name: String, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    Ok(std::thread::Builder::new().name(name).spawn(f)?)
}

pub(crate) struct Worker {
    pub idx: usize,
    pub cmd: CmdSocket,
    /// Every receive queue; this worker owns `idx * WORKER_HDL_QNUM ..`.
    pub queues: Arc<[Queue]>,
    pub reg: Arc<Registry>,
    pub stats: Arc<Stats>,
    pub stop: Arc<AtomicBool>,
    pub poll: Duration,
    pub cpu: CpuConf,
}

impl Worker {
    fn counters(&self) -> &WorkerCounters {
        &self.stats.workers[self.idx]
    }

    pub fn run(self) {
        self.cpu.apply(self.idx);
        tracing::debug!(idx = self.idx, "worker started");
        while !self.stop.load(Ordering::Acquire) {
            match wait_readable(std::os::unix::io::AsRawFd::as_raw_fd(&self.cmd), self.poll) {
                Ok(true) => self.handle_cmds(),
                Ok(false) => self.drain_own(),
                Err(e) => {
                    tracing::error!(idx = self.idx, error = %e, "worker wait failed");
                    break;
                }
            }
        }
        self.drain_own();
        tracing::debug!(idx = self.idx, "worker stopped");
    }

    fn handle_cmds(&self) {
        loop {
            let (src, cmd) = match self.cmd.recv() {
                Ok(Some(m)) => m,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(idx = self.idx, error = %e, "command receive failed");
                    return;
                }
            };
            match cmd {
                Cmd::ProcReq { rqidx, num, .. } => self.drain(rqidx as usize, num),
                Cmd::QueryProcStatReq => {
                    let rep = Cmd::QueryProcStatRep(self.counters().snapshot());
                    if let Err(e) = self.cmd.send_to(&src, &rep) {
                        tracing::warn!(dest = %src.display(), error = %e, "stat reply failed");
                    }
                }
                other => tracing::warn!(idx = self.idx, cmd = ?other, "unexpected command"),
            }
        }
    }

    fn drain_own(&self) {
        let first = self.idx * WORKER_HDL_QNUM;
        for rqidx in first..first + WORKER_HDL_QNUM {
            self.drain(rqidx, -1);
        }
    }

    /// Process up to `num` batches from queue `rqidx` (all if negative).
    fn drain(&self, rqidx: usize, num: i32) {
        let Some(queue) = self.queues.get(rqidx) else {
            tracing::warn!(rqidx, "process request for unknown queue");
            return;
        };
        let mut left = if num < 0 { usize::MAX } else { num as usize };
        while left > 0 {
            let Some(block) = queue.pop() else { break };
            left -= 1;
            let c = self.counters();
            let walked = batch::for_each_entry(&block, |e| match self.reg.dispatch(e.ty, e.node_id, e.body) {
                Dispatch::Handled => bump(&c.proc_total),
                Dispatch::Unregistered => bump(&c.drop_total),
                Dispatch::Failed => bump(&c.err_total),
            });
            if let Err(e) = walked {
                bump(&c.err_total);
                tracing::error!(rqidx, error = %e, "corrupt batch");
            }
        }
    }
}

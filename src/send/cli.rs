// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Producer side of a send service, usable from another process.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::pool::PagePool;
use crate::cmd::{Cmd, CmdClient, RecvStat};
use crate::conf::SendConf;
use crate::error::{Error, Result};

static NEXT_TAG: AtomicUsize = AtomicUsize::new(0);

/// Pushes between forced flushes of every send-server.
const FLUSH_EVERY: usize = 1000;

pub struct SendClient {
    conf: SendConf,
    pools: Box<[PagePool]>,
    cmd: CmdClient,
    next: AtomicUsize,
    pushed: AtomicUsize,
}

impl SendClient {
    /// Attach to the page pools of the service described by `conf`.
    pub fn attach(conf: &SendConf) -> Result<Self> {
        let pools = (0..conf.send_thd_num).map(|i| PagePool::attach(&conf.pool_path(i))).collect::<Result<Vec<_>>>()?;
        let tag = format!("{}_{}", std::process::id(), NEXT_TAG.fetch_add(1, Ordering::Relaxed));
        let cmd = CmdClient::bind(&conf.cli_path(&tag), conf.timeouts.poll * 3)?;
        Ok(Self { conf: conf.clone(), pools: pools.into(), cmd, next: AtomicUsize::new(0), pushed: AtomicUsize::new(0) })
    }

    /// Queue `data` as a user frame of type `ty`, stamped with this node's id.
    ///
    /// Pools are tried round-robin; `QueueFull` only when every pool is full.
    pub fn send(&self, ty: u16, data: &[u8]) -> Result<()> {
        let n = self.pools.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let mut last = Error::QueueFull;
        for i in 0..n {
            let idx = (start + i) % n;
            match self.pools[idx].push(ty, self.conf.auth.node_id, data) {
                Ok(()) => {
                    if self.pushed.fetch_add(1, Ordering::Relaxed) % FLUSH_EVERY == FLUSH_EVERY - 1 {
                        self.flush()?;
                    }
                    return Ok(());
                }
                Err(Error::QueueFull) => {
                    self.wake(idx, &Cmd::SendAll);
                    last = Error::QueueFull;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Ask every send-server to push out whatever its pool holds.
    pub fn flush(&self) -> Result<()> {
        for idx in 0..self.pools.len() {
            self.wake(idx, &Cmd::SendAll);
        }
        Ok(())
    }

    /// One entry per send-server; `connections` is 1 while linked.
    pub fn query_stats(&self) -> Result<Vec<RecvStat>> {
        let paths = (0..self.conf.send_thd_num).map(|i| self.conf.ssvr_path(i));
        self.cmd
            .collect(paths, &Cmd::QueryRecvStatReq)?
            .into_iter()
            .map(|c| match c {
                Cmd::QueryRecvStatRep(s) => Ok(s),
                other => Err(Error::Cmd(format!("unexpected reply {other:?}"))),
            })
            .collect()
    }

    /// Bytes waiting in write-mode pages across all pools.
    pub fn pending(&self) -> usize {
        self.pools.iter().map(PagePool::pending).sum()
    }

    fn wake(&self, idx: usize, cmd: &Cmd) {
        if let Err(e) = self.cmd.notify(&self.conf.ssvr_path(idx), cmd) {
            tracing::debug!(ssvr = idx, error = %e, "send server wake-up not delivered");
        }
    }
}

impl std::fmt::Debug for SendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendClient").field("name", &self.conf.name).field("pools", &self.pools.len()).finish()
    }
}

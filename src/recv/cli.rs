// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Client side of a receive service, usable from another process: forward
// frames to connected nodes and query configuration and counters.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::batch::entry_header;
use crate::cmd::{Cmd, CmdClient, ConfInfo, ProcStat, RecvStat};
use crate::conf::RecvConf;
use crate::error::{Error, Result};
use crate::frame::TYPE_MAX;
use crate::shm::ShmQueue;

static NEXT_TAG: AtomicUsize = AtomicUsize::new(0);

pub struct RecvClient {
    conf: RecvConf,
    distq: ShmQueue,
    cmd: CmdClient,
}

impl RecvClient {
    /// Attach to the distribution queue of the service described by `conf`.
    pub fn attach(conf: &RecvConf) -> Result<Self> {
        let distq = ShmQueue::attach(&conf.distq_path())?;
        let tag = format!("{}_{}", std::process::id(), NEXT_TAG.fetch_add(1, Ordering::Relaxed));
        let cmd = CmdClient::bind(&conf.cli_path(&tag), conf.timeouts.poll * 3)?;
        Ok(Self { conf: conf.clone(), distq, cmd })
    }

    /// Queue `data` for delivery to node `dest` as a user frame of type `ty`.
    pub fn send(&self, ty: u16, dest: i32, data: &[u8]) -> Result<()> {
        if ty >= TYPE_MAX {
            return Err(Error::TypeOutOfRange(ty));
        }
        self.distq.enqueue(&[&entry_header(ty, dest, data.len()), data])
    }

    pub fn query_conf(&self) -> Result<ConfInfo> {
        match self.cmd.request(&self.conf.listen_path(), &Cmd::QueryConfReq)? {
            Cmd::QueryConfRep(c) => Ok(c),
            other => Err(Error::Cmd(format!("unexpected reply {other:?}"))),
        }
    }

    /// One entry per receive-server.
    pub fn query_recv_stats(&self) -> Result<Vec<RecvStat>> {
        let paths = (0..self.conf.recv_thd_num).map(|i| self.conf.rsvr_path(i));
        self.cmd
            .collect(paths, &Cmd::QueryRecvStatReq)?
            .into_iter()
            .map(|c| match c {
                Cmd::QueryRecvStatRep(s) => Ok(s),
                other => Err(Error::Cmd(format!("unexpected reply {other:?}"))),
            })
            .collect()
    }

    /// Counters of the distribution thread; `drop_total` counts forwarded
    /// frames whose destination had no route.
    pub fn query_dist_stat(&self) -> Result<RecvStat> {
        match self.cmd.request(&self.conf.dist_path(), &Cmd::QueryRecvStatReq)? {
            Cmd::QueryRecvStatRep(s) => Ok(s),
            other => Err(Error::Cmd(format!("unexpected reply {other:?}"))),
        }
    }

    /// One entry per worker.
    pub fn query_proc_stats(&self) -> Result<Vec<ProcStat>> {
        let paths = (0..self.conf.work_thd_num).map(|i| self.conf.worker_path(i));
        self.cmd
            .collect(paths, &Cmd::QueryProcStatReq)?
            .into_iter()
            .map(|c| match c {
                Cmd::QueryProcStatRep(s) => Ok(s),
                other => Err(Error::Cmd(format!("unexpected reply {other:?}"))),
            })
            .collect()
    }
}

impl std::fmt::Debug for RecvClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvClient").field("name", &self.conf.name).field("distq", &self.distq).finish()
    }
}

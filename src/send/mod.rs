// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Send pipeline.
//
//   SendClient ──push──▶ pool[i] ──switch──▶ ssvr[i] ──TCP──▶ peer
//                                              │
//                         user frames from peer ▼
//                                  recvq[k] ──PROC_REQ──▶ worker[k/2]
//
// One send-server per outbound connection. Each reconnects on failure and
// re-runs link auth.

mod cli;
mod pool;
mod ssvr;

pub use cli::SendClient;
pub use pool::{PagePool, PageRef, PAGE_NUM};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::cmd::CmdSocket;
use crate::conf::SendConf;
use crate::error::Result;
use crate::mem::Queue;
use crate::reg::{Handler, Registry};
use crate::stats::Stats;
use crate::worker::{spawn, Worker};

pub(crate) struct SendCtx {
    pub conf: SendConf,
    /// Receive queues for frames the peer sends back.
    pub recvq: Arc<[Queue]>,
    pub stats: Arc<Stats>,
    pub stop: Arc<AtomicBool>,
}

impl SendCtx {
    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// A send service being configured.
pub struct Sender {
    conf: SendConf,
    reg: Registry,
}

impl Sender {
    pub fn new(conf: SendConf) -> Result<Self> {
        conf.validate()?;
        Ok(Self { conf, reg: Registry::new() })
    }

    /// Install the handler for user frames of type `ty` sent back by the peer.
    pub fn register<F>(&mut self, ty: u16, f: F) -> Result<()>
    where
        F: Fn(u16, i32, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        let h: Handler = Arc::new(f);
        self.reg.register(ty, h)
    }

    pub fn launch(self) -> Result<SendHandle> {
        let conf = self.conf;
        let recvq = (0..conf.rqnum())
            .map(|_| Queue::new(conf.recvq.max, conf.recvq.size))
            .collect::<Result<Vec<_>>>()?;
        std::fs::create_dir_all(conf.dir.join(&conf.name))?;
        let pools = (0..conf.send_thd_num)
            .map(|i| PagePool::create(&conf.pool_path(i), conf.sendq.max, conf.sendq.size))
            .collect::<Result<Vec<_>>>()?;
        let ssvr_cmds =
            (0..conf.send_thd_num).map(|i| CmdSocket::bind(&conf.ssvr_path(i))).collect::<Result<Vec<_>>>()?;
        let work_cmds =
            (0..conf.work_thd_num).map(|i| CmdSocket::bind(&conf.worker_path(i))).collect::<Result<Vec<_>>>()?;

        let stats = Arc::new(Stats::new(conf.send_thd_num, conf.work_thd_num));
        let stop = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(SendCtx {
            conf,
            recvq: Arc::from(recvq),
            stats: Arc::clone(&stats),
            stop: Arc::clone(&stop),
        });
        let reg = Arc::new(self.reg);

        let mut handle = SendHandle { ctx: Arc::clone(&ctx), threads: Vec::new() };
        for (idx, cmd) in work_cmds.into_iter().enumerate() {
            let w = Worker {
                idx,
                cmd,
                queues: Arc::clone(&ctx.recvq),
                reg: Arc::clone(&reg),
                stats: Arc::clone(&stats),
                stop: Arc::clone(&stop),
                poll: ctx.conf.timeouts.poll,
                cpu: ctx.conf.cpu,
            };
            handle.threads.push(spawn(format!("sdtp-swrk-{idx}"), move || w.run())?);
        }
        for (idx, (pool, cmd)) in pools.into_iter().zip(ssvr_cmds).enumerate() {
            let s = ssvr::Ssvr::new(idx, Arc::clone(&ctx), pool, cmd);
            handle.threads.push(spawn(format!("sdtp-ssvr-{idx}"), move || s.run())?);
        }
        tracing::info!(name = %ctx.conf.name, peer = %format!("{}:{}", ctx.conf.ip, ctx.conf.port), "send service started");
        Ok(handle)
    }
}

/// A running send service. Dropping it stops the service.
pub struct SendHandle {
    ctx: Arc<SendCtx>,
    threads: Vec<JoinHandle<()>>,
}

impl SendHandle {
    pub fn conf(&self) -> &SendConf {
        &self.ctx.conf
    }

    /// Send-server counters in `servers`, send-side worker counters in
    /// `workers`.
    pub fn stats(&self) -> &Arc<Stats> {
        &self.ctx.stats
    }

    pub fn client(&self) -> Result<SendClient> {
        SendClient::attach(&self.ctx.conf)
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.ctx.stop.store(true, Ordering::Release);
        for t in self.threads.drain(..) {
            let name = t.thread().name().map(str::to_owned);
            if t.join().is_err() {
                tracing::error!(thread = ?name, "thread panicked");
            }
        }
        tracing::info!(name = %self.ctx.conf.name, "send service stopped");
    }
}

impl Drop for SendHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendHandle").field("name", &self.ctx.conf.name).field("threads", &self.threads.len()).finish()
    }
}

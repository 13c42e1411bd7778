// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Receive pipeline.
//
//   listener ──ADD_SCK──▶ rsvr[i] ──batch──▶ recvq[k] ──PROC_REQ──▶ worker[k/2]
//                            ▲
//   RecvClient ─▶ distq ─▶ dist ─▶ sendq[i]   (frames forwarded to a node)
//
// Every thread owns a command socket under `{dir}/{name}/usck/`, waits in
// one bounded poll per iteration, and exits once the stop flag is set.

mod cli;
mod dist;
mod listener;
mod rsvr;

pub use cli::RecvClient;

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::cmd::{CmdSocket, ConfInfo};
use crate::conf::RecvConf;
use crate::error::Result;
use crate::mem::Queue;
use crate::reg::{Handler, Registry};
use crate::route::NodeToSvrMap;
use crate::shm::ShmQueue;
use crate::stats::Stats;
use crate::worker::{spawn, Worker};

/// State shared by every receive-side thread.
pub(crate) struct RecvCtx {
    pub conf: RecvConf,
    pub local_addr: SocketAddr,
    pub route: Arc<NodeToSvrMap>,
    /// `rqnum` receive queues, rsvr → worker.
    pub recvq: Arc<[Queue]>,
    /// One forward queue per rsvr, dist → rsvr.
    pub sendq: Box<[Queue]>,
    pub stats: Arc<Stats>,
    pub stop: Arc<AtomicBool>,
}

impl RecvCtx {
    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn conf_info(&self) -> ConfInfo {
        let c = &self.conf;
        ConfInfo {
            name: c.name.clone(),
            port: self.local_addr.port(),
            recv_thd_num: c.recv_thd_num as u32,
            work_thd_num: c.work_thd_num as u32,
            rqnum: c.rqnum() as u32,
            qmax: c.recvq.max as u32,
            qsize: c.recvq.size as u32,
        }
    }
}

/// A receive service being configured.
pub struct Receiver {
    conf: RecvConf,
    reg: Registry,
}

impl Receiver {
    pub fn new(conf: RecvConf) -> Result<Self> {
        conf.validate()?;
        Ok(Self { conf, reg: Registry::new() })
    }

    /// Install the handler for user message type `ty`.
    pub fn register<F>(&mut self, ty: u16, f: F) -> Result<()>
    where
        F: Fn(u16, i32, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        let h: Handler = Arc::new(f);
        self.reg.register(ty, h)
    }

    /// Allocate queues, bind every socket and start the threads. Any
    /// failure here aborts startup; nothing is left running.
    pub fn launch(self) -> Result<RecvHandle> {
        let conf = self.conf;
        let recvq = (0..conf.rqnum())
            .map(|_| Queue::new(conf.recvq.max, conf.recvq.size))
            .collect::<Result<Vec<_>>>()?;
        let sendq = (0..conf.recv_thd_num)
            .map(|_| Queue::new(conf.sendq.max, conf.sendq.size))
            .collect::<Result<Vec<_>>>()?;
        std::fs::create_dir_all(conf.dir.join(&conf.name))?;
        let distq = ShmQueue::create(&conf.distq_path(), conf.distq.max, conf.distq.size)?;

        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, conf.port)))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let lsn_cmd = CmdSocket::bind(&conf.listen_path())?;
        let rsvr_cmds =
            (0..conf.recv_thd_num).map(|i| CmdSocket::bind(&conf.rsvr_path(i))).collect::<Result<Vec<_>>>()?;
        let work_cmds =
            (0..conf.work_thd_num).map(|i| CmdSocket::bind(&conf.worker_path(i))).collect::<Result<Vec<_>>>()?;
        let dist_cmd = CmdSocket::bind(&conf.dist_path())?;

        let stats = Arc::new(Stats::new(conf.recv_thd_num, conf.work_thd_num));
        let stop = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(RecvCtx {
            conf,
            local_addr,
            route: Arc::new(NodeToSvrMap::new()),
            recvq: Arc::from(recvq),
            sendq: sendq.into_boxed_slice(),
            stats: Arc::clone(&stats),
            stop: Arc::clone(&stop),
        });
        let reg = Arc::new(self.reg);

        let mut handle = RecvHandle { ctx: Arc::clone(&ctx), local_addr, threads: Vec::new() };
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
            handle.threads.push(spawn(format!("sdtp-work-{idx}"), move || w.run())?);
        }
        for (idx, cmd) in rsvr_cmds.into_iter().enumerate() {
            let r = rsvr::Rsvr::new(idx, Arc::clone(&ctx), cmd);
            handle.threads.push(spawn(format!("sdtp-rsvr-{idx}"), move || r.run())?);
        }
        let c = Arc::clone(&ctx);
        handle.threads.push(spawn("sdtp-dist".into(), move || dist::run(c, distq, dist_cmd))?);
        let c = Arc::clone(&ctx);
        handle.threads.push(spawn("sdtp-listen".into(), move || listener::run(c, listener, lsn_cmd))?);

        tracing::info!(name = %ctx.conf.name, addr = %local_addr, "receive service started");
        Ok(handle)
    }
}

/// A running receive service. Dropping it stops the service.
pub struct RecvHandle {
    ctx: Arc<RecvCtx>,
    local_addr: SocketAddr,
    threads: Vec<JoinHandle<()>>,
}

impl RecvHandle {
    /// Bound listen address (the real port when configured with 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn conf(&self) -> &RecvConf {
        &self.ctx.conf
    }

    pub fn route_map(&self) -> &Arc<NodeToSvrMap> {
        &self.ctx.route
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.ctx.stats
    }

    /// A client that forwards frames through this service.
    pub fn cli(&self) -> Result<RecvClient> {
        RecvClient::attach(&self.ctx.conf)
    }

    /// Signal every thread and wait for them.
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
        tracing::info!(name = %self.ctx.conf.name, "receive service stopped");
    }
}

impl Drop for RecvHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RecvHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvHandle")
            .field("name", &self.ctx.conf.name)
            .field("local_addr", &self.local_addr)
            .field("threads", &self.threads.len())
            .finish()
    }
}

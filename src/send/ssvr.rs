// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Send-server thread: one outbound connection, its page pool, and the
// auth / keep-alive state machine.
//
// Output order on the socket: the system lane (auth, keep-alive) first;
// pool pages only after link auth succeeded. A switched-out page is staged
// whole on the bulk lane, so the pool gets it back at the next switch and a
// keep-alive never lands inside it.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use super::pool::PagePool;
use super::SendCtx;
use crate::batch::BatchWriter;
use crate::cmd::{Cmd, CmdSocket};
use crate::conf::WORKER_HDL_QNUM;
use crate::frame::{self, AuthReq, AuthResp, Header, SysType};
use crate::outbox::Outbox;
use crate::poll::{Interest, Poller};
use crate::snap::Snap;
use crate::stats::{bump, ServerCounters};

const SYS_SNAP_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keepalive {
    Idle,
    Sent(Instant),
}

struct Link {
    stream: TcpStream,
    rdtm: Instant,
    wrtm: Instant,
    recv: Snap,
    out: Outbox,
    authed: bool,
    kpalive: Keepalive,
    /// Receive queue for every inbound frame on this link.
    rqid: usize,
}

enum Verdict {
    Keep,
    Close(&'static str),
}

pub(super) struct Ssvr {
    idx: usize,
    ctx: Arc<SendCtx>,
    pool: PagePool,
    cmd: CmdSocket,
    link: Option<Link>,
    poller: Poller,
}

impl Ssvr {
    pub fn new(idx: usize, ctx: Arc<SendCtx>, pool: PagePool, cmd: CmdSocket) -> Self {
        Self { idx, ctx, pool, cmd, link: None, poller: Poller::new() }
    }

    fn counters(&self) -> &ServerCounters {
        &self.ctx.stats.servers[self.idx]
    }

    pub fn run(mut self) {
        self.ctx.conf.cpu.apply(self.ctx.conf.work_thd_num + self.idx);
        tracing::debug!(idx = self.idx, "send server started");
        while !self.ctx.stopping() {
            if self.link.is_none() && !self.connect() {
                self.backoff();
                continue;
            }
            self.poller.clear();
            let cmd_slot = self.poller.add(self.cmd.as_raw_fd(), Interest::READ);
            let sck_slot = self.link.as_ref().map(|l| {
                let interest = if l.out.has_pending() { Interest::BOTH } else { Interest::READ };
                self.poller.add(l.stream.as_raw_fd(), interest)
            });
            let ready = match self.poller.wait(self.ctx.conf.timeouts.poll) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(idx = self.idx, error = %e, "send server wait failed");
                    break;
                }
            };

            let mut flush_age = self.ctx.conf.timeouts.page_flush;
            if ready > 0 && self.poller.readable(cmd_slot) {
                if let Some(age) = self.handle_cmds() {
                    flush_age = age;
                }
            }
            if let Some(slot) = sck_slot {
                if self.poller.readable(slot) {
                    if let Verdict::Close(why) = self.read_link() {
                        self.drop_link(why);
                        continue;
                    }
                }
            }
            if let Verdict::Close(why) = self.keepalive() {
                self.drop_link(why);
                continue;
            }
            if let Verdict::Close(why) = self.send_data(flush_age) {
                self.drop_link(why);
            }
        }
        self.close("shutdown");
        tracing::debug!(idx = self.idx, "send server stopped");
    }

    // -----------------------------------------------------------------------
    // Connection management
    // -----------------------------------------------------------------------

    fn connect(&mut self) -> bool {
        let conf = &self.ctx.conf;
        let addr = match (conf.ip.as_str(), conf.port).to_socket_addrs().map(|mut a| a.next()) {
            Ok(Some(a)) => a,
            Ok(None) | Err(_) => {
                tracing::error!(idx = self.idx, ip = %conf.ip, port = conf.port, "peer address does not resolve");
                return false;
            }
        };
        let stream = match TcpStream::connect_timeout(&addr, conf.timeouts.reconnect) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(idx = self.idx, %addr, error = %e, "connect failed");
                return false;
            }
        };
        if let Err(e) = stream.set_nonblocking(true) {
            tracing::error!(idx = self.idx, error = %e, "set_nonblocking failed");
            return false;
        }
        let _ = stream.set_nodelay(true);

        let now = Instant::now();
        let mut out = Outbox::new(SYS_SNAP_SIZE, conf.send_buff_size);
        let req = AuthReq { node_id: conf.auth.node_id, user: conf.auth.user.clone(), passwd: conf.auth.passwd.clone() };
        out.push_sys(frame::auth_req(&req));
        self.link = Some(Link {
            stream,
            rdtm: now,
            wrtm: now,
            recv: Snap::new(conf.recv_buff_size),
            out,
            authed: false,
            kpalive: Keepalive::Idle,
            rqid: rand::thread_rng().gen_range(0..self.ctx.recvq.len()),
        });
        self.counters().connections.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::info!(idx = self.idx, %addr, "connected");
        true
    }

    /// Sleep the reconnect interval, waking early on stop.
    fn backoff(&self) {
        let deadline = Instant::now() + self.ctx.conf.timeouts.reconnect;
        while !self.ctx.stopping() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }
    }

    fn drop_link(&mut self, why: &str) {
        self.close(why);
        self.backoff();
    }

    /// Drop the connection and everything queued on it.
    fn close(&mut self, why: &str) {
        let Some(link) = self.link.take() else { return };
        self.counters().connections.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        if link.out.has_pending() {
            tracing::warn!(idx = self.idx, out = ?link.out, "unsent output discarded");
        }
        tracing::info!(idx = self.idx, fd = link.stream.as_raw_fd(), reason = why, "connection closed");
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Returns the flush age requested by the commands read, if any.
    fn handle_cmds(&mut self) -> Option<Duration> {
        let mut age = None;
        loop {
            let (src, cmd) = match self.cmd.recv() {
                Ok(Some(m)) => m,
                Ok(None) => return age,
                Err(e) => {
                    tracing::error!(idx = self.idx, error = %e, "command receive failed");
                    return age;
                }
            };
            match cmd {
                Cmd::Send => {
                    age.get_or_insert(self.ctx.conf.timeouts.page_flush);
                }
                Cmd::SendAll => age = Some(Duration::ZERO),
                Cmd::QueryRecvStatReq => {
                    let rep = Cmd::QueryRecvStatRep(self.counters().snapshot());
                    if let Err(e) = self.cmd.send_to(&src, &rep) {
                        tracing::warn!(dest = %src.display(), error = %e, "stat reply failed");
                    }
                }
                other => tracing::warn!(idx = self.idx, cmd = ?other, "send server ignored command"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    fn read_link(&mut self) -> Verdict {
        loop {
            let Some(link) = self.link.as_mut() else { return Verdict::Keep };
            match link.stream.read(link.recv.spare_mut()) {
                Ok(0) => return Verdict::Close("peer closed"),
                Ok(n) => {
                    link.recv.fill(n);
                    link.rdtm = Instant::now();
                    if let Verdict::Close(why) = self.parse() {
                        return Verdict::Close(why);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Verdict::Keep,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(idx = self.idx, error = %e, "read failed");
                    return Verdict::Close("read error");
                }
            }
        }
    }

    fn parse(&mut self) -> Verdict {
        let Ssvr { idx, ctx, cmd, link, .. } = self;
        let (idx, ctx, cmd): (usize, &SendCtx, &CmdSocket) = (*idx, &**ctx, &*cmd);
        let Some(Link { recv, authed, kpalive, rqid, .. }) = link.as_mut() else { return Verdict::Keep };
        let rqid = *rqid;
        let counters = &ctx.stats.servers[idx];
        let mut verdict = Verdict::Keep;

        let parsed = recv.drain_frames(|head, body| {
            if head.is_sys() {
                match SysType::from_u16(head.ty) {
                    Some(SysType::KeepaliveResp) => {
                        tracing::trace!(idx, "keepalive answered");
                        *kpalive = Keepalive::Idle;
                    }
                    Some(SysType::LinkAuthResp) => match AuthResp::decode(body) {
                        Ok(r) if r.is_success => {
                            *authed = true;
                            tracing::info!(idx, node_id = r.node_id, "link auth succeeded");
                        }
                        Ok(r) => {
                            tracing::error!(idx, node_id = r.node_id, "link auth rejected");
                            verdict = Verdict::Close("auth rejected");
                        }
                        Err(e) => {
                            tracing::warn!(idx, error = %e, "malformed auth response");
                            verdict = Verdict::Close("malformed auth response");
                        }
                    },
                    other => tracing::warn!(idx, ty = head.ty, kind = ?other, "unexpected system frame"),
                }
                return;
            }
            bump(&counters.recv_total);
            if !enqueue_inbound(ctx, idx, cmd, rqid, head, body) {
                bump(&counters.drop_total);
            }
        });
        if let Err(e) = parsed {
            bump(&counters.err_total);
            tracing::warn!(idx, error = %e, "framing error");
            return Verdict::Close("framing error");
        }
        verdict
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    fn keepalive(&mut self) -> Verdict {
        let interval = self.ctx.conf.timeouts.keepalive;
        let node_id = self.ctx.conf.auth.node_id;
        let Some(link) = self.link.as_mut() else { return Verdict::Keep };
        let now = Instant::now();
        match link.kpalive {
            Keepalive::Sent(at) if now.duration_since(at) >= interval => Verdict::Close("keepalive timeout"),
            Keepalive::Sent(_) => Verdict::Keep,
            Keepalive::Idle => {
                let last = link.rdtm.max(link.wrtm);
                if now.duration_since(last) >= interval {
                    tracing::debug!(idx = self.idx, "keepalive sent");
                    link.out.push_sys(frame::keepalive_req(node_id));
                    link.kpalive = Keepalive::Sent(now);
                }
                Verdict::Keep
            }
        }
    }

    fn send_data(&mut self, flush_age: Duration) -> Verdict {
        let Some(link) = self.link.as_mut() else { return Verdict::Keep };
        loop {
            if link.out.has_pending() {
                match link.out.flush(&mut link.stream) {
                    Ok(n) if n > 0 => link.wrtm = Instant::now(),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(idx = self.idx, error = %e, "write failed");
                        return Verdict::Close("write error");
                    }
                }
                if link.out.has_pending() {
                    return Verdict::Keep;
                }
            }

            if !link.authed {
                return Verdict::Keep;
            }
            let page = match self.pool.switch(flush_age) {
                Some(page) if page.len > 0 => page,
                _ => return Verdict::Keep,
            };
            match self.pool.page_bytes(&page) {
                Ok(bytes) => {
                    tracing::trace!(idx = self.idx, page = page.idx, frames = page.num, len = page.len, "page staged");
                    link.out.push_bulk(bytes.to_vec());
                }
                Err(e) => tracing::error!(idx = self.idx, error = %e, "page lost"),
            }
        }
    }
}

/// Queue one user frame from the peer as a single-entry batch.
fn enqueue_inbound(ctx: &SendCtx, idx: usize, cmd: &CmdSocket, rqid: usize, head: &Header, body: &[u8]) -> bool {
    let queue = &ctx.recvq[rqid];
    let Some(block) = queue.alloc(queue.unit_size()) else {
        tracing::warn!(idx, rqid, "receive queue full");
        return false;
    };
    let mut writer = BatchWriter::new(block);
    if !writer.push(head.ty, head.node_id, body) {
        tracing::warn!(idx, ty = head.ty, len = body.len(), "frame exceeds queue unit, dropped");
        return false;
    }
    if let Err(e) = queue.push(writer.finish()) {
        tracing::error!(idx, rqid, error = %e, "batch push failed");
        return false;
    }
    let req = Cmd::ProcReq { ori_svr_idx: idx as u32, rqidx: rqid as u32, num: 1 };
    if let Err(e) = cmd.send_to(&ctx.conf.worker_path(rqid / WORKER_HDL_QNUM), &req) {
        tracing::warn!(idx, rqid, error = %e, "process request not delivered");
    }
    true
}

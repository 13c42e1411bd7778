// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Receive-server thread.
//
// Owns a set of connections handed over by the listener. Each iteration:
// deliver forwarded frames, poll (command socket + every connection), read
// and reassemble, answer system frames in place, batch user frames into a
// receive queue, write pending output, close idle connections, and flush a
// batch that has waited too long.

use std::io::{self, Read};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use slab::Slab;

use super::RecvCtx;
use crate::batch::{self, BatchWriter, BATCH_HDR};
use crate::cmd::{Cmd, CmdSocket};
use crate::conf::WORKER_HDL_QNUM;
use crate::frame::{self, AuthReq, AuthResp, Header, SysType};
use crate::mem::Queue;
use crate::outbox::Outbox;
use crate::poll::{Interest, Poller};
use crate::snap::Snap;
use crate::stats::{add, bump, ServerCounters};

/// System replies are small; their lane never needs much room.
const SYS_SNAP_SIZE: usize = 4096;

struct Conn {
    stream: TcpStream,
    serial: u64,
    ip: String,
    /// Set once link auth succeeds.
    node_id: Option<i32>,
    /// Receive queue for every batch from this connection, so its frames
    /// reach the handlers in arrival order.
    rqid: usize,
    rdtm: Instant,
    wrtm: Instant,
    recv: Snap,
    out: Outbox,
}

/// The batch being filled and the queue it will be pushed to.
struct Pending {
    rqid: usize,
    writer: BatchWriter,
}

pub(super) struct Rsvr {
    idx: usize,
    ctx: Arc<RecvCtx>,
    cmd: CmdSocket,
    /// Only the listener may hand over sockets.
    listen_path: PathBuf,
    conns: Slab<Conn>,
    pending: Option<Pending>,
    poller: Poller,
}

enum Verdict {
    Keep,
    Close(&'static str),
}

impl Rsvr {
    pub fn new(idx: usize, ctx: Arc<RecvCtx>, cmd: CmdSocket) -> Self {
        let listen_path = ctx.conf.listen_path();
        Self { idx, ctx, cmd, listen_path, conns: Slab::new(), pending: None, poller: Poller::new() }
    }

    fn counters(&self) -> &ServerCounters {
        &self.ctx.stats.servers[self.idx]
    }

    pub fn run(mut self) {
        self.ctx.conf.cpu.apply(self.ctx.conf.work_thd_num + self.idx);
        tracing::debug!(idx = self.idx, "receive server started");
        let mut slots: Vec<(usize, usize)> = Vec::new();
        while !self.ctx.stopping() {
            self.deliver_forwarded();

            self.poller.clear();
            slots.clear();
            let cmd_slot = self.poller.add(self.cmd.as_raw_fd(), Interest::READ);
            for (key, c) in self.conns.iter() {
                let interest = if c.out.has_pending() { Interest::BOTH } else { Interest::READ };
                slots.push((key, self.poller.add(c.stream.as_raw_fd(), interest)));
            }
            let ready = match self.poller.wait(self.ctx.conf.timeouts.poll) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(idx = self.idx, error = %e, "receive server wait failed");
                    break;
                }
            };

            if ready > 0 {
                if self.poller.readable(cmd_slot) {
                    self.handle_cmds();
                }
                for &(key, slot) in &slots {
                    if self.poller.readable(slot) {
                        if let Verdict::Close(why) = self.read_conn(key) {
                            self.close(key, why);
                            continue;
                        }
                    }
                    if self.poller.writable(slot) || self.conns.get(key).is_some_and(|c| c.out.has_pending()) {
                        if let Verdict::Close(why) = self.write_conn(key) {
                            self.close(key, why);
                        }
                    }
                }
            }

            self.sweep_idle();
            if self.pending.as_ref().is_some_and(|p| p.writer.age() >= self.ctx.conf.timeouts.poll) {
                self.flush_batch();
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.flush_batch();
        // Sockets handed over after the last poll would otherwise leak.
        while let Ok(Some((src, c))) = self.cmd.recv() {
            match c {
                // Safety: the listener gave up ownership of `fd`.
                Cmd::AddSck { fd, .. } if src == self.listen_path => drop(unsafe { TcpStream::from_raw_fd(fd) }),
                _ => {}
            }
        }
        let keys: Vec<usize> = self.conns.iter().map(|(k, _)| k).collect();
        for key in keys {
            self.close(key, "shutdown");
        }
        tracing::debug!(idx = self.idx, "receive server stopped");
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn handle_cmds(&mut self) {
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
                Cmd::AddSck { fd, serial, ip } if src == self.listen_path => self.add_conn(fd, serial, ip),
                Cmd::AddSck { fd, .. } => {
                    tracing::warn!(idx = self.idx, fd, from = %src.display(), "socket hand-off from a stranger ignored");
                }
                Cmd::Send | Cmd::SendAll => self.deliver_forwarded(),
                Cmd::QueryRecvStatReq => {
                    let rep = Cmd::QueryRecvStatRep(self.counters().snapshot());
                    if let Err(e) = self.cmd.send_to(&src, &rep) {
                        tracing::warn!(dest = %src.display(), error = %e, "stat reply failed");
                    }
                }
                other => tracing::warn!(idx = self.idx, cmd = ?other, "receive server ignored command"),
            }
        }
    }

    fn add_conn(&mut self, fd: i32, serial: u64, ip: String) {
        // Safety: the listener gave up ownership of `fd` with this command.
        let stream = unsafe { TcpStream::from_raw_fd(fd) };
        if let Err(e) = stream.set_nonblocking(true) {
            tracing::error!(fd, error = %e, "set_nonblocking failed; dropping connection");
            return;
        }
        let _ = stream.set_nodelay(true);
        let conf = &self.ctx.conf;
        let now = Instant::now();
        self.conns.insert(Conn {
            stream,
            serial,
            ip,
            node_id: None,
            rqid: rand::thread_rng().gen_range(0..self.ctx.recvq.len()),
            rdtm: now,
            wrtm: now,
            recv: Snap::new(conf.recv_buff_size),
            out: Outbox::new(SYS_SNAP_SIZE, conf.send_buff_size),
        });
        self.counters().connections.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::info!(idx = self.idx, fd, serial, "connection added");
    }

    fn close(&mut self, key: usize, why: &str) {
        let Some(c) = self.conns.try_remove(key) else { return };
        if let Some(node_id) = c.node_id {
            self.ctx.route.remove(node_id, self.idx);
        }
        self.counters().connections.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        tracing::info!(
            idx = self.idx,
            fd = c.stream.as_raw_fd(),
            serial = c.serial,
            ip = %c.ip,
            node_id = ?c.node_id,
            reason = why,
            "connection closed"
        );
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    fn read_conn(&mut self, key: usize) -> Verdict {
        loop {
            let Some(c) = self.conns.get_mut(key) else { return Verdict::Keep };
            if c.recv.room() == 0 {
                // drain_frames compacts; a full buffer here means no progress.
                return Verdict::Close("receive buffer full");
            }
            match c.stream.read(c.recv.spare_mut()) {
                Ok(0) => return Verdict::Close("peer closed"),
                Ok(n) => {
                    c.recv.fill(n);
                    c.rdtm = Instant::now();
                    if let Verdict::Close(why) = self.parse(key) {
                        return Verdict::Close(why);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Verdict::Keep,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(idx = self.idx, key, error = %e, "read failed");
                    return Verdict::Close("read error");
                }
            }
        }
    }

    /// Hand every complete frame in the connection's buffer onward.
    fn parse(&mut self, key: usize) -> Verdict {
        let Rsvr { idx, ctx, cmd, conns, pending, .. } = self;
        let (idx, ctx, cmd): (usize, &RecvCtx, &CmdSocket) = (*idx, &**ctx, &*cmd);
        let Some(Conn { recv, out, node_id, rqid, .. }) = conns.get_mut(key) else { return Verdict::Keep };
        let rqid = *rqid;
        let counters = &ctx.stats.servers[idx];
        let mut verdict = Verdict::Keep;

        let parsed = recv.drain_frames(|head, body| {
            if head.is_sys() {
                if let Verdict::Close(why) = sys_frame(ctx, idx, head, body, node_id, out) {
                    verdict = Verdict::Close(why);
                }
                return;
            }
            bump(&counters.recv_total);
            if *node_id != Some(head.node_id) {
                bump(&counters.drop_total);
                tracing::warn!(idx, ty = head.ty, node_id = head.node_id, conn_node = ?node_id, "frame from unauthenticated node dropped");
                return;
            }
            if !batch_frame(ctx, idx, cmd, pending, rqid, head, body) {
                bump(&counters.drop_total);
            }
        });
        if let Err(e) = parsed {
            bump(&counters.err_total);
            tracing::warn!(idx, key, error = %e, "framing error");
            return Verdict::Close("framing error");
        }
        verdict
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    fn write_conn(&mut self, key: usize) -> Verdict {
        let Some(c) = self.conns.get_mut(key) else { return Verdict::Keep };
        match c.out.flush(&mut c.stream) {
            Ok(0) => Verdict::Keep,
            Ok(_) => {
                c.wrtm = Instant::now();
                Verdict::Keep
            }
            Err(e) => {
                tracing::warn!(idx = self.idx, key, error = %e, "write failed");
                Verdict::Close("write error")
            }
        }
    }

    /// Move frames from this server's forward queue onto the first
    /// connection authenticated as their destination.
    fn deliver_forwarded(&mut self) {
        let queue = &self.ctx.sendq[self.idx];
        while let Some(block) = queue.pop() {
            let entry = match batch::read_entry(&block) {
                Ok((e, _)) => e,
                Err(e) => {
                    tracing::error!(idx = self.idx, error = %e, "corrupt forward entry");
                    continue;
                }
            };
            let Some((_, c)) = self.conns.iter_mut().find(|(_, c)| c.node_id == Some(entry.node_id)) else {
                bump(&self.ctx.stats.servers[self.idx].drop_total);
                tracing::error!(idx = self.idx, dest = entry.node_id, "no connection for forward destination");
                continue;
            };
            c.out.push_bulk(frame::encode_frame(Header::user(entry.ty, entry.node_id, 0), entry.body));
        }
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    fn sweep_idle(&mut self) {
        let idle = self.ctx.conf.timeouts.idle;
        let now = Instant::now();
        let stale: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, c)| now.duration_since(c.rdtm) >= idle && now.duration_since(c.wrtm) >= idle)
            .map(|(k, _)| k)
            .collect();
        for key in stale {
            self.close(key, "idle timeout");
        }
    }

    fn flush_batch(&mut self) {
        flush(&self.ctx, self.idx, &self.cmd, &mut self.pending);
    }
}

/// Answer one system frame.
fn sys_frame(
    ctx: &RecvCtx,
    idx: usize,
    head: &Header,
    body: &[u8],
    node_id: &mut Option<i32>,
    out: &mut Outbox,
) -> Verdict {
    match SysType::from_u16(head.ty) {
        Some(SysType::KeepaliveReq) => {
            tracing::trace!(idx, node_id = head.node_id, "keepalive");
            out.push_sys(frame::keepalive_resp(ctx.conf.auth.node_id));
            Verdict::Keep
        }
        Some(SysType::LinkAuthReq) => {
            let req = match AuthReq::decode(body) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(idx, error = %e, "malformed auth request");
                    return Verdict::Close("malformed auth request");
                }
            };
            let auth = &ctx.conf.auth;
            let ok = req.user == auth.user && req.passwd == auth.passwd;
            if ok {
                if let Some(old) = node_id.replace(req.node_id) {
                    ctx.route.remove(old, idx);
                }
                ctx.route.add(req.node_id, idx);
                tracing::info!(idx, node_id = req.node_id, "link auth succeeded");
            } else {
                // A failed re-auth withdraws whatever the link was routed as.
                if let Some(old) = node_id.take() {
                    ctx.route.remove(old, idx);
                }
                tracing::warn!(idx, node_id = req.node_id, user = %req.user, "link auth rejected");
            }
            out.push_sys(frame::auth_resp(AuthResp { node_id: req.node_id, is_success: ok }));
            Verdict::Keep
        }
        other => {
            tracing::warn!(idx, ty = head.ty, kind = ?other, "unexpected system frame");
            Verdict::Keep
        }
    }
}

/// Copy one user frame into the current batch. `false` if it was dropped.
fn batch_frame(
    ctx: &RecvCtx,
    idx: usize,
    cmd: &CmdSocket,
    pending: &mut Option<Pending>,
    rqid: usize,
    head: &Header,
    body: &[u8],
) -> bool {
    let (ty, node_id) = (head.ty, head.node_id);
    let unit = ctx.conf.recvq.size;
    if BATCH_HDR + batch::entry_size(body.len()) > unit {
        tracing::warn!(idx, ty, len = body.len(), unit, "frame exceeds queue unit, dropped");
        return false;
    }
    if pending.as_ref().is_some_and(|p| p.rqid != rqid || !p.writer.fits(body.len())) {
        flush(ctx, idx, cmd, pending);
    }
    if pending.is_none() {
        let queue = &ctx.recvq[rqid];
        let Some(block) = queue.alloc(queue.unit_size()) else {
            tracing::warn!(idx, rqid, "receive queue full");
            notify_all(ctx, cmd);
            return false;
        };
        *pending = Some(Pending { rqid, writer: BatchWriter::new(block) });
    }
    pending.as_mut().is_some_and(|p| p.writer.push(ty, node_id, body))
}

/// Push the current batch and wake the worker owning its queue.
fn flush(ctx: &RecvCtx, idx: usize, cmd: &CmdSocket, pending: &mut Option<Pending>) {
    let Some(Pending { rqid, writer }) = pending.take() else { return };
    if writer.is_empty() {
        return;
    }
    if let Err(e) = push_batch(&ctx.recvq[rqid], writer, &ctx.stats.servers[idx].drop_total) {
        tracing::error!(idx, rqid, error = %e, "batch push failed");
        return;
    }
    let req = Cmd::ProcReq { ori_svr_idx: idx as u32, rqidx: rqid as u32, num: -1 };
    let worker = rqid / WORKER_HDL_QNUM;
    if let Err(e) = cmd.send_to(&ctx.conf.worker_path(worker), &req) {
        tracing::warn!(idx, worker, error = %e, "process request not delivered");
    }
}

/// Push a finished batch. On failure every frame in it counts as dropped.
fn push_batch(queue: &Queue, writer: BatchWriter, drops: &AtomicU64) -> crate::Result<()> {
    let frames = writer.len() as u64;
    queue.push(writer.finish()).inspect_err(|_| add(drops, frames))
}

/// Ask every worker to drain everything it owns.
fn notify_all(ctx: &RecvCtx, cmd: &CmdSocket) {
    for (rqid, _) in ctx.recvq.iter().enumerate() {
        let req = Cmd::ProcReq { ori_svr_idx: 0, rqidx: rqid as u32, num: -1 };
        let _ = cmd.send_to(&ctx.conf.worker_path(rqid / WORKER_HDL_QNUM), &req);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::Error;

    #[test]
    fn failed_push_drops_every_frame_in_the_batch() {
        let home = Queue::new(4, 256).unwrap();
        let other = Queue::new(4, 256).unwrap();
        let mut writer = BatchWriter::new(home.alloc(256).unwrap());
        for i in 0..3u8 {
            assert!(writer.push(1, 7, &[i; 4]));
        }
        let drops = AtomicU64::new(0);
        assert!(matches!(push_batch(&other, writer, &drops), Err(Error::ForeignPointer)));
        assert_eq!(drops.load(Ordering::Relaxed), 3);

        let mut writer = BatchWriter::new(home.alloc(256).unwrap());
        writer.push(1, 7, b"ok");
        push_batch(&home, writer, &drops).unwrap();
        assert_eq!(drops.load(Ordering::Relaxed), 3);
    }
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Listener thread: accept TCP connections and hand each socket to a
// receive-server, round robin. Also answers configuration queries.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::sync::Arc;

use super::RecvCtx;
use crate::cmd::{Cmd, CmdSocket};
use crate::poll::{Interest, Poller};

pub(super) fn run(ctx: Arc<RecvCtx>, listener: TcpListener, cmd: CmdSocket) {
    let mut serial: u64 = 0;
    let mut poller = Poller::new();
    while !ctx.stopping() {
        poller.clear();
        let lsn_slot = poller.add(listener.as_raw_fd(), Interest::READ);
        let cmd_slot = poller.add(cmd.as_raw_fd(), Interest::READ);
        match poller.wait(ctx.conf.timeouts.poll) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "listener wait failed");
                break;
            }
        }
        if poller.readable(lsn_slot) {
            accept_all(&ctx, &listener, &cmd, &mut serial);
        }
        if poller.readable(cmd_slot) {
            handle_cmds(&ctx, &cmd);
        }
    }
    tracing::debug!("listener stopped");
}

fn accept_all(ctx: &RecvCtx, listener: &TcpListener, cmd: &CmdSocket, serial: &mut u64) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
                return;
            }
        };
        *serial += 1;
        let idx = (*serial % ctx.conf.recv_thd_num as u64) as usize;
        let ip = peer.ip().to_string();
        let fd = stream.into_raw_fd();
        let add = Cmd::AddSck { fd, serial: *serial, ip: ip.clone() };
        match cmd.send_to(&ctx.conf.rsvr_path(idx), &add) {
            Ok(()) => tracing::debug!(fd, serial = *serial, %ip, rsvr = idx, "connection accepted"),
            Err(e) => {
                tracing::error!(fd, rsvr = idx, error = %e, "socket handoff failed");
                // Safety: the fd came from `into_raw_fd` above and was not handed off.
                drop(unsafe { TcpStream::from_raw_fd(fd) });
            }
        }
    }
}

fn handle_cmds(ctx: &RecvCtx, cmd: &CmdSocket) {
    loop {
        let (src, c) = match cmd.recv() {
            Ok(Some(m)) => m,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "command receive failed");
                return;
            }
        };
        match c {
            Cmd::QueryConfReq => {
                if let Err(e) = cmd.send_to(&src, &Cmd::QueryConfRep(ctx.conf_info())) {
                    tracing::warn!(dest = %src.display(), error = %e, "conf reply failed");
                }
            }
            other => tracing::warn!(cmd = ?other, "listener ignored command"),
        }
    }
}

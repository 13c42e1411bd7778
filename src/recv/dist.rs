// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Distribution thread: move forward entries from the shared-memory
// distribution queue to the forward queue of a receive-server carrying the
// destination node.

use std::sync::Arc;

use super::RecvCtx;
use crate::batch;
use crate::cmd::{Cmd, CmdSocket};
use crate::shm::ShmQueue;
use crate::stats::bump;

pub(super) fn run(ctx: Arc<RecvCtx>, distq: ShmQueue, cmd: CmdSocket) {
    tracing::debug!(capacity = distq.capacity(), "distribution started");
    while !ctx.stopping() {
        match distq.dequeue(|bytes| forward(&ctx, &cmd, bytes)) {
            Some(_) => {}
            None => {
                handle_cmds(&ctx, &cmd);
                std::thread::sleep(ctx.conf.timeouts.dist_poll);
            }
        }
    }
    tracing::debug!("distribution stopped");
}

fn handle_cmds(ctx: &RecvCtx, cmd: &CmdSocket) {
    loop {
        let (src, c) = match cmd.recv() {
            Ok(Some(m)) => m,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "distribution command receive failed");
                return;
            }
        };
        match c {
            Cmd::QueryRecvStatReq => {
                if let Err(e) = cmd.send_to(&src, &Cmd::QueryRecvStatRep(ctx.stats.dist.snapshot())) {
                    tracing::warn!(dest = %src.display(), error = %e, "stat reply failed");
                }
            }
            other => tracing::warn!(cmd = ?other, "distribution ignored command"),
        }
    }
}

fn forward(ctx: &RecvCtx, cmd: &CmdSocket, bytes: &[u8]) {
    let counters = &ctx.stats.dist;
    bump(&counters.recv_total);
    let entry = match batch::read_entry(bytes) {
        Ok((e, _)) => e,
        Err(e) => {
            bump(&counters.err_total);
            tracing::error!(error = %e, "corrupt distribution entry");
            return;
        }
    };
    let Some(idx) = ctx.route.pick_random(entry.node_id) else {
        bump(&counters.drop_total);
        tracing::error!(dest = entry.node_id, ty = entry.ty, "no receive server for destination");
        return;
    };
    let queue = &ctx.sendq[idx];
    let was_empty = queue.is_empty();
    let Some(mut block) = queue.alloc(bytes.len()) else {
        bump(&ctx.stats.servers[idx].drop_total);
        tracing::error!(rsvr = idx, len = bytes.len(), unit = queue.unit_size(), "forward queue alloc failed");
        return;
    };
    block.copy_from_slice(bytes);
    if let Err(e) = queue.push(block) {
        bump(&ctx.stats.servers[idx].drop_total);
        tracing::error!(rsvr = idx, error = %e, "forward queue push failed");
        return;
    }
    if was_empty {
        if let Err(e) = cmd.send_to(&ctx.conf.rsvr_path(idx), &Cmd::Send) {
            tracing::warn!(rsvr = idx, error = %e, "forward wake-up not delivered");
        }
    }
}

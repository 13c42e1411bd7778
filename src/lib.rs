// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-data transport: framed TCP messaging between nodes, with
// shared-memory hand-off queues, type-indexed worker dispatch, link auth
// and keep-alive.
//
// A receive service accepts connections, reassembles frames, batches user
// frames into per-worker queues and forwards frames from local producers to
// connected nodes. A send service keeps one outbound connection per
// send-server and drains page pools filled by producers in any process.

pub mod error;
pub use error::{Error, FrameError, Result};

pub mod conf;
pub use conf::{
    AuthConf, ConfigSource, CpuConf, JsonSource, MapSource, QueueConf, RecvConf, SendConf, Timeouts,
};

pub mod frame;
pub use frame::{AuthReq, AuthResp, Flag, Header, SysType, HEADER_LEN, TYPE_MAX};

pub mod batch;
pub mod cmd;
pub use cmd::{Cmd, CmdClient, CmdSocket, ConfInfo, ProcStat, RecvStat};

pub mod outbox;
pub mod poll;
pub mod reg;
pub use reg::{Dispatch, Handler, Registry};

pub mod route;
pub use route::{NodeToSvrMap, SvrRef};

pub mod snap;
pub use snap::Snap;

pub mod stats;
pub use stats::Stats;

pub mod mem;
pub mod shm;
pub mod shm_name;

pub mod spin_lock;
pub use spin_lock::{SpinLock, TicketLock};

pub mod rw_lock;
pub use rw_lock::RwLock;

mod platform;
mod worker;

pub mod recv;
pub use recv::{RecvClient, RecvHandle, Receiver};

pub mod send;
pub use send::{SendClient, SendHandle, Sender};

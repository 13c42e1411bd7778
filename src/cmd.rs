// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Control commands exchanged between threads over UNIX datagram sockets.
//
// Wire layout (native byte order, one datagram per command):
//
//   off  size  field
//   0    4     cmd_type
//   4    256   source path, NUL-padded
//   260  128   arguments, layout per cmd_type

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::frame::{get_cstr, put_cstr};

pub const PATH_LEN: usize = 256;
pub const ARGS_LEN: usize = 128;
pub const CMD_LEN: usize = 4 + PATH_LEN + ARGS_LEN;

/// Fixed width of names and IP strings inside arguments.
pub const NAME_LEN: usize = 64;

mod code {
    pub const ADD_SCK: u32 = 1;
    pub const PROC_REQ: u32 = 2;
    pub const SEND: u32 = 3;
    pub const SEND_ALL: u32 = 4;
    pub const QUERY_CONF_REQ: u32 = 5;
    pub const QUERY_CONF_REP: u32 = 6;
    pub const QUERY_RECV_STAT_REQ: u32 = 7;
    pub const QUERY_RECV_STAT_REP: u32 = 8;
    pub const QUERY_PROC_STAT_REQ: u32 = 9;
    pub const QUERY_PROC_STAT_REP: u32 = 10;
}

/// Configuration summary returned by `QueryConfReq`.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize)]
pub struct ConfInfo {
    pub name: String,
    pub port: u16,
    pub recv_thd_num: u32,
    pub work_thd_num: u32,
    pub rqnum: u32,
    pub qmax: u32,
    pub qsize: u32,
}

/// Per receive-server counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct RecvStat {
    pub connections: u32,
    pub recv_total: u64,
    pub drop_total: u64,
    pub err_total: u64,
}

/// Per worker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct ProcStat {
    pub proc_total: u64,
    pub drop_total: u64,
    pub err_total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cmd {
    /// Listener → receive-server: take ownership of an accepted socket.
    AddSck { fd: RawFd, serial: u64, ip: String },
    /// Receive-server → worker: drain queue `rqidx`. `num < 0` means all.
    ProcReq { ori_svr_idx: u32, rqidx: u32, num: i32 },
    /// Wake a send-server if its socket is writable.
    Send,
    /// Wake a send-server and flush everything pending.
    SendAll,
    QueryConfReq,
    QueryConfRep(ConfInfo),
    QueryRecvStatReq,
    QueryRecvStatRep(RecvStat),
    QueryProcStatReq,
    QueryProcStatRep(ProcStat),
}

struct Writer<'a> {
    buf: &'a mut [u8],
    at: usize,
}

impl Writer<'_> {
    fn bytes(&mut self, b: &[u8]) {
        self.buf[self.at..self.at + b.len()].copy_from_slice(b);
        self.at += b.len();
    }
    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_ne_bytes());
    }
    fn i32(&mut self, v: i32) {
        self.bytes(&v.to_ne_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_ne_bytes());
    }
    fn str(&mut self, s: &str) {
        put_cstr(&mut self.buf[self.at..self.at + NAME_LEN], s);
        self.at += NAME_LEN;
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.at..self.at + N]);
        self.at += N;
        out
    }
    fn u32(&mut self) -> u32 {
        u32::from_ne_bytes(self.take())
    }
    fn i32(&mut self) -> i32 {
        i32::from_ne_bytes(self.take())
    }
    fn u64(&mut self) -> u64 {
        u64::from_ne_bytes(self.take())
    }
    fn str(&mut self) -> String {
        let s = get_cstr(&self.buf[self.at..self.at + NAME_LEN]);
        self.at += NAME_LEN;
        s
    }
}

impl Cmd {
    fn code(&self) -> u32 {
        match self {
            Cmd::AddSck { .. } => code::ADD_SCK,
            Cmd::ProcReq { .. } => code::PROC_REQ,
            Cmd::Send => code::SEND,
            Cmd::SendAll => code::SEND_ALL,
            Cmd::QueryConfReq => code::QUERY_CONF_REQ,
            Cmd::QueryConfRep(_) => code::QUERY_CONF_REP,
            Cmd::QueryRecvStatReq => code::QUERY_RECV_STAT_REQ,
            Cmd::QueryRecvStatRep(_) => code::QUERY_RECV_STAT_REP,
            Cmd::QueryProcStatReq => code::QUERY_PROC_STAT_REQ,
            Cmd::QueryProcStatRep(_) => code::QUERY_PROC_STAT_REP,
        }
    }

    /// Encode with `src` as the reply path.
    pub fn encode(&self, src: &Path) -> Result<[u8; CMD_LEN]> {
        let src = src.to_string_lossy();
        if src.len() >= PATH_LEN {
            return Err(Error::Cmd(format!("source path too long: {src}")));
        }
        let mut buf = [0u8; CMD_LEN];
        buf[0..4].copy_from_slice(&self.code().to_ne_bytes());
        put_cstr(&mut buf[4..4 + PATH_LEN], &src);

        let mut w = Writer { buf: &mut buf[4 + PATH_LEN..], at: 0 };
        match self {
            Cmd::AddSck { fd, serial, ip } => {
                w.i32(*fd);
                w.u32(0);
                w.u64(*serial);
                w.str(ip);
            }
            Cmd::ProcReq { ori_svr_idx, rqidx, num } => {
                w.u32(*ori_svr_idx);
                w.u32(*rqidx);
                w.i32(*num);
            }
            Cmd::QueryConfRep(c) => {
                w.str(&c.name);
                w.u32(c.port as u32);
                w.u32(c.recv_thd_num);
                w.u32(c.work_thd_num);
                w.u32(c.rqnum);
                w.u32(c.qmax);
                w.u32(c.qsize);
            }
            Cmd::QueryRecvStatRep(s) => {
                w.u32(s.connections);
                w.u32(0);
                w.u64(s.recv_total);
                w.u64(s.drop_total);
                w.u64(s.err_total);
            }
            Cmd::QueryProcStatRep(s) => {
                w.u64(s.proc_total);
                w.u64(s.drop_total);
                w.u64(s.err_total);
            }
            Cmd::Send | Cmd::SendAll | Cmd::QueryConfReq | Cmd::QueryRecvStatReq | Cmd::QueryProcStatReq => {}
        }
        Ok(buf)
    }

    /// Decode one datagram into `(source path, command)`.
    pub fn decode(buf: &[u8]) -> Result<(PathBuf, Cmd)> {
        if buf.len() != CMD_LEN {
            return Err(Error::Cmd(format!("datagram of {} bytes, expected {CMD_LEN}", buf.len())));
        }
        let ty = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let src = PathBuf::from(get_cstr(&buf[4..4 + PATH_LEN]));
        let mut r = Reader { buf: &buf[4 + PATH_LEN..], at: 0 };
        let cmd = match ty {
            code::ADD_SCK => {
                let fd = r.i32();
                r.u32();
                let serial = r.u64();
                Cmd::AddSck { fd, serial, ip: r.str() }
            }
            code::PROC_REQ => Cmd::ProcReq { ori_svr_idx: r.u32(), rqidx: r.u32(), num: r.i32() },
            code::SEND => Cmd::Send,
            code::SEND_ALL => Cmd::SendAll,
            code::QUERY_CONF_REQ => Cmd::QueryConfReq,
            code::QUERY_CONF_REP => Cmd::QueryConfRep(ConfInfo {
                name: r.str(),
                port: r.u32() as u16,
                recv_thd_num: r.u32(),
                work_thd_num: r.u32(),
                rqnum: r.u32(),
                qmax: r.u32(),
                qsize: r.u32(),
            }),
            code::QUERY_RECV_STAT_REQ => Cmd::QueryRecvStatReq,
            code::QUERY_RECV_STAT_REP => {
                let connections = r.u32();
                r.u32();
                Cmd::QueryRecvStatRep(RecvStat {
                    connections,
                    recv_total: r.u64(),
                    drop_total: r.u64(),
                    err_total: r.u64(),
                })
            }
            code::QUERY_PROC_STAT_REQ => Cmd::QueryProcStatReq,
            code::QUERY_PROC_STAT_REP => Cmd::QueryProcStatRep(ProcStat {
                proc_total: r.u64(),
                drop_total: r.u64(),
                err_total: r.u64(),
            }),
            other => return Err(Error::Cmd(format!("unknown command type {other}"))),
        };
        Ok((src, cmd))
    }
}

// ---------------------------------------------------------------------------
// CmdSocket
// ---------------------------------------------------------------------------

/// A thread's bound command socket. The socket file is removed on drop.
pub struct CmdSocket {
    sock: UnixDatagram,
    path: PathBuf,
}

impl CmdSocket {
    /// Bind at `path`, replacing a stale socket file and creating parent
    /// directories. The socket is non-blocking.
    pub fn bind(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let sock = UnixDatagram::bind(path)?;
        sock.set_nonblocking(true)?;
        Ok(Self { sock, path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send `cmd` to the socket bound at `dest`.
    pub fn send_to(&self, dest: &Path, cmd: &Cmd) -> Result<()> {
        let buf = cmd.encode(&self.path)?;
        loop {
            match self.sock.send_to(&buf, dest) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Next pending command, `None` if nothing is queued. Malformed
    /// datagrams are logged and skipped.
    pub fn recv(&self) -> Result<Option<(PathBuf, Cmd)>> {
        let mut buf = [0u8; CMD_LEN + 1];
        loop {
            match self.sock.recv(&mut buf) {
                Ok(n) => match Cmd::decode(&buf[..n]) {
                    Ok(m) => return Ok(Some(m)),
                    Err(e) => {
                        tracing::warn!(path = %self.path.display(), error = %e, "dropped malformed command");
                        continue;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Blocking receive with a timeout, for request/reply clients.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<(PathBuf, Cmd)>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(m) = self.recv()? {
                return Ok(Some(m));
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            crate::poll::wait_readable(self.as_raw_fd(), deadline - now)?;
        }
    }
}

impl AsRawFd for CmdSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

impl Drop for CmdSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl std::fmt::Debug for CmdSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmdSocket").field("path", &self.path).finish()
    }
}

// ---------------------------------------------------------------------------
// CmdClient
// ---------------------------------------------------------------------------

/// Request/reply helper for the query commands.
#[derive(Debug)]
pub struct CmdClient {
    sock: CmdSocket,
    timeout: Duration,
}

impl CmdClient {
    pub fn bind(path: &Path, timeout: Duration) -> Result<Self> {
        Ok(Self { sock: CmdSocket::bind(path)?, timeout })
    }

    /// Send `req` to `dest` and wait for one reply.
    pub fn request(&self, dest: &Path, req: &Cmd) -> Result<Cmd> {
        self.sock.send_to(dest, req)?;
        match self.sock.recv_timeout(self.timeout)? {
            Some((_, reply)) => Ok(reply),
            None => Err(Error::Cmd(format!("no reply from {}", dest.display()))),
        }
    }

    /// Send without waiting for a reply.
    pub fn notify(&self, dest: &Path, cmd: &Cmd) -> Result<()> {
        self.sock.send_to(dest, cmd)
    }

    /// One request per destination, replies in destination order.
    pub fn collect<I, P>(&self, dests: I, req: &Cmd) -> Result<Vec<Cmd>>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        dests.into_iter().map(|d| self.request(d.as_ref(), req)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_round_trips() {
        let cmds = [
            Cmd::AddSck { fd: 9, serial: 1 << 40, ip: "10.0.0.1".into() },
            Cmd::ProcReq { ori_svr_idx: 1, rqidx: 3, num: -1 },
            Cmd::Send,
            Cmd::SendAll,
            Cmd::QueryConfReq,
            Cmd::QueryConfRep(ConfInfo {
                name: "svc".into(),
                port: 4000,
                recv_thd_num: 2,
                work_thd_num: 3,
                rqnum: 6,
                qmax: 1024,
                qsize: 4096,
            }),
            Cmd::QueryRecvStatReq,
            Cmd::QueryRecvStatRep(RecvStat { connections: 2, recv_total: 10, drop_total: 1, err_total: 0 }),
            Cmd::QueryProcStatReq,
            Cmd::QueryProcStatRep(ProcStat { proc_total: 5, drop_total: 2, err_total: 1 }),
        ];
        for c in cmds {
            let buf = c.encode(Path::new("/tmp/x.usck")).unwrap();
            let (src, back) = Cmd::decode(&buf).unwrap();
            assert_eq!(src, Path::new("/tmp/x.usck"));
            assert_eq!(back, c);
        }
    }

    #[test]
    fn unknown_code_is_rejected() {
        let mut buf = Cmd::Send.encode(Path::new("/a")).unwrap();
        buf[0..4].copy_from_slice(&99u32.to_ne_bytes());
        assert!(Cmd::decode(&buf).is_err());
        assert!(Cmd::decode(&buf[..10]).is_err());
    }
}

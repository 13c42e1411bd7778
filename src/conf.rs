// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Configuration: a key-lookup `ConfigSource` and the typed receive/send
// configurations built from it. Loaded once at startup, immutable after.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::{PASSWD_LEN, USER_LEN};

/// Queues each worker drains.
pub const WORKER_HDL_QNUM: usize = 2;

/// Default socket buffer capacity (5 MiB).
pub const DEFAULT_BUFF_SIZE: usize = 5 * 1024 * 1024;

// ---------------------------------------------------------------------------
// ConfigSource
// ---------------------------------------------------------------------------

/// Key/value lookup with dotted keys, e.g. `recvq.max`.
pub trait ConfigSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// In-memory source.
#[derive(Debug, Clone, Default)]
pub struct MapSource {
    map: HashMap<String, String>,
}

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl ToString) -> Self {
        self.map.insert(key.to_owned(), value.to_string());
        self
    }
}

impl ConfigSource for MapSource {
    fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }
}

/// A JSON document; dotted keys walk nested objects.
#[derive(Debug, Clone)]
pub struct JsonSource {
    root: serde_json::Value,
}

impl JsonSource {
    pub fn from_str(text: &str) -> Result<Self> {
        let root = serde_json::from_str(text).map_err(|e| Error::config("<json>", e.to_string()))?;
        Ok(Self { root })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }
}

impl ConfigSource for JsonSource {
    fn get(&self, key: &str) -> Option<String> {
        let v = key.split('.').try_fold(&self.root, |v, k| v.get(k))?;
        match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null | serde_json::Value::Object(_) | serde_json::Value::Array(_) => None,
            other => Some(other.to_string()),
        }
    }
}

fn get_or<T: FromStr>(src: &dyn ConfigSource, key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match src.get(key) {
        Some(s) => s.trim().parse().map_err(|e: T::Err| Error::config(key, e.to_string())),
        None => Ok(default),
    }
}

fn require<T: FromStr>(src: &dyn ConfigSource, key: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let s = src.get(key).ok_or_else(|| Error::config(key, "missing"))?;
    s.trim().parse().map_err(|e: T::Err| Error::config(key, e.to_string()))
}

fn get_bool(src: &dyn ConfigSource, key: &str, default: bool) -> Result<bool> {
    match src.get(key).as_deref().map(str::trim) {
        None => Ok(default),
        Some("1" | "true" | "on" | "yes") => Ok(true),
        Some("0" | "false" | "off" | "no") => Ok(false),
        Some(other) => Err(Error::config(key, format!("not a boolean: {other}"))),
    }
}

// ---------------------------------------------------------------------------
// Shared pieces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConf {
    pub node_id: i32,
    pub user: String,
    pub passwd: String,
}

impl AuthConf {
    fn load(src: &dyn ConfigSource, node_key: &str) -> Result<Self> {
        let a = Self {
            node_id: require(src, node_key)?,
            user: require(src, "auth.user")?,
            passwd: require(src, "auth.passwd")?,
        };
        if a.user.len() >= USER_LEN {
            return Err(Error::config("auth.user", format!("longer than {} bytes", USER_LEN - 1)));
        }
        if a.passwd.len() >= PASSWD_LEN {
            return Err(Error::config("auth.passwd", format!("longer than {} bytes", PASSWD_LEN - 1)));
        }
        Ok(a)
    }
}

/// `max` units of `size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConf {
    pub max: usize,
    pub size: usize,
}

impl QueueConf {
    fn load(src: &dyn ConfigSource, prefix: &str, default: QueueConf) -> Result<Self> {
        let q = Self {
            max: get_or(src, &format!("{prefix}.max"), default.max)?,
            size: get_or(src, &format!("{prefix}.size"), default.size)?,
        };
        if q.max == 0 || q.size == 0 {
            return Err(Error::config(prefix, "max and size must be positive"));
        }
        Ok(q)
    }

    fn require_pow2(&self, key: &str) -> Result<()> {
        if !self.max.is_power_of_two() {
            return Err(Error::config(key, format!("max {} is not a power of two", self.max)));
        }
        Ok(())
    }
}

/// CPU pinning hint: thread `i` runs on `start + i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CpuConf {
    pub on: bool,
    pub start: usize,
}

impl CpuConf {
    fn load(src: &dyn ConfigSource) -> Result<Self> {
        Ok(Self { on: get_bool(src, "cpu.on", false)?, start: get_or(src, "cpu.start", 0)? })
    }

    /// Pin the calling thread if enabled.
    pub fn apply(&self, idx: usize) {
        if self.on && !crate::platform::pin_current_thread(self.start + idx) {
            tracing::warn!(cpu = self.start + idx, "cpu affinity not applied");
        }
    }
}

/// Timing knobs. One set of defaults for every pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Send side: idle time before a keep-alive request.
    pub keepalive: Duration,
    /// Receive side: a connection silent this long is closed.
    pub idle: Duration,
    /// Bound on every event-loop wait.
    pub poll: Duration,
    /// Send side: backoff between connect attempts.
    pub reconnect: Duration,
    /// Distribution thread sleep when its queue is empty.
    pub dist_poll: Duration,
    /// Send side: a non-empty page older than this is flushed.
    pub page_flush: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(30),
            idle: Duration::from_secs(60),
            poll: Duration::from_secs(1),
            reconnect: Duration::from_secs(2),
            dist_poll: Duration::from_micros(500),
            page_flush: Duration::from_secs(5),
        }
    }
}

impl Timeouts {
    fn load(src: &dyn ConfigSource) -> Result<Self> {
        let d = Self::default();
        let t = Self {
            keepalive: Duration::from_millis(get_or(src, "timeout.keepalive_ms", d.keepalive.as_millis() as u64)?),
            idle: Duration::from_millis(get_or(src, "timeout.idle_ms", d.idle.as_millis() as u64)?),
            poll: Duration::from_millis(get_or(src, "timeout.poll_ms", d.poll.as_millis() as u64)?),
            reconnect: Duration::from_millis(get_or(src, "timeout.reconnect_ms", d.reconnect.as_millis() as u64)?),
            dist_poll: Duration::from_micros(get_or(src, "timeout.dist_poll_us", d.dist_poll.as_micros() as u64)?),
            page_flush: Duration::from_millis(get_or(src, "timeout.page_flush_ms", d.page_flush.as_millis() as u64)?),
        };
        if t.poll.is_zero() {
            return Err(Error::config("timeout.poll_ms", "must be positive"));
        }
        Ok(t)
    }
}

fn thread_num(src: &dyn ConfigSource, key: &str, default: usize) -> Result<usize> {
    let n = get_or(src, key, default)?;
    if n == 0 {
        return Err(Error::config(key, "must be at least 1"));
    }
    Ok(n)
}

// ---------------------------------------------------------------------------
// RecvConf
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecvConf {
    /// Service name; unique per host.
    pub name: String,
    /// Runtime directory for command sockets and shm key paths.
    pub dir: PathBuf,
    pub auth: AuthConf,
    /// Listen port; 0 binds an ephemeral port.
    pub port: u16,
    pub recv_thd_num: usize,
    pub work_thd_num: usize,
    /// Receive queues (receive-server → worker).
    pub recvq: QueueConf,
    /// Forward queues (distribution → receive-server).
    pub sendq: QueueConf,
    /// Shared-memory distribution queue; `max` must be a power of two.
    pub distq: QueueConf,
    pub recv_buff_size: usize,
    pub send_buff_size: usize,
    pub timeouts: Timeouts,
    pub cpu: CpuConf,
}

impl RecvConf {
    pub fn from_source(src: &dyn ConfigSource) -> Result<Self> {
        let conf = Self {
            name: require(src, "name")?,
            dir: PathBuf::from(get_or(src, "dir", String::from("/tmp/sdtp/recv"))?),
            auth: AuthConf::load(src, "auth.node_id")?,
            port: require(src, "port")?,
            recv_thd_num: thread_num(src, "recv_thd_num", 1)?,
            work_thd_num: thread_num(src, "work_thd_num", 1)?,
            recvq: QueueConf::load(src, "recvq", QueueConf { max: 1024, size: 64 * 1024 })?,
            sendq: QueueConf::load(src, "sendq", QueueConf { max: 1024, size: 64 * 1024 })?,
            distq: QueueConf::load(src, "distq", QueueConf { max: 1024, size: 64 * 1024 })?,
            recv_buff_size: get_or(src, "recv_buff_size", DEFAULT_BUFF_SIZE)?,
            send_buff_size: get_or(src, "send_buff_size", DEFAULT_BUFF_SIZE)?,
            timeouts: Timeouts::load(src)?,
            cpu: CpuConf::load(src)?,
        };
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(Error::config("name", "must be a non-empty file name"));
        }
        self.distq.require_pow2("distq.max")?;
        if self.recv_buff_size < crate::frame::HEADER_LEN || self.send_buff_size < crate::frame::HEADER_LEN {
            return Err(Error::config("recv_buff_size", "smaller than a frame header"));
        }
        Ok(())
    }

    /// Number of receive queues.
    pub fn rqnum(&self) -> usize {
        self.work_thd_num * WORKER_HDL_QNUM
    }

    fn usck_dir(&self) -> PathBuf {
        self.dir.join(&self.name).join("usck")
    }

    pub fn listen_path(&self) -> PathBuf {
        self.usck_dir().join(format!("{}_listen.usck", self.name))
    }

    pub fn rsvr_path(&self, idx: usize) -> PathBuf {
        self.usck_dir().join(format!("{}_rsvr_{}.usck", self.name, idx + 1))
    }

    pub fn worker_path(&self, idx: usize) -> PathBuf {
        self.usck_dir().join(format!("{}_wsvr_{}.usck", self.name, idx + 1))
    }

    pub fn cli_path(&self, tag: &str) -> PathBuf {
        self.usck_dir().join(format!("{}_cli_{}.usck", self.name, tag))
    }

    pub fn dist_path(&self) -> PathBuf {
        self.usck_dir().join(format!("{}_dist.usck", self.name))
    }

    /// Key path of the shared-memory distribution queue.
    pub fn distq_path(&self) -> PathBuf {
        self.dir.join(&self.name).join(format!("{}_shm_distq", self.name))
    }
}

// ---------------------------------------------------------------------------
// SendConf
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendConf {
    pub name: String,
    pub dir: PathBuf,
    pub auth: AuthConf,
    /// Peer address.
    pub ip: String,
    pub port: u16,
    pub send_thd_num: usize,
    pub work_thd_num: usize,
    pub send_buff_size: usize,
    pub recv_buff_size: usize,
    /// Page pool per send thread: each page holds `max` × `size` bytes.
    pub sendq: QueueConf,
    /// Queues for frames received from the peer.
    pub recvq: QueueConf,
    pub timeouts: Timeouts,
    pub cpu: CpuConf,
}

impl SendConf {
    pub fn from_source(src: &dyn ConfigSource) -> Result<Self> {
        let conf = Self {
            name: require(src, "name")?,
            dir: PathBuf::from(get_or(src, "dir", String::from("/tmp/sdtp/send"))?),
            auth: AuthConf::load(src, "node_id")?,
            ip: get_or(src, "ip", String::from("127.0.0.1"))?,
            port: require(src, "port")?,
            send_thd_num: thread_num(src, "send_thd_num", 1)?,
            work_thd_num: thread_num(src, "work_thd_num", 1)?,
            send_buff_size: get_or(src, "send_buff_size", DEFAULT_BUFF_SIZE)?,
            recv_buff_size: get_or(src, "recv_buff_size", DEFAULT_BUFF_SIZE)?,
            sendq: QueueConf::load(src, "sendq", QueueConf { max: 1024, size: 1024 })?,
            recvq: QueueConf::load(src, "recvq", QueueConf { max: 1024, size: 64 * 1024 })?,
            timeouts: Timeouts::load(src)?,
            cpu: CpuConf::load(src)?,
        };
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(Error::config("name", "must be a non-empty file name"));
        }
        if self.recv_buff_size < crate::frame::HEADER_LEN {
            return Err(Error::config("recv_buff_size", "smaller than a frame header"));
        }
        // A switched-out page is staged whole in the send buffer.
        match self.sendq.max.checked_mul(self.sendq.size) {
            Some(page) if page <= self.send_buff_size => {}
            _ => return Err(Error::config("send_buff_size", "smaller than one page (sendq.max x sendq.size)")),
        }
        Ok(())
    }

    pub fn rqnum(&self) -> usize {
        self.work_thd_num * WORKER_HDL_QNUM
    }

    fn usck_dir(&self) -> PathBuf {
        self.dir.join(&self.name).join("usck")
    }

    pub fn ssvr_path(&self, idx: usize) -> PathBuf {
        self.usck_dir().join(format!("{}_ssvr_{}.usck", self.name, idx + 1))
    }

    pub fn worker_path(&self, idx: usize) -> PathBuf {
        self.usck_dir().join(format!("{}_swrk_{}.usck", self.name, idx + 1))
    }

    pub fn cli_path(&self, tag: &str) -> PathBuf {
        self.usck_dir().join(format!("{}_cli_{}.usck", self.name, tag))
    }

    /// Key path of send thread `idx`'s page pool.
    pub fn pool_path(&self, idx: usize) -> PathBuf {
        self.dir.join(&self.name).join(format!("{}_ssvr_{}.pool", self.name, idx + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> MapSource {
        MapSource::new()
            .set("name", "svc")
            .set("auth.node_id", 1)
            .set("auth.user", "a")
            .set("auth.passwd", "b")
            .set("port", 0)
    }

    #[test]
    fn defaults_fill_in() {
        let c = RecvConf::from_source(&base()).unwrap();
        assert_eq!(c.timeouts.keepalive, Duration::from_secs(30));
        assert_eq!(c.timeouts.idle, Duration::from_secs(60));
        assert_eq!(c.rqnum(), WORKER_HDL_QNUM);
        assert!(c.rsvr_path(0).ends_with("svc/usck/svc_rsvr_1.usck"));
    }

    #[test]
    fn bad_values_name_the_key() {
        let err = RecvConf::from_source(&base().set("recv_thd_num", 0)).unwrap_err();
        assert!(matches!(err, Error::Config { ref key, .. } if key == "recv_thd_num"));
        let err = RecvConf::from_source(&base().set("distq.max", 1000)).unwrap_err();
        assert!(matches!(err, Error::Config { ref key, .. } if key == "distq.max"));
        let err = RecvConf::from_source(&base().set("auth.passwd", "x".repeat(16))).unwrap_err();
        assert!(matches!(err, Error::Config { ref key, .. } if key == "auth.passwd"));
    }

    #[test]
    fn send_buffer_must_hold_a_page() {
        let src = base().set("node_id", 9).set("sendq.max", 16).set("sendq.size", 1024);
        assert!(SendConf::from_source(&src.clone().set("send_buff_size", 16 * 1024)).is_ok());
        let err = SendConf::from_source(&src.set("send_buff_size", 16 * 1024 - 1)).unwrap_err();
        assert!(matches!(err, Error::Config { ref key, .. } if key == "send_buff_size"));
    }

    #[test]
    fn json_nested_keys() {
        let src = JsonSource::from_str(
            r#"{"name":"svc","port":9000,"auth":{"node_id":3,"user":"u","passwd":"p"},
                "recvq":{"max":8,"size":256},"cpu":{"on":false}}"#,
        )
        .unwrap();
        assert_eq!(src.get("recvq.max").as_deref(), Some("8"));
        let c = RecvConf::from_source(&src).unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.auth.node_id, 3);
        assert_eq!(c.recvq, QueueConf { max: 8, size: 256 });
    }
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Receive service end to end: a raw TCP peer against a launched service.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver as Rx};

use sdtp::frame::{self, AuthReq, AuthResp, Header, SysType, HEADER_LEN};
use sdtp::{Cmd, CmdSocket, Error, MapSource, Receiver, RecvConf, RecvHandle};

const WAIT: Duration = Duration::from_secs(5);

fn conf(dir: &std::path::Path) -> MapSource {
    MapSource::new()
        .set("name", "rt")
        .set("dir", dir.display())
        .set("port", 0)
        .set("auth.node_id", 1000)
        .set("auth.user", "edge")
        .set("auth.passwd", "pw")
        .set("recv_thd_num", 2)
        .set("work_thd_num", 2)
        .set("recvq.max", 64)
        .set("recvq.size", 4096)
        .set("sendq.max", 64)
        .set("sendq.size", 1024)
        .set("distq.max", 64)
        .set("distq.size", 1024)
        .set("recv_buff_size", 16 * 1024)
        .set("send_buff_size", 16 * 1024)
        .set("timeout.poll_ms", 20)
        .set("timeout.idle_ms", 60_000)
}

type Seen = (u16, i32, Vec<u8>);

/// Launch with handlers for types 1 and 2 that report every frame.
fn launch(src: MapSource) -> (RecvHandle, Rx<Seen>) {
    let conf = RecvConf::from_source(&src).unwrap();
    let mut recv = Receiver::new(conf).unwrap();
    let (tx, rx) = unbounded();
    for ty in [1u16, 2] {
        let tx = tx.clone();
        recv.register(ty, move |ty, node_id, body| {
            tx.send((ty, node_id, body.to_vec())).map_err(|e| Error::InvalidArgument(e.to_string()))
        })
        .unwrap();
    }
    (recv.launch().unwrap(), rx)
}

fn connect(h: &RecvHandle) -> TcpStream {
    let s = TcpStream::connect(("127.0.0.1", h.local_addr().port())).unwrap();
    s.set_read_timeout(Some(WAIT)).unwrap();
    s
}

fn read_frame(s: &mut TcpStream) -> (Header, Vec<u8>) {
    let mut head = [0u8; HEADER_LEN];
    s.read_exact(&mut head).unwrap();
    let head = frame::parse_header(&head).unwrap();
    let mut body = vec![0u8; head.length as usize];
    s.read_exact(&mut body).unwrap();
    (head, body)
}

fn auth(s: &mut TcpStream, node_id: i32, passwd: &str) -> AuthResp {
    let req = AuthReq { node_id, user: "edge".into(), passwd: passwd.into() };
    s.write_all(&frame::auth_req(&req)).unwrap();
    let (head, body) = read_frame(s);
    assert_eq!(SysType::from_u16(head.ty), Some(SysType::LinkAuthResp));
    AuthResp::decode(&body).unwrap()
}

fn user(ty: u16, node_id: i32, body: &[u8]) -> Vec<u8> {
    frame::encode_frame(Header::user(ty, node_id, 0), body)
}

/// Poll `f` until it holds or the wait runs out.
fn eventually(mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn authenticated_frames_reach_handlers() {
    let dir = tempfile::tempdir().unwrap();
    let (h, rx) = launch(conf(dir.path()));
    let mut s = connect(&h);

    assert_eq!(auth(&mut s, 7, "pw"), AuthResp { node_id: 7, is_success: true });
    assert!(eventually(|| h.route_map().pick_random(7).is_some()));

    let mut burst = Vec::new();
    for i in 0..50u32 {
        burst.extend_from_slice(&user(1 + (i % 2) as u16, 7, &i.to_be_bytes()));
    }
    s.write_all(&burst).unwrap();

    let mut got: Vec<Seen> = (0..50).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    got.sort_by_key(|(_, _, b)| u32::from_be_bytes(b[..4].try_into().unwrap()));
    for (i, (ty, node_id, body)) in got.into_iter().enumerate() {
        assert_eq!(ty, 1 + (i % 2) as u16);
        assert_eq!(node_id, 7);
        assert_eq!(body, (i as u32).to_be_bytes());
    }
    assert_eq!(h.stats().recv_total().recv_total, 50);
    assert!(eventually(|| h.stats().proc_total().proc_total == 50));
}

#[test]
fn unauthenticated_and_mismatched_frames_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let (h, rx) = launch(conf(dir.path()));
    let mut s = connect(&h);

    s.write_all(&user(1, 7, b"early")).unwrap();
    assert_eq!(auth(&mut s, 7, "wrong"), AuthResp { node_id: 7, is_success: false });
    assert!(h.route_map().pick_random(7).is_none());
    s.write_all(&user(1, 7, b"still no")).unwrap();
    assert_eq!(auth(&mut s, 7, "pw"), AuthResp { node_id: 7, is_success: true });
    s.write_all(&user(1, 8, b"wrong node")).unwrap();
    s.write_all(&user(1, 7, b"ok")).unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), (1, 7, b"ok".to_vec()));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    let r = h.stats().recv_total();
    assert_eq!((r.recv_total, r.drop_total), (4, 3));
}

#[test]
fn one_worker_dispatches_in_arrival_order() {
    let dir = tempfile::tempdir().unwrap();
    let (h, rx) = launch(conf(dir.path()).set("work_thd_num", 1).set("recvq.size", 256));
    let mut s = connect(&h);
    auth(&mut s, 7, "pw");

    // Small queue units force many batches per burst.
    for round in 0..4u32 {
        let mut burst = Vec::new();
        for i in 0..50u32 {
            burst.extend_from_slice(&user(1, 7, &(round * 50 + i).to_be_bytes()));
        }
        s.write_all(&burst).unwrap();
    }
    let got: Vec<u32> = (0..200)
        .map(|_| u32::from_be_bytes(rx.recv_timeout(WAIT).unwrap().2[..4].try_into().unwrap()))
        .collect();
    assert_eq!(got, (0..200).collect::<Vec<_>>());
}

#[test]
fn failed_reauth_withdraws_the_route() {
    let dir = tempfile::tempdir().unwrap();
    let (h, rx) = launch(conf(dir.path()));
    let mut s = connect(&h);
    assert!(auth(&mut s, 7, "pw").is_success);
    assert!(h.route_map().pick_random(7).is_some());

    assert!(!auth(&mut s, 7, "wrong").is_success);
    assert!(h.route_map().pick_random(7).is_none());
    s.write_all(&user(1, 7, b"after")).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(eventually(|| h.stats().recv_total().drop_total == 1));
}

#[test]
fn socket_hand_off_only_from_the_listener() {
    let dir = tempfile::tempdir().unwrap();
    let (h, _rx) = launch(conf(dir.path()));
    let side = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut ours = TcpStream::connect(side.local_addr().unwrap()).unwrap();
    let (mut theirs, _) = side.accept().unwrap();

    let stranger = CmdSocket::bind(&dir.path().join("stranger")).unwrap();
    let add = Cmd::AddSck { fd: ours.as_raw_fd(), serial: 1, ip: "127.0.0.1".into() };
    stranger.send_to(&h.conf().rsvr_path(0), &add).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(h.stats().recv_total().connections, 0);

    // Still ours.
    ours.write_all(b"mine").unwrap();
    let mut buf = [0u8; 4];
    theirs.set_read_timeout(Some(WAIT)).unwrap();
    theirs.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"mine");
}

#[test]
fn unregistered_type_counts_as_worker_drop() {
    let dir = tempfile::tempdir().unwrap();
    let (h, rx) = launch(conf(dir.path()));
    let mut s = connect(&h);
    auth(&mut s, 3, "pw");
    s.write_all(&user(9, 3, b"nobody home")).unwrap();
    s.write_all(&user(1, 3, b"somebody")).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap().2, b"somebody");
    assert!(eventually(|| h.stats().proc_total().drop_total == 1));
}

#[test]
fn keepalive_is_answered_with_own_node_id() {
    let dir = tempfile::tempdir().unwrap();
    let (h, _rx) = launch(conf(dir.path()));
    let mut s = connect(&h);
    s.write_all(&frame::keepalive_req(55)).unwrap();
    let (head, body) = read_frame(&mut s);
    assert!(head.is_sys());
    assert_eq!(SysType::from_u16(head.ty), Some(SysType::KeepaliveResp));
    assert_eq!(head.node_id, 1000);
    assert!(body.is_empty());
}

#[test]
fn idle_connection_is_closed_and_unrouted() {
    let dir = tempfile::tempdir().unwrap();
    let (h, _rx) = launch(conf(dir.path()).set("timeout.idle_ms", 150));
    let mut s = connect(&h);
    auth(&mut s, 11, "pw");
    assert!(h.route_map().pick_random(11).is_some());

    let mut buf = [0u8; 16];
    let started = Instant::now();
    assert_eq!(s.read(&mut buf).unwrap(), 0);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(eventually(|| h.route_map().pick_random(11).is_none()));
    assert!(eventually(|| h.stats().recv_total().connections == 0));
}

#[test]
fn corrupt_stream_closes_connection() {
    let dir = tempfile::tempdir().unwrap();
    let (h, _rx) = launch(conf(dir.path()));
    let mut s = connect(&h);
    s.write_all(&[0x5A; HEADER_LEN * 2]).unwrap();
    let mut buf = [0u8; 16];
    // Closed: orderly EOF or a reset, never data.
    assert!(!matches!(s.read(&mut buf), Ok(n) if n > 0));
    assert!(eventually(|| h.stats().recv_total().err_total == 1));
}

#[test]
fn forwarded_frames_reach_the_destination_node() {
    let dir = tempfile::tempdir().unwrap();
    let (h, _rx) = launch(conf(dir.path()));
    let mut a = connect(&h);
    let mut b = connect(&h);
    auth(&mut a, 21, "pw");
    auth(&mut b, 22, "pw");

    let cli = h.cli().unwrap();
    cli.send(2, 22, b"to b").unwrap();
    cli.send(1, 21, b"to a").unwrap();

    let (head, body) = read_frame(&mut b);
    assert_eq!((head.is_sys(), head.ty, head.node_id), (false, 2, 22));
    assert_eq!(body, b"to b");
    let (head, body) = read_frame(&mut a);
    assert_eq!((head.ty, head.node_id), (1, 21));
    assert_eq!(body, b"to a");

    assert!(matches!(cli.send(TYPE_OUT, 21, b""), Err(Error::TypeOutOfRange(TYPE_OUT))));
}

#[test]
fn unroutable_forwards_are_counted() {
    let dir = tempfile::tempdir().unwrap();
    let (h, _rx) = launch(conf(dir.path()));
    let mut a = connect(&h);
    auth(&mut a, 21, "pw");

    let cli = h.cli().unwrap();
    for _ in 0..5 {
        cli.send(1, 999, b"lost").unwrap();
    }
    cli.send(1, 21, b"found").unwrap();
    let (_, body) = read_frame(&mut a);
    assert_eq!(body, b"found");

    assert!(eventually(|| h.stats().dist.drop_total.load(Ordering::Relaxed) == 5));
    let d = cli.query_dist_stat().unwrap();
    assert_eq!((d.recv_total, d.drop_total, d.err_total), (6, 5, 0));
}

const TYPE_OUT: u16 = frame::TYPE_MAX;

#[test]
fn queries_report_config_and_counters() {
    let dir = tempfile::tempdir().unwrap();
    let (h, rx) = launch(conf(dir.path()));
    let mut s = connect(&h);
    auth(&mut s, 5, "pw");
    s.write_all(&user(1, 5, b"x")).unwrap();
    rx.recv_timeout(WAIT).unwrap();

    let cli = h.cli().unwrap();
    let c = cli.query_conf().unwrap();
    assert_eq!(c.name, "rt");
    assert_eq!(c.port, h.local_addr().port());
    assert_eq!((c.recv_thd_num, c.work_thd_num, c.rqnum), (2, 2, 4));
    assert_eq!((c.qmax, c.qsize), (64, 4096));

    let recv = cli.query_recv_stats().unwrap();
    assert_eq!(recv.len(), 2);
    assert_eq!(recv.iter().map(|r| r.recv_total).sum::<u64>(), 1);
    assert_eq!(recv.iter().map(|r| r.connections).sum::<u32>(), 1);

    let proc = cli.query_proc_stats().unwrap();
    assert_eq!(proc.len(), 2);
    assert!(eventually(|| cli.query_proc_stats().unwrap().iter().map(|p| p.proc_total).sum::<u64>() == 1));
}

#[test]
fn connections_spread_over_servers() {
    let dir = tempfile::tempdir().unwrap();
    let (h, _rx) = launch(conf(dir.path()));
    let mut conns: Vec<TcpStream> = (0..4).map(|_| connect(&h)).collect();
    for (i, s) in conns.iter_mut().enumerate() {
        auth(s, 40 + i as i32, "pw");
    }
    // Accept order assigns servers round-robin by serial.
    let servers: Vec<usize> = (0..4).map(|i| h.route_map().pick_random(40 + i).unwrap()).collect();
    assert!(servers.contains(&0) && servers.contains(&1), "{servers:?}");
    assert_eq!(h.stats().servers[0].connections.load(Ordering::Relaxed), 2);

    for s in &conns {
        s.shutdown(Shutdown::Both).unwrap();
    }
    assert!(eventually(|| h.route_map().node_count() == 0));
}

#[test]
fn register_rejects_bad_types() {
    let dir = tempfile::tempdir().unwrap();
    let mut recv = Receiver::new(RecvConf::from_source(&conf(dir.path())).unwrap()).unwrap();
    recv.register(3, |_, _, _| Ok(())).unwrap();
    assert!(matches!(recv.register(3, |_, _, _| Ok(())), Err(Error::RepeatRegister(3))));
    assert!(matches!(recv.register(frame::TYPE_MAX, |_, _, _| Ok(())), Err(Error::TypeOutOfRange(_))));
}

#[test]
fn stop_joins_every_thread() {
    let dir = tempfile::tempdir().unwrap();
    let (h, _rx) = launch(conf(dir.path()));
    let port = h.local_addr().port();
    let started = Instant::now();
    h.stop();
    assert!(started.elapsed() < WAIT);
    assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
}

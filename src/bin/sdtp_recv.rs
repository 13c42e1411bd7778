// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Run a receive service from a JSON config file.
//
// Usage:
//   sdtp_recv -c recv.json -t 1 -t 2
//
// Every frame of a registered type is counted and logged at debug level.
// Counters are printed every `--report` seconds until Ctrl-C.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sdtp::{JsonSource, Receiver, RecvConf};

#[derive(Parser, Debug)]
#[command(name = "sdtp_recv", version, about = "Run a receive service")]
struct Args {
    /// JSON config file.
    #[arg(short, long)]
    config: PathBuf,
    /// Message types to accept; may be repeated.
    #[arg(short = 't', long = "type", default_value = "1")]
    types: Vec<u16>,
    /// Seconds between counter reports.
    #[arg(long, default_value_t = 5)]
    report: u64,
}

fn main() -> sdtp::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let conf = RecvConf::from_source(&JsonSource::from_file(&args.config)?)?;
    let mut recv = Receiver::new(conf)?;
    let frames = Arc::new(AtomicU64::new(0));
    for &ty in &args.types {
        let frames = Arc::clone(&frames);
        recv.register(ty, move |ty, node_id, body| {
            frames.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(ty, node_id, len = body.len(), "frame");
            Ok(())
        })?;
    }

    let quit = Arc::new(AtomicBool::new(false));
    {
        let q = Arc::clone(&quit);
        if let Err(e) = ctrlc::set_handler(move || q.store(true, Ordering::Release)) {
            tracing::warn!(error = %e, "no Ctrl-C handler");
        }
    }

    let handle = recv.launch()?;
    println!("listening on {}", handle.local_addr());
    let mut ticks = 0u64;
    while !quit.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
        ticks += 1;
        if ticks % (args.report.max(1) * 10) == 0 {
            let r = handle.stats().recv_total();
            let p = handle.stats().proc_total();
            println!(
                "conns {} recv {} drop {} err {} | proc {} handled {}",
                r.connections,
                r.recv_total,
                r.drop_total,
                r.err_total,
                p.proc_total,
                frames.load(Ordering::Relaxed)
            );
        }
    }
    handle.stop();
    Ok(())
}

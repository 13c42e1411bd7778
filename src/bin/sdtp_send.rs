// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Run a send service from a JSON config file and push test frames through
// it.
//
// Usage:
//   sdtp_send -c send.json --count 100000 --size 256
//
// With `--count 0` the service only runs (other processes attach with
// `SendClient`) until Ctrl-C.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sdtp::{Error, JsonSource, SendConf, Sender};

#[derive(Parser, Debug)]
#[command(name = "sdtp_send", version, about = "Run a send service")]
struct Args {
    #[arg(short, long)]
    config: PathBuf,
    /// Message type of the test frames.
    #[arg(short = 't', long = "type", default_value_t = 1)]
    ty: u16,
    /// Frames to send; 0 to only run the service.
    #[arg(short = 'n', long, default_value_t = 0)]
    count: u64,
    /// Body size of each frame.
    #[arg(short, long, default_value_t = 128)]
    size: usize,
}

fn main() -> sdtp::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let conf = SendConf::from_source(&JsonSource::from_file(&args.config)?)?;
    let handle = Sender::new(conf)?.launch()?;

    let quit = Arc::new(AtomicBool::new(false));
    {
        let q = Arc::clone(&quit);
        if let Err(e) = ctrlc::set_handler(move || q.store(true, Ordering::Release)) {
            tracing::warn!(error = %e, "no Ctrl-C handler");
        }
    }

    let cli = handle.client()?;
    let body = vec![b'A'; args.size];
    let started = Instant::now();
    let mut sent = 0u64;
    while sent < args.count && !quit.load(Ordering::Acquire) {
        match cli.send(args.ty, &body) {
            Ok(()) => sent += 1,
            Err(Error::QueueFull) => std::thread::sleep(Duration::from_micros(200)),
            Err(e) => return Err(e),
        }
    }
    if args.count > 0 {
        cli.flush()?;
        while cli.pending() > 0 && !quit.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(10));
        }
        let secs = started.elapsed().as_secs_f64();
        println!("sent {sent} frames in {secs:.3}s ({:.0}/s)", sent as f64 / secs.max(f64::EPSILON));
    } else {
        while !quit.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(100));
        }
    }
    handle.stop();
    Ok(())
}

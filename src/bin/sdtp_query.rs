// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Query a running receive service, or forward one frame through it.
//
// Usage:
//   sdtp_query -c recv.json conf
//   sdtp_query -c recv.json recv-stat
//   sdtp_query -c recv.json proc-stat
//   sdtp_query -c recv.json forward --dest 7 --type 1 hello

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sdtp::{JsonSource, RecvClient, RecvConf};

#[derive(Parser, Debug)]
#[command(name = "sdtp_query", version, about = "Query a receive service")]
struct Args {
    #[arg(short, long)]
    config: PathBuf,
    #[command(subcommand)]
    what: What,
}

#[derive(Subcommand, Debug)]
enum What {
    /// Effective configuration.
    Conf,
    /// Per receive-server counters.
    RecvStat,
    /// Per worker counters.
    ProcStat,
    /// Queue one frame for a connected node.
    Forward {
        #[arg(long)]
        dest: i32,
        #[arg(short = 't', long = "type", default_value_t = 1)]
        ty: u16,
        data: String,
    },
}

fn main() -> sdtp::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let conf = RecvConf::from_source(&JsonSource::from_file(&args.config)?)?;
    let cli = RecvClient::attach(&conf)?;
    match args.what {
        What::Conf => {
            let c = cli.query_conf()?;
            println!("{}", serde_json::to_string_pretty(&c).map_err(|e| sdtp::Error::Cmd(e.to_string()))?);
        }
        What::RecvStat => {
            for (i, s) in cli.query_recv_stats()?.iter().enumerate() {
                println!(
                    "rsvr[{i}] conns {} recv {} drop {} err {}",
                    s.connections, s.recv_total, s.drop_total, s.err_total
                );
            }
            let d = cli.query_dist_stat()?;
            println!("dist recv {} drop {} err {}", d.recv_total, d.drop_total, d.err_total);
        }
        What::ProcStat => {
            for (i, s) in cli.query_proc_stats()?.iter().enumerate() {
                println!("worker[{i}] proc {} drop {} err {}", s.proc_total, s.drop_total, s.err_total);
            }
        }
        What::Forward { dest, ty, data } => {
            cli.send(ty, dest, data.as_bytes())?;
            println!("queued {} bytes for node {dest}", data.len());
        }
    }
    Ok(())
}

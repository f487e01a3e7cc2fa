use anyhow::{bail, Result};
use chrono::FixedOffset;
use clap::Parser;
use server::config::default_workers;
use server::{Config, Semantic, Server};
use std::path::PathBuf;
use std::process;
use tracing::error;
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser, Debug)]
#[command(name = "server", about = "Facility booking server over UDP")]
struct Args {
    /// UDP port to listen on
    port: u16,

    /// Duplicate-handling policy for retransmitted requests
    #[arg(long, value_enum, default_value = "at-least-once")]
    semantic: Semantic,

    /// Worker thread count, defaults to the hardware thread count
    #[arg(long)]
    threads: Option<usize>,

    /// Probability in [0, 1] of silently dropping an outgoing response,
    /// for exercising client retries and dedup
    #[arg(long, default_value_t = 0.0)]
    drop_rate: f64,

    /// UTC offset in hours used for availability slot generation
    #[arg(long, default_value_t = 8, allow_negative_numbers = true)]
    utc_offset: i32,

    /// Directory for the persistence files
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Keep all state in memory only
    #[arg(long)]
    no_persist: bool,
}

fn run(args: Args) -> Result<()> {
    let Some(zone) = FixedOffset::east_opt(args.utc_offset * 3600) else {
        bail!("utc offset {} is out of range", args.utc_offset);
    };

    let mut cfg = Config::new(args.port, args.semantic);
    cfg.workers = args.threads.unwrap_or_else(default_workers);
    cfg.drop_rate = args.drop_rate;
    cfg.zone = zone;
    cfg.data_dir = (!args.no_persist).then_some(args.data_dir);

    let server = Server::start(cfg)?;
    server.wait();
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::INFO)
        .init();

    let args = Args::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        process::exit(1);
    });

    if let Err(err) = run(args) {
        error!("fatal: {err:#}");
        process::exit(1);
    }
}

mod config;
mod mapping;
mod orchestrator;
mod retry;
mod sink;
mod sink_pg;
mod source;
mod state;
#[cfg(test)]
mod testing;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::orchestrator::{run_daemon, run_once, RunOverrides};

#[derive(Parser, Debug)]
#[command(name = "events-sync")]
#[command(about = "Sync catalog events and their performers from the upstream API into PostgreSQL.")]
struct Cli {
    /// Path to JSON/YAML config file.
    #[arg(long)]
    config: PathBuf,

    /// First page to fetch (overrides sync.start_page).
    #[arg(long, value_name = "PAGE")]
    start_page: Option<u32>,

    /// Last page to fetch (overrides sync.max_pages).
    #[arg(long, value_name = "PAGE")]
    max_pages: Option<u32>,

    /// Run continuously, performing syncs at a fixed interval.
    #[arg(long)]
    daemon: bool,

    /// Interval in seconds between sync runs in daemon mode.
    #[arg(long, value_name = "SECS", default_value_t = 3600)]
    interval_secs: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cfg = Config::from_file(&cli.config)?;
    let overrides = RunOverrides {
        start_page: cli.start_page,
        max_pages: cli.max_pages,
    };

    if cli.daemon {
        run_daemon(&cfg, overrides, cli.interval_secs).await?;
    } else {
        run_once(&cfg, overrides).await?;
    }

    println!("Finished updating `tevo_{}` table", cfg.sync.status_table);
    Ok(())
}

fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

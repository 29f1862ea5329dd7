//! Watch the recordings root and index an agent whenever its files change.

use anyhow::Result;
use callindex::jobs::{run_trigger, IndexContext, TriggerRequest};
use callindex::watch::run_watcher;
use callindex::Config;
use clap::Parser;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "watch")]
#[command(about = "Watch recordings_root for changes and index affected agents")]
struct Args {
    /// Quiet period in milliseconds before a changed path is acted on
    #[arg(long, default_value = "2000")]
    debounce_ms: u64,

    /// Index every agent once before watching
    #[arg(long)]
    initial_scan: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load()?;

    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("RUST_LOG", config.callindex.log_level.as_str()),
    )
    .init();

    log::info!("Starting callindex watcher");
    log::info!("Recordings root: {}", config.recordings_root().display());
    log::info!("Debounce: {} ms", args.debounce_ms);

    let ctx = IndexContext::from_config(&config);
    ctx.db.migrate(config.migrations_dir()).await?;

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    if args.initial_scan {
        let report = run_trigger(&ctx, TriggerRequest::all(), cancel.child_token()).await?;
        log::info!("Initial scan: {:?} ({} agent(s))", report.status, report.agents.len());
    }

    log::info!("Watching for changes (Ctrl+C to stop)");
    run_watcher(ctx, Duration::from_millis(args.debounce_ms), cancel).await?;
    Ok(())
}

//! Run one index pass and print the JSON report. Exit code: 0 success, 2 partial, 1 failure.

use anyhow::{Context, Result};
use callindex::jobs::{run_trigger, AgentSelector, IndexContext, TriggerRequest};
use callindex::Config;
use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "index")]
#[command(about = "Index call recordings into the store (incremental)")]
struct Args {
    /// Only index this agent (default: every agent directory)
    #[arg(short, long)]
    agent: Option<String>,

    /// Re-scan files modified since this date or RFC 3339 time, ignoring the checkpoint
    #[arg(long)]
    since: Option<String>,

    /// Pretty-print the JSON report
    #[arg(long)]
    pretty: bool,
}

fn parse_since(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("--since must be YYYY-MM-DD or RFC 3339, got {:?}", value))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .with_context(|| format!("invalid --since date {:?}", value))?;
    Ok(midnight.and_utc())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load()?;

    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("RUST_LOG", config.callindex.log_level.as_str()),
    )
    .init();

    log::info!("Recordings root: {}", config.recordings_root().display());
    log::info!("Database path: {}", config.db_path().display());

    let ctx = IndexContext::from_config(&config);
    ctx.db.migrate(config.migrations_dir()).await?;

    let request = TriggerRequest {
        agent: match args.agent {
            Some(agent) => AgentSelector::One(agent),
            None => AgentSelector::All,
        },
        since: args.since.as_deref().map(parse_since).transpose()?,
    };

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted: stopping at the next batch boundary");
            signal.cancel();
        }
    });

    let report = run_trigger(&ctx, request, cancel).await?;

    let json = if args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", json);

    std::process::exit(report.exit_code());
}

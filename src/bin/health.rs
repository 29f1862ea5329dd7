//! Print per-agent indexing health: checkpoint age, job state, counts.

use anyhow::Result;
use callindex::db::Db;
use callindex::query::agent_health;
use callindex::Config;
use chrono::Utc;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "health")]
#[command(about = "Show indexing lag and job state per agent")]
struct Args {
    /// Emit JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Flag agents whose last completed run is older than this many minutes
    #[arg(long, default_value = "60")]
    stale_minutes: i64,
}

fn format_lag(seconds: Option<i64>) -> String {
    match seconds {
        None => "never".to_string(),
        Some(s) if s < 120 => format!("{}s", s),
        Some(s) if s < 7200 => format!("{}m", s / 60),
        Some(s) => format!("{}h", s / 3600),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load()?;

    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("RUST_LOG", config.callindex.log_level.as_str()),
    )
    .init();

    let db = Db::new(config.db_path());
    let now = Utc::now();
    let health = db.with_connection(move |conn| agent_health(conn, now)).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&health)?);
        return Ok(());
    }

    println!("\n=== callindex Agent Health ===\n");

    if health.is_empty() {
        println!("No agents indexed yet.");
        println!("\nRun `index` to populate the store.");
        return Ok(());
    }

    println!("{:-<96}", "");
    println!(
        "{:<20} {:>8} {:>10} {:>8} {:>10} {:>11}  {}",
        "Agent", "Lag", "State", "Tries", "Live", "Quarantine", "Last error"
    );
    println!("{:-<96}", "");

    let stale_after = args.stale_minutes * 60;
    let mut attention = 0;
    for agent in &health {
        let state = if agent.stalled {
            "stalled"
        } else {
            agent.job_state.map(|s| s.as_str()).unwrap_or("-")
        };
        let stale = agent.lag_seconds.map_or(true, |s| s > stale_after);
        if stale || agent.stalled || agent.error_class.is_some() {
            attention += 1;
        }
        println!(
            "{:<20} {:>8} {:>10} {:>8} {:>10} {:>11}  {}",
            agent.agent,
            format_lag(agent.lag_seconds),
            state,
            agent.attempts,
            agent.live_recordings,
            agent.quarantined,
            agent.last_error.as_deref().unwrap_or("")
        );
    }
    println!("{:-<96}", "");

    println!("\nAgents: {}", health.len());
    println!("Needing attention (stale > {}m, stalled or failing): {}", args.stale_minutes, attention);
    println!();

    Ok(())
}

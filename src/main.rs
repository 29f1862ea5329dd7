use anyhow::Result;
use callindex::db::{migrate, Db};
use callindex::error::CallIndexError;
use callindex::index::prune_soft_deleted;
use callindex::jobs::IndexContext;
use callindex::server::HttpServer;
use callindex::Config;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "callindex")]
#[command(version, about = "Call recording index: HTTP service and maintenance")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the query, health and index endpoints over HTTP
    Serve {
        /// Override http_server.port from config.toml
        #[arg(long)]
        port: Option<u16>,
    },
    /// Apply migrations and verify the database schema (default)
    Verify,
    /// Hard-delete recordings that were soft-deleted long ago
    Prune {
        /// Only rows soft-deleted more than this many days ago
        #[arg(long)]
        older_than_days: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("RUST_LOG", config.callindex.log_level.as_str()),
    )
    .init();

    let db = Db::new(config.db_path());
    let applied = db.migrate(config.migrations_dir()).await?;
    if applied > 0 {
        log::info!("Applied {} migration(s)", applied);
    }

    match cli.command.unwrap_or(Command::Verify) {
        Command::Serve { port } => run_http_server(&config, port).await?,
        Command::Verify => verify_database_schema(&db).await?,
        Command::Prune { older_than_days } => {
            let cutoff = Utc::now() - Duration::days(i64::from(older_than_days));
            let pruned = db
                .with_connection(move |conn| prune_soft_deleted(conn, cutoff))
                .await?;
            println!("Pruned {} recording(s) soft-deleted before {}", pruned, cutoff);
        }
    }

    Ok(())
}

async fn run_http_server(config: &Config, port: Option<u16>) -> Result<()> {
    log::info!("Starting callindex HTTP server v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Recordings root: {}", config.recordings_root().display());
    log::info!("Database path: {}", config.db_path().display());

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Shutdown requested");
            signal.cancel();
        }
    });

    let server = HttpServer::new(
        IndexContext::from_config(config),
        config.http_server.allowed_origins.clone(),
    );
    server
        .run(port.unwrap_or(config.http_server.port), shutdown)
        .await?;
    Ok(())
}

/// Verify that all expected database objects exist
async fn verify_database_schema(db: &Db) -> Result<()> {
    db.with_connection(|conn| {
        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        let expected_tables = [
            "index_checkpoints",
            "index_jobs",
            "recording_quarantine",
            "recordings",
            "schema_migrations",
        ];
        let mut all_tables_exist = true;
        for table in &expected_tables {
            if tables.iter().any(|t| t == table) {
                log::debug!("✓ Table exists: {}", table);
            } else {
                log::error!("Missing table: {}", table);
                all_tables_exist = false;
            }
        }
        if !all_tables_exist {
            return Err(CallIndexError::Config("Not all required tables exist".to_string()));
        }

        let applied = migrate::get_applied_migrations(conn)?;
        if applied.len() < 2 {
            return Err(CallIndexError::Config(format!(
                "Expected at least 2 migrations, found {}",
                applied.len()
            )));
        }
        log::debug!("✓ {} migrations applied", applied.len());

        let mut stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%' ORDER BY name")?;
        let indexes: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        for index_name in ["idx_recordings_agent_path", "idx_recordings_agent_live_time"] {
            if !indexes.iter().any(|i| i == index_name) {
                return Err(CallIndexError::Config(format!("Missing index: {}", index_name)));
            }
            log::debug!("✓ Index exists: {}", index_name);
        }

        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if journal_mode.to_uppercase() != "WAL" {
            return Err(CallIndexError::Config(format!("Journal mode is not WAL: {}", journal_mode)));
        }
        log::debug!("✓ Journal mode: WAL");

        let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if integrity != "ok" {
            return Err(CallIndexError::Config(format!(
                "Database integrity check failed: {}",
                integrity
            )));
        }
        log::info!("✓ Database integrity: OK");

        Ok(())
    })
    .await?;

    log::info!("✓ Database schema verification complete");
    Ok(())
}

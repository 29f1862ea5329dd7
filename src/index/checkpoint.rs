//! Per-agent traversal checkpoint.
//!
//! The cursor half (`last_path`, `last_mtime_ns`) is advanced inside each
//! committed write batch and never moves backwards. `checkpoint_at` records
//! the wall-clock time of the last fully completed run.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::db::{format_timestamp, parse_timestamp};
use crate::error::Result;

/// Position in the `(mtime, path)` total order of an agent's files.
///
/// Field order matters: the derived `Ord` compares mtime first, then the
/// path byte-wise, which is also how SQLite's BINARY collation orders text.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Cursor {
    pub mtime_ns: i64,
    pub path: String,
}

impl Cursor {
    pub fn new(mtime_ns: i64, path: impl Into<String>) -> Self {
        Self {
            mtime_ns,
            path: path.into(),
        }
    }

    /// Cursor that admits every file modified at or after `ts`.
    pub fn before(ts: &DateTime<Utc>) -> Self {
        Self {
            mtime_ns: ts.timestamp_nanos_opt().unwrap_or(i64::MIN),
            path: String::new(),
        }
    }
}

/// Stored checkpoint row for one agent
#[derive(Debug, Clone, Serialize)]
pub struct Checkpoint {
    pub agent: String,
    pub cursor: Cursor,
    pub checkpoint_at: Option<DateTime<Utc>>,
    pub last_reconcile_at: Option<DateTime<Utc>>,
    pub last_full_reconcile_at: Option<DateTime<Utc>>,
}

fn parse_optional(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}

/// Load the checkpoint for `agent`, if one has been written.
pub fn load_checkpoint(conn: &Connection, agent: &str) -> Result<Option<Checkpoint>> {
    let row = conn
        .query_row(
            "SELECT last_path, last_mtime_ns, checkpoint_at, last_reconcile_at, last_full_reconcile_at
             FROM index_checkpoints WHERE agent = ?1",
            params![agent],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((path, mtime_ns, checkpoint_at, reconcile_at, full_reconcile_at)) = row else {
        return Ok(None);
    };

    Ok(Some(Checkpoint {
        agent: agent.to_string(),
        cursor: Cursor { mtime_ns, path },
        checkpoint_at: parse_optional(checkpoint_at)?,
        last_reconcile_at: parse_optional(reconcile_at)?,
        last_full_reconcile_at: parse_optional(full_reconcile_at)?,
    }))
}

/// Move the cursor forward to `cursor` unless the stored one is already past it.
///
/// Meant to run inside the transaction of the batch the cursor covers.
pub fn advance_cursor(conn: &Connection, agent: &str, cursor: &Cursor) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO index_checkpoints (agent, last_path, last_mtime_ns)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(agent) DO UPDATE SET
            last_path = excluded.last_path,
            last_mtime_ns = excluded.last_mtime_ns
        WHERE excluded.last_mtime_ns > index_checkpoints.last_mtime_ns
           OR (excluded.last_mtime_ns = index_checkpoints.last_mtime_ns
               AND excluded.last_path > index_checkpoints.last_path)
        "#,
        params![agent, cursor.path, cursor.mtime_ns],
    )?;
    Ok(())
}

/// Which reconciliation pass (if any) a completed run performed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMark {
    None,
    Windowed,
    Full,
}

/// Stamp a completed run. Only called after writes and reconciliation succeeded.
pub fn mark_run_complete(
    conn: &Connection,
    agent: &str,
    completed_at: &DateTime<Utc>,
    reconciled: ReconcileMark,
) -> Result<()> {
    let ts = format_timestamp(completed_at);
    let reconcile_at = (reconciled != ReconcileMark::None).then(|| ts.clone());
    let full_at = (reconciled == ReconcileMark::Full).then(|| ts.clone());

    conn.execute(
        r#"
        INSERT INTO index_checkpoints (agent, checkpoint_at, last_reconcile_at, last_full_reconcile_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(agent) DO UPDATE SET
            checkpoint_at = excluded.checkpoint_at,
            last_reconcile_at = COALESCE(excluded.last_reconcile_at, index_checkpoints.last_reconcile_at),
            last_full_reconcile_at = COALESCE(excluded.last_full_reconcile_at, index_checkpoints.last_full_reconcile_at)
        "#,
        params![agent, ts, reconcile_at, full_at],
    )?;
    Ok(())
}

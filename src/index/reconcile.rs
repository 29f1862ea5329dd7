//! Soft-delete reconciliation: store rows whose file is gone from the walk.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::Serialize;

use super::checkpoint::{mark_run_complete, Checkpoint, ReconcileMark};
use super::walker::WalkOutcome;
use super::writer::Fence;
use super::ReconcilePolicy;
use crate::db::{format_recorded_at, format_timestamp};
use crate::error::Result;
use crate::jobs::renew_lease;

/// Which live rows a reconciliation pass may soft-delete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconcileScope {
    Full,
    /// Rows whose `recorded_at` is at or after `since`.
    Window { since: NaiveDateTime },
}

/// Decide whether this run reconciles, and how widely.
///
/// No pass happens if the last one was less than `interval` ago. A full pass
/// happens when none has ever run or `full_interval` has elapsed since the
/// last one; otherwise the pass is windowed to the last `window` of
/// recordings.
pub fn plan_scope(
    policy: &ReconcilePolicy,
    checkpoint: Option<&Checkpoint>,
    now: DateTime<Utc>,
) -> Option<ReconcileScope> {
    let last_any = checkpoint.and_then(|c| c.last_reconcile_at);
    let last_full = checkpoint.and_then(|c| c.last_full_reconcile_at);

    if let Some(last) = last_any {
        if now - last < policy.interval {
            return None;
        }
    }

    match last_full {
        Some(last) if now - last < policy.full_interval => Some(ReconcileScope::Window {
            since: (now - policy.window).naive_utc(),
        }),
        _ => Some(ReconcileScope::Full),
    }
}

fn agent_paths(conn: &Connection, sql: &str, agent: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![agent], |row| row.get::<_, String>(0))?;
    let mut paths = Vec::new();
    for row in rows {
        paths.push(row?);
    }
    Ok(paths)
}

/// Live rows in `scope` whose file is neither in the listing nor under an
/// unreadable prefix.
pub fn find_missing(
    conn: &Connection,
    agent: &str,
    walk: &WalkOutcome,
    scope: ReconcileScope,
) -> Result<Vec<String>> {
    let since = match scope {
        ReconcileScope::Full => None,
        ReconcileScope::Window { since } => Some(format_recorded_at(&since)),
    };

    let mut stmt = conn.prepare(
        "SELECT path FROM recordings
         WHERE agent = ?1 AND deleted_at IS NULL
           AND (?2 IS NULL OR recorded_at >= ?2)
         ORDER BY path",
    )?;
    let rows = stmt.query_map(params![agent, since], |row| row.get::<_, String>(0))?;

    let mut missing = Vec::new();
    for row in rows {
        let path = row?;
        if !walk.listing.contains_key(&path) && !walk.is_unreadable(&path) {
            missing.push(path);
        }
    }
    Ok(missing)
}

/// Soft-delete `paths` in transactions of at most `batch_size` rows, each
/// fenced by the job lease. Returns the number of rows marked.
pub fn soft_delete(
    conn: &mut Connection,
    fence: Fence<'_>,
    paths: &[String],
    batch_size: usize,
    now: DateTime<Utc>,
) -> Result<usize> {
    let now_s = format_timestamp(&now);
    let mut marked = 0;

    for chunk in paths.chunks(batch_size.max(1)) {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        renew_lease(&tx, fence.agent, fence.holder, now, fence.policy)?;
        {
            let mut stmt = tx.prepare(
                "UPDATE recordings SET deleted_at = ?3, updated_at = ?3
                 WHERE agent = ?1 AND path = ?2 AND deleted_at IS NULL",
            )?;
            for path in chunk {
                marked += stmt.execute(params![fence.agent, path, now_s])?;
            }
        }
        tx.commit()?;
    }

    if marked > 0 {
        log::info!("Soft-deleted {} recording(s) for agent {}", marked, fence.agent);
    }
    Ok(marked)
}

/// What one reconciliation pass changed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileCounts {
    pub soft_deleted: usize,
    pub quarantine_purged: usize,
}

/// Close a run under its claim.
///
/// With a scope, live rows in it that the walk no longer lists are
/// soft-deleted in fenced chunks. Then one fenced transaction drops quarantine
/// entries for vanished files (on reconciling runs) and stamps the checkpoint.
/// A lost claim leaves `checkpoint_at` and the reconcile marks untouched.
pub fn reconcile_deletions(
    conn: &mut Connection,
    fence: Fence<'_>,
    walk: &WalkOutcome,
    scope: Option<ReconcileScope>,
    batch_size: usize,
    now: DateTime<Utc>,
) -> Result<ReconcileCounts> {
    let soft_deleted = match scope {
        Some(scope) => {
            let missing = find_missing(conn, fence.agent, walk, scope)?;
            soft_delete(conn, fence, &missing, batch_size, now)?
        }
        None => 0,
    };

    let mark = match scope {
        Some(ReconcileScope::Full) => ReconcileMark::Full,
        Some(ReconcileScope::Window { .. }) => ReconcileMark::Windowed,
        None => ReconcileMark::None,
    };

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    renew_lease(&tx, fence.agent, fence.holder, now, fence.policy)?;
    let quarantine_purged = if scope.is_some() {
        purge_vanished_quarantine(&tx, fence.agent, walk)?
    } else {
        0
    };
    mark_run_complete(&tx, fence.agent, &now, mark)?;
    tx.commit()?;

    Ok(ReconcileCounts {
        soft_deleted,
        quarantine_purged,
    })
}

/// Soft-deleted rows whose file is present again.
pub fn find_revivals(conn: &Connection, agent: &str, walk: &WalkOutcome) -> Result<Vec<String>> {
    let deleted = agent_paths(
        conn,
        "SELECT path FROM recordings WHERE agent = ?1 AND deleted_at IS NOT NULL",
        agent,
    )?;
    Ok(deleted
        .into_iter()
        .filter(|p| walk.listing.contains_key(p))
        .collect())
}

/// Listed files with neither a recording row nor a quarantine entry.
///
/// These are files the cursor skipped, typically copied in with an old mtime.
pub fn find_unindexed(conn: &Connection, agent: &str, walk: &WalkOutcome) -> Result<Vec<String>> {
    let mut known: HashSet<String> = agent_paths(
        conn,
        "SELECT path FROM recordings WHERE agent = ?1",
        agent,
    )?
    .into_iter()
    .collect();
    known.extend(agent_paths(
        conn,
        "SELECT path FROM recording_quarantine WHERE agent = ?1",
        agent,
    )?);

    let mut unindexed: Vec<String> = walk
        .listing
        .keys()
        .filter(|p| !known.contains(*p))
        .cloned()
        .collect();
    unindexed.sort();
    Ok(unindexed)
}

/// Drop quarantine entries whose file is no longer listed.
pub fn purge_vanished_quarantine(conn: &Connection, agent: &str, walk: &WalkOutcome) -> Result<usize> {
    let quarantined = agent_paths(
        conn,
        "SELECT path FROM recording_quarantine WHERE agent = ?1",
        agent,
    )?;

    let mut removed = 0;
    for path in quarantined {
        if walk.listing.contains_key(&path) || walk.is_unreadable(&path) {
            continue;
        }
        removed += conn.execute(
            "DELETE FROM recording_quarantine WHERE agent = ?1 AND path = ?2",
            params![agent, path],
        )?;
    }
    Ok(removed)
}

/// Hard-delete rows soft-deleted before `older_than`. Maintenance only.
pub fn prune_soft_deleted(conn: &Connection, older_than: DateTime<Utc>) -> Result<usize> {
    let pruned = conn.execute(
        "DELETE FROM recordings WHERE deleted_at IS NOT NULL AND deleted_at < ?1",
        params![format_timestamp(&older_than)],
    )?;
    log::info!("Pruned {} soft-deleted recording(s)", pruned);
    Ok(pruned)
}

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::Result;
use crate::index::{load_checkpoint, Cursor};
use crate::jobs::{load_job, JobState};

/// Indexing state of one agent, for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct AgentHealth {
    pub agent: String,
    /// Last fully completed run.
    pub checkpoint_at: Option<DateTime<Utc>>,
    pub last_reconcile_at: Option<DateTime<Utc>>,
    pub last_full_reconcile_at: Option<DateTime<Utc>>,
    pub cursor: Option<Cursor>,
    pub job_state: Option<JobState>,
    pub attempts: u32,
    pub holder: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_class: Option<String>,
    pub live_recordings: i64,
    pub quarantined: i64,
    /// Seconds since `checkpoint_at`; None if no run has completed.
    pub lag_seconds: Option<i64>,
    /// Running with an expired lease: the holder most likely died.
    pub stalled: bool,
}

/// Health of every agent known to the store, ordered by name.
pub fn agent_health(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<AgentHealth>> {
    let agents: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT agent FROM index_checkpoints
             UNION SELECT agent FROM index_jobs
             UNION SELECT DISTINCT agent FROM recordings
             ORDER BY agent",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()?
    };

    let mut report = Vec::with_capacity(agents.len());
    for agent in agents {
        let checkpoint = load_checkpoint(conn, &agent)?;
        let job = load_job(conn, &agent)?;

        let live_recordings: i64 = conn.query_row(
            "SELECT COUNT(*) FROM recordings WHERE agent = ?1 AND deleted_at IS NULL",
            params![agent],
            |row| row.get(0),
        )?;
        let quarantined: i64 = conn.query_row(
            "SELECT COUNT(*) FROM recording_quarantine WHERE agent = ?1",
            params![agent],
            |row| row.get(0),
        )?;

        let checkpoint_at = checkpoint.as_ref().and_then(|c| c.checkpoint_at);
        let stalled = job.as_ref().is_some_and(|j| {
            j.state == JobState::Running && j.lease_expires_at.map_or(true, |at| at <= now)
        });

        report.push(AgentHealth {
            checkpoint_at,
            last_reconcile_at: checkpoint.as_ref().and_then(|c| c.last_reconcile_at),
            last_full_reconcile_at: checkpoint.as_ref().and_then(|c| c.last_full_reconcile_at),
            cursor: checkpoint.map(|c| c.cursor),
            job_state: job.as_ref().map(|j| j.state),
            attempts: job.as_ref().map_or(0, |j| j.attempts),
            holder: job.as_ref().and_then(|j| j.holder.clone()),
            lease_expires_at: job.as_ref().and_then(|j| j.lease_expires_at),
            next_retry_at: job.as_ref().and_then(|j| j.next_retry_at),
            last_error: job.as_ref().and_then(|j| j.last_error.clone()),
            error_class: job.and_then(|j| j.error_class),
            live_recordings,
            quarantined,
            lag_seconds: checkpoint_at.map(|at| (now - at).num_seconds()),
            stalled,
            agent,
        });
    }
    Ok(report)
}

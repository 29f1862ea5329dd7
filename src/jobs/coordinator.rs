//! Per-agent job claims.
//!
//! State machine: `idle -> running -> idle | failed`, `failed -> idle` once
//! the backoff has elapsed. A claim is held by a `holder` id until its
//! lease expires; an expired running claim can be taken over. Every state
//! change is guarded by the holder id, so a run that lost its claim cannot
//! complete, fail or write on behalf of the new holder.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;

use crate::db::{format_timestamp, parse_timestamp};
use crate::error::{CallIndexError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "idle" => Ok(JobState::Idle),
            "running" => Ok(JobState::Running),
            "failed" => Ok(JobState::Failed),
            other => Err(CallIndexError::Parse(format!("unknown job state {:?}", other))),
        }
    }
}

/// Error taxonomy surfaced on the job row and in trigger reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Filesystem,
    Store,
    LeaseLost,
    /// A previous holder stopped renewing and its claim was recovered.
    LeaseExpired,
    Config,
    Internal,
}

impl ErrorClass {
    pub fn of(err: &CallIndexError) -> Self {
        match err {
            CallIndexError::Io(_) => ErrorClass::Filesystem,
            CallIndexError::Database(_) => ErrorClass::Store,
            CallIndexError::LeaseLost { .. } => ErrorClass::LeaseLost,
            CallIndexError::Config(_) | CallIndexError::InvalidInput(_) => ErrorClass::Config,
            CallIndexError::Parse(_) | CallIndexError::Probe(_) | CallIndexError::Join(_) => {
                ErrorClass::Internal
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Filesystem => "filesystem",
            ErrorClass::Store => "store",
            ErrorClass::LeaseLost => "lease_lost",
            ErrorClass::LeaseExpired => "lease_expired",
            ErrorClass::Config => "config",
            ErrorClass::Internal => "internal",
        }
    }
}

/// Lease length and retry backoff
#[derive(Debug, Clone)]
pub struct LeasePolicy {
    pub lease: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            lease: Duration::minutes(30),
            backoff_base: Duration::minutes(1),
            backoff_cap: Duration::hours(1),
        }
    }
}

impl LeasePolicy {
    /// Exponential backoff after the `attempts`-th consecutive failure.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(30);
        self.backoff_base
            .checked_mul(1i32 << shift)
            .map_or(self.backoff_cap, |d| d.min(self.backoff_cap))
    }
}

/// Result of trying to claim an agent
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed,
    /// The previous holder's lease had expired; its claim was taken over.
    Recovered {
        previous_holder: Option<String>,
        expired_at: DateTime<Utc>,
    },
    /// Another run holds a live claim. Not an error.
    Conflict {
        holder: Option<String>,
        lease_expires_at: Option<DateTime<Utc>>,
    },
    /// The last run failed and its backoff has not elapsed.
    BackingOff { next_retry_at: DateTime<Utc> },
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed | ClaimOutcome::Recovered { .. })
    }
}

/// Stored job row
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub agent: String,
    pub state: JobState,
    pub attempts: u32,
    pub holder: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_class: Option<String>,
}

fn opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}

const JOB_COLUMNS: &str = "agent, state, attempts, holder, claimed_at, lease_expires_at, \
                           next_retry_at, last_error, error_class";

type RawJob = (
    String,
    String,
    u32,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn raw_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawJob> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn into_record(raw: RawJob) -> Result<JobRecord> {
    let (agent, state, attempts, holder, claimed_at, lease, retry, last_error, error_class) = raw;
    Ok(JobRecord {
        agent,
        state: JobState::parse(&state)?,
        attempts,
        holder,
        claimed_at: opt_ts(claimed_at)?,
        lease_expires_at: opt_ts(lease)?,
        next_retry_at: opt_ts(retry)?,
        last_error,
        error_class,
    })
}

pub fn load_job(conn: &Connection, agent: &str) -> Result<Option<JobRecord>> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM index_jobs WHERE agent = ?1", JOB_COLUMNS),
            params![agent],
            raw_job,
        )
        .optional()?;
    raw.map(into_record).transpose()
}

pub fn list_jobs(conn: &Connection) -> Result<Vec<JobRecord>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM index_jobs ORDER BY agent", JOB_COLUMNS))?;
    let raws = stmt
        .query_map([], raw_job)?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    raws.into_iter().map(into_record).collect()
}

/// Try to claim `agent` for `holder`.
///
/// Runs in a `BEGIN IMMEDIATE` transaction so two coordinators racing for
/// the same agent are serialized by SQLite's write lock; the loser sees the
/// winner's row and gets [`ClaimOutcome::Conflict`] without waiting for the
/// run itself.
pub fn claim(
    conn: &mut Connection,
    agent: &str,
    holder: &str,
    now: DateTime<Utc>,
    policy: &LeasePolicy,
) -> Result<ClaimOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let existing = load_job(&tx, agent)?;
    let now_s = format_timestamp(&now);
    let lease_s = format_timestamp(&(now + policy.lease));

    let outcome = match &existing {
        None => ClaimOutcome::Claimed,
        Some(job) => match job.state {
            JobState::Idle => ClaimOutcome::Claimed,
            JobState::Failed => match job.next_retry_at {
                Some(retry_at) if retry_at > now => ClaimOutcome::BackingOff {
                    next_retry_at: retry_at,
                },
                _ => ClaimOutcome::Claimed,
            },
            JobState::Running => match job.lease_expires_at {
                Some(expires) if expires > now => ClaimOutcome::Conflict {
                    holder: job.holder.clone(),
                    lease_expires_at: Some(expires),
                },
                expired => ClaimOutcome::Recovered {
                    previous_holder: job.holder.clone(),
                    expired_at: expired.unwrap_or(now),
                },
            },
        },
    };

    match &outcome {
        ClaimOutcome::Claimed => {
            tx.execute(
                r#"
                INSERT INTO index_jobs (agent, state, attempts, holder, claimed_at, lease_expires_at, updated_at)
                VALUES (?1, 'running', 0, ?2, ?3, ?4, ?3)
                ON CONFLICT(agent) DO UPDATE SET
                    state = 'running',
                    holder = excluded.holder,
                    claimed_at = excluded.claimed_at,
                    lease_expires_at = excluded.lease_expires_at,
                    next_retry_at = NULL,
                    updated_at = excluded.updated_at
                "#,
                params![agent, holder, now_s, lease_s],
            )?;
        }
        ClaimOutcome::Recovered { previous_holder, .. } => {
            // The crashed run counts as a failed attempt.
            tx.execute(
                r#"
                UPDATE index_jobs SET
                    state = 'running',
                    attempts = attempts + 1,
                    holder = ?2,
                    claimed_at = ?3,
                    lease_expires_at = ?4,
                    next_retry_at = NULL,
                    last_error = ?5,
                    error_class = ?6,
                    updated_at = ?3
                WHERE agent = ?1
                "#,
                params![
                    agent,
                    holder,
                    now_s,
                    lease_s,
                    format!("lease expired (holder {})", previous_holder.as_deref().unwrap_or("unknown")),
                    ErrorClass::LeaseExpired.as_str(),
                ],
            )?;
        }
        ClaimOutcome::Conflict { .. } | ClaimOutcome::BackingOff { .. } => {}
    }

    tx.commit()?;
    Ok(outcome)
}

fn lease_lost(agent: &str, holder: &str) -> CallIndexError {
    CallIndexError::LeaseLost {
        agent: agent.to_string(),
        reason: format!("claim no longer held by {}", holder),
    }
}

/// Extend the lease of a held claim. Used as the per-batch fence: call it
/// inside the batch transaction so a lost claim rolls the batch back.
pub fn renew_lease(
    conn: &Connection,
    agent: &str,
    holder: &str,
    now: DateTime<Utc>,
    policy: &LeasePolicy,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE index_jobs SET lease_expires_at = ?3, updated_at = ?4
         WHERE agent = ?1 AND holder = ?2 AND state = 'running'",
        params![
            agent,
            holder,
            format_timestamp(&(now + policy.lease)),
            format_timestamp(&now)
        ],
    )?;
    if changed == 0 {
        return Err(lease_lost(agent, holder));
    }
    Ok(())
}

/// `running -> idle` after a successful (or cleanly stopped) run.
pub fn complete(conn: &Connection, agent: &str, holder: &str, now: DateTime<Utc>) -> Result<()> {
    let changed = conn.execute(
        r#"
        UPDATE index_jobs SET
            state = 'idle',
            attempts = 0,
            holder = NULL,
            lease_expires_at = NULL,
            next_retry_at = NULL,
            last_error = NULL,
            error_class = NULL,
            updated_at = ?3
        WHERE agent = ?1 AND holder = ?2 AND state = 'running'
        "#,
        params![agent, holder, format_timestamp(&now)],
    )?;
    if changed == 0 {
        return Err(lease_lost(agent, holder));
    }
    Ok(())
}

/// `running -> failed`, scheduling the next retry. Returns the retry time.
pub fn fail(
    conn: &Connection,
    agent: &str,
    holder: &str,
    class: ErrorClass,
    message: &str,
    now: DateTime<Utc>,
    policy: &LeasePolicy,
) -> Result<DateTime<Utc>> {
    let attempts: u32 = conn
        .query_row(
            "SELECT attempts FROM index_jobs WHERE agent = ?1 AND holder = ?2 AND state = 'running'",
            params![agent, holder],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| lease_lost(agent, holder))?;

    let attempts = attempts + 1;
    let next_retry_at = now + policy.backoff(attempts);

    conn.execute(
        r#"
        UPDATE index_jobs SET
            state = 'failed',
            attempts = ?3,
            holder = NULL,
            lease_expires_at = NULL,
            next_retry_at = ?4,
            last_error = ?5,
            error_class = ?6,
            updated_at = ?7
        WHERE agent = ?1 AND holder = ?2 AND state = 'running'
        "#,
        params![
            agent,
            holder,
            attempts,
            format_timestamp(&next_retry_at),
            message,
            class.as_str(),
            format_timestamp(&now),
        ],
    )?;
    Ok(next_retry_at)
}

/// `failed -> idle` for every job whose backoff has elapsed.
pub fn release_due_retries(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    let now_s = format_timestamp(&now);
    let released = conn.execute(
        "UPDATE index_jobs SET state = 'idle', next_retry_at = NULL, updated_at = ?1
         WHERE state = 'failed' AND (next_retry_at IS NULL OR next_retry_at <= ?1)",
        params![now_s],
    )?;
    if released > 0 {
        log::info!("Released {} failed job(s) for retry", released);
    }
    Ok(released)
}

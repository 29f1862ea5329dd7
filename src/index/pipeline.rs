//! One agent run: walk, parse, write in batches, reconcile, stamp checkpoint.
//!
//! The caller holds the agent's claim for the whole run. Batches are fenced
//! by that claim; a run stopped by cancellation or timeout keeps what it
//! committed and leaves `checkpoint_at` untouched.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::checkpoint::{load_checkpoint, Cursor};
use super::filename::parse_filename;
use super::probe::duration_or_none;
use super::reconcile::{find_revivals, find_unindexed, plan_scope, reconcile_deletions, ReconcileScope};
use super::walker::{walk_agent, FileMetadata, WalkOutcome};
use super::writer::{write_batch, BatchCounts, Fence, PreparedFile};
use super::PipelineSettings;
use crate::db::Db;
use crate::error::{CallIndexError, Result};
use crate::jobs::LeasePolicy;

/// Per-agent run counters, as reported by the trigger
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub soft_deleted: usize,
    pub quarantined: usize,
    /// Files or directories skipped because they vanished or could not be read.
    pub errored: usize,
    /// Candidates left unwritten when the run stopped early.
    pub remaining: usize,
}

impl IndexCounts {
    fn add_batch(&mut self, batch: BatchCounts) {
        self.inserted += batch.inserted;
        self.updated += batch.updated;
        self.unchanged += batch.unchanged;
        self.quarantined += batch.quarantined;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEnd {
    Completed,
    Stopped(StopReason),
}

/// What one agent run did
#[derive(Debug, Clone, Serialize)]
pub struct AgentRun {
    pub counts: IndexCounts,
    pub end: RunEnd,
    pub reconciled: Option<ReconcileScope>,
}

/// A run that stopped on an error
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct FailedRun {
    /// Work committed before the error.
    pub counts: IndexCounts,
    pub error: CallIndexError,
}

/// Build a playback URL as `<base>/<agent>/<path segments>`, percent-encoded.
pub fn playback_url(base: &Url, agent: &str, relative_path: &str) -> Option<String> {
    let mut url = base.clone();
    {
        let mut segments = url.path_segments_mut().ok()?;
        segments.pop_if_empty();
        segments.push(agent);
        segments.extend(relative_path.split('/'));
    }
    Some(url.to_string())
}

fn prepare_batch(
    files: Vec<FileMetadata>,
    agent: &str,
    probe: bool,
    base: Option<&Url>,
) -> Vec<PreparedFile> {
    files
        .into_iter()
        .map(|file| {
            let parsed = parse_filename(&file.file_name);
            let duration_ms = if probe && parsed.is_ok() {
                duration_or_none(&file.absolute_path, &file.extension)
            } else {
                None
            };
            let playback_url = base.and_then(|b| playback_url(b, agent, &file.relative_path));
            PreparedFile {
                file,
                parsed,
                duration_ms,
                playback_url,
            }
        })
        .collect()
}

/// Where the walk starts: `since` if given, otherwise the stored cursor
/// pulled back by the configured slack.
fn start_cursor(
    stored: Option<&Cursor>,
    since: Option<DateTime<Utc>>,
    slack: chrono::Duration,
) -> Option<Cursor> {
    if let Some(since) = since {
        return Some(Cursor::before(&since));
    }
    let stored = stored?;
    if slack <= chrono::Duration::zero() {
        return Some(stored.clone());
    }
    let slack_ns = slack.num_nanoseconds().unwrap_or(i64::MAX);
    Some(Cursor::new(stored.mtime_ns.saturating_sub(slack_ns), ""))
}

/// Add listing entries for `paths` to the candidates, keeping the sort order.
fn merge_candidates(walk: &mut WalkOutcome, paths: Vec<String>) -> usize {
    let present: HashSet<String> = walk
        .candidates
        .iter()
        .map(|f| f.relative_path.clone())
        .collect();
    let mut added = 0;
    for path in paths {
        if present.contains(&path) {
            continue;
        }
        if let Some(file) = walk.listing.get(&path) {
            walk.candidates.push(file.clone());
            added += 1;
        }
    }
    if added > 0 {
        walk.candidates.sort_by_key(|f| f.key());
    }
    added
}

fn stop_reason(cancel: &CancellationToken, deadline: Instant) -> Option<StopReason> {
    if cancel.is_cancelled() {
        Some(StopReason::Cancelled)
    } else if Instant::now() >= deadline {
        Some(StopReason::TimedOut)
    } else {
        None
    }
}

async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CallIndexError::Join(e.to_string()))
}

/// Index one agent directory under an already-held claim.
///
/// On failure the counts of batches already committed come back with the
/// error.
#[allow(clippy::too_many_arguments)]
pub async fn run_agent_pipeline(
    db: &Db,
    agent_dir: &Path,
    agent: &str,
    holder: &str,
    settings: &PipelineSettings,
    lease: &LeasePolicy,
    since: Option<DateTime<Utc>>,
    cancel: &CancellationToken,
) -> std::result::Result<AgentRun, FailedRun> {
    let mut counts = IndexCounts::default();
    match index_agent(db, agent_dir, agent, holder, settings, lease, since, cancel, &mut counts).await {
        Ok((end, reconciled)) => Ok(AgentRun {
            counts,
            end,
            reconciled,
        }),
        Err(error) => Err(FailedRun { counts, error }),
    }
}

#[allow(clippy::too_many_arguments)]
async fn index_agent(
    db: &Db,
    agent_dir: &Path,
    agent: &str,
    holder: &str,
    settings: &PipelineSettings,
    lease: &LeasePolicy,
    since: Option<DateTime<Utc>>,
    cancel: &CancellationToken,
    counts: &mut IndexCounts,
) -> Result<(RunEnd, Option<ReconcileScope>)> {
    let deadline = Instant::now() + settings.job_timeout;
    let run_started = Utc::now();

    let checkpoint = {
        let agent = agent.to_string();
        db.with_connection(move |conn| load_checkpoint(conn, &agent)).await?
    };

    let after = start_cursor(
        checkpoint.as_ref().map(|c| &c.cursor),
        since,
        settings.mtime_slack,
    );

    let mut walk = {
        let dir: PathBuf = agent_dir.to_path_buf();
        let extensions = settings.extensions.clone();
        blocking(move || walk_agent(&dir, after.as_ref(), &extensions)).await??
    };

    let scope = plan_scope(&settings.reconcile, checkpoint.as_ref(), run_started);

    // Revivals always; files the cursor never saw only on full passes.
    let extra = {
        let agent = agent.to_string();
        let full = scope == Some(ReconcileScope::Full);
        let listing_only = WalkOutcome {
            listing: walk.listing.clone(),
            unreadable: walk.unreadable.clone(),
            ..Default::default()
        };
        db.with_connection(move |conn| {
            let mut paths = find_revivals(conn, &agent, &listing_only)?;
            if full {
                paths.extend(find_unindexed(conn, &agent, &listing_only)?);
            }
            Ok(paths)
        })
        .await?
    };
    let added = merge_candidates(&mut walk, extra);
    if added > 0 {
        log::info!("Agent {}: {} extra candidate(s) outside the cursor window", agent, added);
    }

    counts.errored = walk.transient_skips + walk.unreadable.len();

    let total = walk.candidates.len();
    log::info!(
        "Agent {}: {} candidate(s) of {} file(s) listed",
        agent,
        total,
        walk.listing.len()
    );

    let candidates = std::mem::take(&mut walk.candidates);
    let mut processed = 0;
    for chunk in candidates.chunks(settings.batch_size.max(1)) {
        if let Some(reason) = stop_reason(cancel, deadline) {
            counts.remaining = total - processed;
            log::warn!(
                "Agent {}: stopping early ({:?}), {} candidate(s) remaining",
                agent,
                reason,
                counts.remaining
            );
            return Ok((RunEnd::Stopped(reason), None));
        }

        let prepared = {
            let files = chunk.to_vec();
            let agent = agent.to_string();
            let probe = settings.probe_duration;
            let base = settings.playback_base_url.clone();
            blocking(move || prepare_batch(files, &agent, probe, base.as_ref())).await?
        };

        let batch_counts = {
            let agent = agent.to_string();
            let holder = holder.to_string();
            let lease = lease.clone();
            db.with_connection(move |conn| {
                let fence = Fence {
                    agent: &agent,
                    holder: &holder,
                    policy: &lease,
                };
                write_batch(conn, fence, &prepared, Utc::now())
            })
            .await?
        };

        processed += chunk.len();
        counts.add_batch(batch_counts);
        log::debug!(
            "Agent {}: batch committed ({}/{}), {:?}",
            agent,
            processed,
            total,
            batch_counts
        );
    }

    if let Some(reason) = stop_reason(cancel, deadline) {
        log::warn!("Agent {}: stopping before reconciliation ({:?})", agent, reason);
        return Ok((RunEnd::Stopped(reason), None));
    }

    let reconciled = {
        let agent = agent.to_string();
        let holder = holder.to_string();
        let lease = lease.clone();
        let batch_size = settings.batch_size;
        db.with_connection(move |conn| {
            let fence = Fence {
                agent: &agent,
                holder: &holder,
                policy: &lease,
            };
            reconcile_deletions(conn, fence, &walk, scope, batch_size, Utc::now())
        })
        .await?
    };
    counts.soft_deleted = reconciled.soft_deleted;
    if reconciled.quarantine_purged > 0 {
        log::debug!(
            "Agent {}: removed {} stale quarantine entries",
            agent,
            reconciled.quarantine_purged
        );
    }

    log::info!(
        "Agent {}: inserted {}, updated {}, unchanged {}, soft-deleted {}, quarantined {}, errored {}",
        agent,
        counts.inserted,
        counts.updated,
        counts.unchanged,
        counts.soft_deleted,
        counts.quarantined,
        counts.errored
    );

    Ok((RunEnd::Completed, scope))
}

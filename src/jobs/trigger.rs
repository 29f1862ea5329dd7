//! Run indexing for one agent or all of them and summarize the outcome.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::coordinator::{claim, complete, fail, release_due_retries, ClaimOutcome, ErrorClass, LeasePolicy};
use crate::config::Config;
use crate::db::Db;
use crate::error::{CallIndexError, Result};
use crate::index::{run_agent_pipeline, FailedRun, IndexCounts, PipelineSettings, RunEnd, StopReason};

/// Shared state for trigger runs
#[derive(Debug, Clone)]
pub struct IndexContext {
    pub db: Db,
    pub recordings_root: PathBuf,
    pub settings: PipelineSettings,
    pub lease_policy: LeasePolicy,
    pub workers: usize,
}

impl IndexContext {
    pub fn from_config(config: &Config) -> Self {
        Self {
            db: Db::new(config.db_path()),
            recordings_root: config.recordings_root().to_path_buf(),
            settings: config.pipeline_settings(),
            lease_policy: config.lease_policy(),
            workers: config.indexing.workers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentSelector {
    All,
    One(String),
}

#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub agent: AgentSelector,
    /// Re-scan files modified at or after this instant regardless of the cursor.
    pub since: Option<DateTime<Utc>>,
}

impl TriggerRequest {
    pub fn all() -> Self {
        Self {
            agent: AgentSelector::All,
            since: None,
        }
    }

    pub fn one(agent: impl Into<String>) -> Self {
        Self {
            agent: AgentSelector::One(agent.into()),
            since: None,
        }
    }
}

/// Why an agent was not run. Neither case is a failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    Conflict {
        holder: Option<String>,
        lease_expires_at: Option<DateTime<Utc>>,
    },
    BackingOff {
        next_retry_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AgentOutcome {
    Completed,
    /// Stopped at a batch boundary; committed batches are kept.
    Incomplete { reason: StopReason },
    Skipped { reason: SkipReason },
    Failed {
        error_class: ErrorClass,
        message: String,
        next_retry_at: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentReport {
    pub agent: String,
    #[serde(flatten)]
    pub outcome: AgentOutcome,
    pub counts: IndexCounts,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Success,
    Partial,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerReport {
    pub status: TriggerStatus,
    pub started_at: DateTime<Utc>,
    pub agents: Vec<AgentReport>,
    pub duration_ms: u64,
}

impl TriggerReport {
    /// Process exit code for CLI use: 0 success, 2 partial, 1 failure.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            TriggerStatus::Success => 0,
            TriggerStatus::Partial => 2,
            TriggerStatus::Failure => 1,
        }
    }

    fn status_of(agents: &[AgentReport]) -> TriggerStatus {
        let attempted = agents
            .iter()
            .filter(|a| !matches!(a.outcome, AgentOutcome::Skipped { .. }))
            .count();
        let failed = agents
            .iter()
            .filter(|a| matches!(a.outcome, AgentOutcome::Failed { .. }))
            .count();

        if failed == 0 {
            TriggerStatus::Success
        } else if failed == attempted {
            TriggerStatus::Failure
        } else {
            TriggerStatus::Partial
        }
    }
}

/// Reject names that could escape the recordings root or are not agent dirs.
pub fn validate_agent_name(agent: &str) -> Result<()> {
    if agent.is_empty()
        || agent.starts_with('.')
        || agent.contains('/')
        || agent.contains('\\')
        || agent.contains('\0')
    {
        return Err(CallIndexError::InvalidInput(format!("invalid agent name: {:?}", agent)));
    }
    Ok(())
}

/// Every top-level directory of `root` is an agent. Hidden entries,
/// symlinks and non UTF-8 names are ignored.
pub fn discover_agents(root: &Path) -> Result<Vec<String>> {
    let mut agents = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            log::warn!("Ignoring agent directory with non UTF-8 name: {:?}", entry.path());
            continue;
        };
        if validate_agent_name(&name).is_ok() {
            agents.push(name);
        }
    }
    agents.sort();
    Ok(agents)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

async fn run_agent(
    ctx: &IndexContext,
    agent: String,
    since: Option<DateTime<Utc>>,
    cancel: CancellationToken,
) -> AgentReport {
    let started = Instant::now();
    let holder = Uuid::new_v4().to_string();

    let failed = |class: ErrorClass, message: String, next_retry_at: Option<DateTime<Utc>>| {
        AgentOutcome::Failed {
            error_class: class,
            message,
            next_retry_at,
        }
    };

    let claimed = {
        let agent = agent.clone();
        let holder = holder.clone();
        let lease = ctx.lease_policy.clone();
        ctx.db
            .with_connection(move |conn| claim(conn, &agent, &holder, Utc::now(), &lease))
            .await
    };

    let outcome = match claimed {
        Err(e) => {
            log::error!("Agent {}: claim failed: {}", agent, e);
            Some(failed(ErrorClass::of(&e), e.to_string(), None))
        }
        Ok(ClaimOutcome::Conflict {
            holder: other,
            lease_expires_at,
        }) => {
            log::info!("Agent {}: already running under {:?}, skipping", agent, other);
            Some(AgentOutcome::Skipped {
                reason: SkipReason::Conflict {
                    holder: other,
                    lease_expires_at,
                },
            })
        }
        Ok(ClaimOutcome::BackingOff { next_retry_at }) => {
            log::info!("Agent {}: backing off until {}", agent, next_retry_at);
            Some(AgentOutcome::Skipped {
                reason: SkipReason::BackingOff { next_retry_at },
            })
        }
        Ok(ClaimOutcome::Recovered {
            previous_holder,
            expired_at,
        }) => {
            log::warn!(
                "Agent {}: recovered claim from {:?} (lease expired at {})",
                agent,
                previous_holder,
                expired_at
            );
            None
        }
        Ok(ClaimOutcome::Claimed) => None,
    };

    if let Some(outcome) = outcome {
        return AgentReport {
            agent,
            outcome,
            counts: IndexCounts::default(),
            duration_ms: elapsed_ms(started),
        };
    }

    let agent_dir = ctx.recordings_root.join(&agent);
    let result = run_agent_pipeline(
        &ctx.db,
        &agent_dir,
        &agent,
        &holder,
        &ctx.settings,
        &ctx.lease_policy,
        since,
        &cancel,
    )
    .await;

    let (outcome, counts) = match result {
        Ok(run) => {
            let released = {
                let agent = agent.clone();
                let holder = holder.clone();
                ctx.db
                    .with_connection(move |conn| complete(conn, &agent, &holder, Utc::now()))
                    .await
            };
            let outcome = match (released, run.end) {
                (Err(e), _) => {
                    log::error!("Agent {}: could not release claim: {}", agent, e);
                    failed(ErrorClass::of(&e), e.to_string(), None)
                }
                (Ok(()), RunEnd::Completed) => AgentOutcome::Completed,
                (Ok(()), RunEnd::Stopped(reason)) => AgentOutcome::Incomplete { reason },
            };
            (outcome, run.counts)
        }
        Err(FailedRun { counts, error }) => {
            let class = ErrorClass::of(&error);
            let message = error.to_string();
            log::error!(
                "Agent {}: run failed ({}) after inserting {} and updating {}: {}",
                agent,
                class.as_str(),
                counts.inserted,
                counts.updated,
                message
            );

            let recorded = {
                let agent = agent.clone();
                let holder = holder.clone();
                let lease = ctx.lease_policy.clone();
                let message = message.clone();
                ctx.db
                    .with_connection(move |conn| {
                        fail(conn, &agent, &holder, class, &message, Utc::now(), &lease)
                    })
                    .await
            };
            let next_retry_at = match recorded {
                Ok(at) => Some(at),
                Err(err) => {
                    log::warn!("Agent {}: could not record failure: {}", agent, err);
                    None
                }
            };
            (failed(class, message, next_retry_at), counts)
        }
    };

    AgentReport {
        agent,
        outcome,
        counts,
        duration_ms: elapsed_ms(started),
    }
}

/// Run indexing for the requested agents on a pool of `ctx.workers`.
///
/// Errors are only returned for problems that prevent any agent from being
/// attempted (invalid request, unreadable root, store unavailable); per-agent
/// failures are reported in the [`TriggerReport`].
pub async fn run_trigger(
    ctx: &IndexContext,
    request: TriggerRequest,
    cancel: CancellationToken,
) -> Result<TriggerReport> {
    let started_at = Utc::now();
    let started = Instant::now();

    ctx.db
        .with_connection(|conn| release_due_retries(conn, Utc::now()))
        .await?;

    let agents = match request.agent {
        AgentSelector::One(agent) => {
            validate_agent_name(&agent)?;
            vec![agent]
        }
        AgentSelector::All => {
            let root = ctx.recordings_root.clone();
            tokio::task::spawn_blocking(move || discover_agents(&root))
                .await
                .map_err(|e| CallIndexError::Join(e.to_string()))??
        }
    };

    log::info!("Indexing {} agent(s) with {} worker(s)", agents.len(), ctx.workers);

    let since = request.since;
    let mut reports: Vec<AgentReport> = stream::iter(agents)
        .map(|agent| run_agent(ctx, agent, since, cancel.clone()))
        .buffer_unordered(ctx.workers.max(1))
        .collect()
        .await;
    reports.sort_by(|a, b| a.agent.cmp(&b.agent));

    let report = TriggerReport {
        status: TriggerReport::status_of(&reports),
        started_at,
        agents: reports,
        duration_ms: elapsed_ms(started),
    };
    log::info!(
        "Trigger finished: {:?} ({} agent(s), {} ms)",
        report.status,
        report.agents.len(),
        report.duration_ms
    );
    Ok(report)
}

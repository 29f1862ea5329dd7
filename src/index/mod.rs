//! Incremental indexing of per-agent recording directories.

pub mod checkpoint;
pub mod filename;
pub mod pipeline;
pub mod probe;
pub mod reconcile;
pub mod walker;
pub mod writer;

use url::Url;

pub use checkpoint::{load_checkpoint, Checkpoint, Cursor};
pub use filename::{parse_filename, ParseFailure, ParsedName};
pub use pipeline::{run_agent_pipeline, AgentRun, FailedRun, IndexCounts, RunEnd, StopReason};
pub use reconcile::{prune_soft_deleted, reconcile_deletions, ReconcileCounts, ReconcileScope};
pub use walker::{walk_agent, FileMetadata, WalkOutcome};
pub use writer::{recording_id, write_batch, BatchCounts, Fence, PreparedFile};

/// Deletion-detection cadence
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    /// Minimum time between any two reconciliation passes; zero means every run.
    pub interval: chrono::Duration,
    /// Time between full passes. Other passes only look at `window`.
    pub full_interval: chrono::Duration,
    pub window: chrono::Duration,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            interval: chrono::Duration::zero(),
            full_interval: chrono::Duration::days(1),
            window: chrono::Duration::days(30),
        }
    }
}

/// Everything a single agent run needs besides the store and its claim
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub batch_size: usize,
    /// Lowercase, without the leading dot.
    pub extensions: Vec<String>,
    /// Widen the candidate window backwards by this much to absorb clock skew.
    pub mtime_slack: chrono::Duration,
    pub job_timeout: std::time::Duration,
    pub probe_duration: bool,
    pub playback_base_url: Option<Url>,
    pub reconcile: ReconcilePolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            extensions: ["wav", "mp3", "ogg", "gsm", "m4a", "flac"]
                .iter()
                .map(|e| e.to_string())
                .collect(),
            mtime_slack: chrono::Duration::zero(),
            job_timeout: std::time::Duration::from_secs(600),
            probe_duration: true,
            playback_base_url: None,
            reconcile: ReconcilePolicy::default(),
        }
    }
}

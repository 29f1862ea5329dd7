//! Per-agent job coordination and the trigger that drives index runs.

pub mod coordinator;
pub mod trigger;

pub use coordinator::{
    claim, complete, fail, list_jobs, load_job, release_due_retries, renew_lease, ClaimOutcome,
    ErrorClass, JobRecord, JobState, LeasePolicy,
};
pub use trigger::{
    discover_agents, run_trigger, validate_agent_name, AgentOutcome, AgentReport, AgentSelector,
    IndexContext, SkipReason, TriggerReport, TriggerRequest, TriggerStatus,
};

//! Job definitions, run state, and execution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type JobId = Uuid;

/// Opaque parameter bag handed to a target function.
pub type Params = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Paused,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
            JobStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(JobStatus::Active),
            "paused" => Some(JobStatus::Paused),
            "error" => Some(JobStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Scheduled,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Scheduled => "scheduled",
            TriggerType::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(TriggerType::Scheduled),
            "manual" => Some(TriggerType::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Outcome::Success),
            "failure" => Some(Outcome::Failure),
            "timeout" => Some(Outcome::Timeout),
            _ => None,
        }
    }
}

/// Caller-supplied job definition, before validation.
///
/// Policy fields are signed so that zero and negative values arrive intact
/// and can be rejected with a proper validation error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub cron_expr: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub target: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub timeout_seconds: i64,
    #[serde(default)]
    pub max_consecutive_failures: i64,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

/// A validated definition ready to be upserted, with the lifecycle fields
/// the control surface computed for it.
#[derive(Debug, Clone)]
pub struct JobDraft {
    pub name: String,
    pub description: Option<String>,
    pub cron_expr: String,
    pub timezone: String,
    pub enabled: bool,
    pub target: String,
    pub params: Params,
    pub timeout_seconds: u64,
    pub max_consecutive_failures: u32,
    pub status: JobStatus,
    pub consecutive_failure_count: u32,
    pub next_run_at: Option<DateTime<Utc>>,
    pub actor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub id: JobId,
    pub tenant_id: String,
    pub job_key: String,
    pub name: String,
    pub description: Option<String>,
    pub cron_expr: String,
    pub timezone: String,
    pub enabled: bool,
    pub target: String,
    pub params: Params,
    pub timeout_seconds: u64,
    pub max_consecutive_failures: u32,
    pub status: JobStatus,
    pub consecutive_failure_count: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_result: Option<Value>,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every write; used for optimistic concurrency.
    pub version: i64,
}

impl ScheduledJob {
    /// Whether the registry should hold a live timer for this job.
    pub fn is_schedulable(&self) -> bool {
        self.enabled && self.status != JobStatus::Error
    }

    pub fn run_state(&self) -> RunState {
        RunState {
            enabled: self.enabled,
            status: self.status,
            consecutive_failure_count: self.consecutive_failure_count,
            last_run_at: self.last_run_at,
            next_run_at: self.next_run_at,
            last_error: self.last_error.clone(),
            last_result: self.last_result.clone(),
        }
    }

    pub(crate) fn apply_run_state(&mut self, state: RunState) {
        self.enabled = state.enabled;
        self.status = state.status;
        self.consecutive_failure_count = state.consecutive_failure_count;
        self.last_run_at = state.last_run_at;
        self.next_run_at = state.next_run_at;
        self.last_error = state.last_error;
        self.last_result = state.last_result;
    }
}

/// The mutable lifecycle portion of a job, written as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    pub enabled: bool,
    pub status: JobStatus,
    pub consecutive_failure_count: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_result: Option<Value>,
}

/// Immutable fact about one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub job_id: JobId,
    pub tenant_id: String,
    pub trigger_type: TriggerType,
    pub triggered_by: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub outcome: Outcome,
    pub input: Params,
    pub output: Option<Value>,
    pub error_message: Option<String>,
}

/// Optional narrowing for job listings. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFilter {
    pub enabled: Option<bool>,
    pub status: Option<JobStatus>,
    pub target: Option<String>,
    pub name_contains: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn matches(&self, job: &ScheduledJob) -> bool {
        if let Some(enabled) = self.enabled {
            if job.enabled != enabled {
                return false;
            }
        }
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(target) = &self.target {
            if &job.target != target {
                return false;
            }
        }
        if let Some(needle) = &self.name_contains {
            if !job.name.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

//! Scheduling core: cron planning, per-job timers, execution, and the
//! control surface over them.

pub mod builtin;
pub mod cron;
pub mod engine;
pub mod history;
pub mod locks;
pub mod model;
pub mod registry;
pub mod service;
pub mod target;

// Re-export common types
pub use self::engine::{ExecutionEngine, ExecutionOutcome};
pub use self::history::{ExecutionLogger, MemoryExecutionLog};
pub use self::model::{
    ExecutionRecord, JobFilter, JobId, JobSpec, JobStatus, Outcome, Params, ScheduledJob, TriggerType,
};
pub use self::registry::{JobRegistry, RegistryStats};
pub use self::service::{Action, AllowAll, Authorizer, JobService};
pub use self::target::{ExecContext, TargetFunction, TargetRegistry, TargetResolver};

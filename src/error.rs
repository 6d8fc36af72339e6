//! Error taxonomy for the scheduling core.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression `{expr}`: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("cron expression `{0}` has no upcoming fire time")]
    NoUpcomingFire(String),

    #[error("invalid job policy: {0}")]
    InvalidPolicy(String),

    #[error("unknown target function: {0}")]
    UnknownTarget(String),

    #[error("job key `{key}` already exists for tenant {tenant}")]
    DuplicateKey { tenant: String, key: String },

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("stale update for job {id}: expected version {expected}")]
    StaleUpdate { id: Uuid, expected: i64 },

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("execution cancelled")]
    Cancelled,

    #[error("job registry is stopped")]
    RegistryStopped,

    #[error("storage error: {0}")]
    Storage(String),
}

impl SchedulerError {
    /// Errors rejected synchronously at the control surface and never stored.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidCron { .. }
                | SchedulerError::UnknownTimezone(_)
                | SchedulerError::NoUpcomingFire(_)
                | SchedulerError::InvalidPolicy(_)
                | SchedulerError::UnknownTarget(_)
                | SchedulerError::DuplicateKey { .. }
        )
    }
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(e: rusqlite::Error) -> Self {
        SchedulerError::Storage(e.to_string())
    }
}

impl From<r2d2::Error> for SchedulerError {
    fn from(e: r2d2::Error) -> Self {
        SchedulerError::Storage(format!("connection pool: {}", e))
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        SchedulerError::Storage(format!("serialization: {}", e))
    }
}

impl From<tokio::task::JoinError> for SchedulerError {
    fn from(e: tokio::task::JoinError) -> Self {
        SchedulerError::Storage(format!("blocking task failed: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

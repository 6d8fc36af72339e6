//! Execution history: one immutable record per run.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{debug, error};

use super::model::{ExecutionRecord, JobId};
use crate::error::Result;

/// Append-only sink for execution records.
#[async_trait::async_trait]
pub trait ExecutionLogger: Send + Sync {
    async fn append(&self, record: &ExecutionRecord) -> Result<()>;

    /// Most recent records for a job, newest first.
    async fn list(&self, job_id: JobId, limit: usize) -> Result<Vec<ExecutionRecord>>;
}

/// Append a record, reporting failures to the log instead of the caller.
///
/// A lost audit record must never change the outcome of the run it describes.
pub async fn record_best_effort(logger: &dyn ExecutionLogger, record: &ExecutionRecord) {
    match logger.append(record).await {
        Ok(()) => debug!(
            job_id = %record.job_id,
            execution_id = %record.id,
            outcome = record.outcome.as_str(),
            "execution record appended"
        ),
        Err(e) => error!(
            job_id = %record.job_id,
            execution_id = %record.id,
            outcome = record.outcome.as_str(),
            error = %e,
            "failed to append execution record"
        ),
    }
}

/// In-memory logger for tests and embedding.
#[derive(Default)]
pub struct MemoryExecutionLog {
    records: RwLock<HashMap<JobId, Vec<ExecutionRecord>>>,
}

impl MemoryExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self, job_id: JobId) -> usize {
        self.records.read().await.get(&job_id).map_or(0, Vec::len)
    }

    pub async fn total(&self) -> usize {
        self.records.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait::async_trait]
impl ExecutionLogger for MemoryExecutionLog {
    async fn append(&self, record: &ExecutionRecord) -> Result<()> {
        self.records
            .write()
            .await
            .entry(record.job_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn list(&self, job_id: JobId, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let records = self.records.read().await;
        Ok(records
            .get(&job_id)
            .map(|v| v.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulerError;
    use crate::scheduler::model::{Outcome, Params, TriggerType};
    use chrono::Utc;
    use uuid::Uuid;

    fn record(job_id: JobId, outcome: Outcome) -> ExecutionRecord {
        let now = Utc::now();
        ExecutionRecord {
            id: Uuid::new_v4(),
            job_id,
            tenant_id: "acme".into(),
            trigger_type: TriggerType::Scheduled,
            triggered_by: None,
            started_at: now,
            ended_at: now,
            duration_ms: 0,
            outcome,
            input: Params::new(),
            output: None,
            error_message: None,
        }
    }

    struct BrokenLog;

    #[async_trait::async_trait]
    impl ExecutionLogger for BrokenLog {
        async fn append(&self, _record: &ExecutionRecord) -> Result<()> {
            Err(SchedulerError::Storage("disk full".into()))
        }
        async fn list(&self, _job_id: JobId, _limit: usize) -> Result<Vec<ExecutionRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_memory_log_lists_newest_first() {
        let log = MemoryExecutionLog::new();
        let job = Uuid::new_v4();
        log.append(&record(job, Outcome::Failure)).await.unwrap();
        log.append(&record(job, Outcome::Success)).await.unwrap();

        let listed = log.list(job, 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].outcome, Outcome::Success);
        assert_eq!(log.list(job, 1).await.unwrap().len(), 1);
        assert_eq!(log.count(Uuid::new_v4()).await, 0);
    }

    #[tokio::test]
    async fn test_best_effort_swallows_write_failures() {
        // Must return normally even though the sink rejects the write.
        record_best_effort(&BrokenLog, &record(Uuid::new_v4(), Outcome::Timeout)).await;
    }
}

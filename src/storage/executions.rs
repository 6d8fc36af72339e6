//! SQLite-backed execution log.

use rusqlite::{params, Row};
use uuid::Uuid;

use super::{format_ts, parse_ts, Pool};
use crate::error::Result;
use crate::scheduler::history::ExecutionLogger;
use crate::scheduler::model::{ExecutionRecord, JobId, Outcome, TriggerType};

/// Append-only execution history, optionally trimmed to the newest
/// `history_limit` records per job.
#[derive(Clone)]
pub struct SqliteExecutionLog {
    pool: Pool,
    history_limit: usize,
}

impl SqliteExecutionLog {
    pub fn new(pool: Pool, history_limit: usize) -> Self {
        Self { pool, history_limit }
    }
}

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, msg)),
    )
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let id: String = row.get(0)?;
    let job_id: String = row.get(1)?;
    let trigger: String = row.get(3)?;
    let outcome: String = row.get(8)?;
    let input_json: String = row.get(9)?;
    let output_json: Option<String> = row.get(10)?;

    Ok(ExecutionRecord {
        id: Uuid::parse_str(&id).map_err(|e| conversion_err(0, e.to_string()))?,
        job_id: Uuid::parse_str(&job_id).map_err(|e| conversion_err(1, e.to_string()))?,
        tenant_id: row.get(2)?,
        trigger_type: TriggerType::parse(&trigger)
            .ok_or_else(|| conversion_err(3, format!("unknown trigger type '{}'", trigger)))?,
        triggered_by: row.get(4)?,
        started_at: parse_ts(&row.get::<_, String>(5)?).map_err(|e| conversion_err(5, e))?,
        ended_at: parse_ts(&row.get::<_, String>(6)?).map_err(|e| conversion_err(6, e))?,
        duration_ms: row.get(7)?,
        outcome: Outcome::parse(&outcome)
            .ok_or_else(|| conversion_err(8, format!("unknown outcome '{}'", outcome)))?,
        input: serde_json::from_str(&input_json).map_err(|e| conversion_err(9, e.to_string()))?,
        output: match output_json {
            Some(s) => Some(serde_json::from_str(&s).map_err(|e| conversion_err(10, e.to_string()))?),
            None => None,
        },
        error_message: row.get(11)?,
    })
}

#[async_trait::async_trait]
impl ExecutionLogger for SqliteExecutionLog {
    async fn append(&self, record: &ExecutionRecord) -> Result<()> {
        let record = record.clone();
        let input_json = serde_json::to_string(&record.input)?;
        let output_json = record.output.as_ref().map(serde_json::to_string).transpose()?;
        let pool = self.pool.clone();
        let limit = self.history_limit;

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool.get()?;
            let tx = conn.transaction()?;
            let job_id = record.job_id.to_string();

            tx.execute(
                "INSERT INTO job_executions (id, job_id, tenant_id, trigger_type, triggered_by, started_at,
                     ended_at, duration_ms, outcome, input_json, output_json, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.id.to_string(),
                    job_id,
                    record.tenant_id,
                    record.trigger_type.as_str(),
                    record.triggered_by,
                    format_ts(record.started_at),
                    format_ts(record.ended_at),
                    record.duration_ms,
                    record.outcome.as_str(),
                    input_json,
                    output_json,
                    record.error_message,
                ],
            )?;

            if limit > 0 {
                tx.execute(
                    "DELETE FROM job_executions WHERE job_id = ?1 AND id NOT IN (
                         SELECT id FROM job_executions WHERE job_id = ?1
                         ORDER BY started_at DESC LIMIT ?2
                     )",
                    params![job_id, limit as i64],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
        .await?
    }

    async fn list(&self, job_id: JobId, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ExecutionRecord>> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT id, job_id, tenant_id, trigger_type, triggered_by, started_at, ended_at,
                        duration_ms, outcome, input_json, output_json, error_message
                 FROM job_executions WHERE job_id = ?1
                 ORDER BY started_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(
                params![job_id.to_string(), limit.min(i64::MAX as usize) as i64],
                row_to_record,
            )?;
            let mut records = Vec::new();
            for r in rows {
                records.push(r?);
            }
            Ok(records)
        })
        .await?
    }
}

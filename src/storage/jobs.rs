//! SQLite-backed job store.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{format_ts, parse_ts, parse_ts_opt, JobStore, Pool};
use crate::error::{Result, SchedulerError};
use crate::scheduler::model::{JobDraft, JobFilter, JobId, JobStatus, RunState, ScheduledJob};

const JOB_COLUMNS: &str = "id, tenant_id, job_key, name, description, cron_expr, timezone, enabled, target,
    params_json, timeout_seconds, max_consecutive_failures, status, consecutive_failure_count,
    last_run_at, next_run_at, last_error, last_result_json, created_by, updated_by, created_at,
    updated_at, version";

#[derive(Clone)]
pub struct SqliteJobStore {
    pool: Pool,
}

impl SqliteJobStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn get_pool(&self) -> &Pool {
        &self.pool
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut *conn)
        })
        .await?
    }
}

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, msg)),
    )
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<ScheduledJob> {
    let id: String = row.get(0)?;
    let params_json: String = row.get(9)?;
    let status: String = row.get(12)?;
    let last_result_json: Option<String> = row.get(17)?;

    let params = match serde_json::from_str::<serde_json::Value>(&params_json) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(_) => return Err(conversion_err(9, "params_json is not an object".into())),
        Err(e) => return Err(conversion_err(9, e.to_string())),
    };
    let last_result = match last_result_json {
        Some(s) => Some(serde_json::from_str(&s).map_err(|e| conversion_err(17, e.to_string()))?),
        None => None,
    };

    Ok(ScheduledJob {
        id: Uuid::parse_str(&id).map_err(|e| conversion_err(0, e.to_string()))?,
        tenant_id: row.get(1)?,
        job_key: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        cron_expr: row.get(5)?,
        timezone: row.get(6)?,
        enabled: row.get::<_, i64>(7)? != 0,
        target: row.get(8)?,
        params,
        timeout_seconds: row.get::<_, i64>(10)?.max(0) as u64,
        max_consecutive_failures: row.get::<_, i64>(11)?.max(0) as u32,
        status: JobStatus::parse(&status)
            .ok_or_else(|| conversion_err(12, format!("unknown job status '{}'", status)))?,
        consecutive_failure_count: row.get::<_, i64>(13)?.max(0) as u32,
        last_run_at: parse_ts_opt(row.get(14)?).map_err(|e| conversion_err(14, e))?,
        next_run_at: parse_ts_opt(row.get(15)?).map_err(|e| conversion_err(15, e))?,
        last_error: row.get(16)?,
        last_result,
        created_by: row.get(18)?,
        updated_by: row.get(19)?,
        created_at: parse_ts(&row.get::<_, String>(20)?).map_err(|e| conversion_err(20, e))?,
        updated_at: parse_ts(&row.get::<_, String>(21)?).map_err(|e| conversion_err(21, e))?,
        version: row.get(22)?,
    })
}

fn select_by_id(conn: &Connection, id: &str) -> Result<Option<ScheduledJob>> {
    let sql = format!("SELECT {} FROM scheduled_jobs WHERE id = ?1", JOB_COLUMNS);
    Ok(conn.query_row(&sql, params![id], row_to_job).optional()?)
}

fn select_by_key(conn: &Connection, tenant: &str, key: &str) -> Result<Option<ScheduledJob>> {
    let sql = format!(
        "SELECT {} FROM scheduled_jobs WHERE tenant_id = ?1 AND job_key = ?2",
        JOB_COLUMNS
    );
    Ok(conn.query_row(&sql, params![tenant, key], row_to_job).optional()?)
}

fn opt_ts(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(format_ts)
}

#[async_trait::async_trait]
impl JobStore for SqliteJobStore {
    async fn get(&self, id: JobId) -> Result<Option<ScheduledJob>> {
        self.with_conn(move |conn| select_by_id(conn, &id.to_string())).await
    }

    async fn find_by_key(&self, tenant: &str, key: &str) -> Result<Option<ScheduledJob>> {
        let tenant = tenant.to_string();
        let key = key.to_string();
        self.with_conn(move |conn| select_by_key(conn, &tenant, &key)).await
    }

    async fn upsert(&self, tenant: &str, key: &str, draft: &JobDraft) -> Result<ScheduledJob> {
        let tenant = tenant.to_string();
        let key = key.to_string();
        let draft = draft.clone();
        let params_json = serde_json::to_string(&draft.params)?;

        self.with_conn(move |conn| {
            let now = format_ts(Utc::now());
            let result = conn.execute(
                "INSERT INTO scheduled_jobs (id, tenant_id, job_key, name, description, cron_expr, timezone,
                     enabled, target, params_json, timeout_seconds, max_consecutive_failures, status,
                     consecutive_failure_count, next_run_at, created_by, updated_by, created_at, updated_at, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16, ?17, ?17, 1)
                 ON CONFLICT (tenant_id, job_key) DO UPDATE SET
                     name = excluded.name,
                     description = excluded.description,
                     cron_expr = excluded.cron_expr,
                     timezone = excluded.timezone,
                     enabled = excluded.enabled,
                     target = excluded.target,
                     params_json = excluded.params_json,
                     timeout_seconds = excluded.timeout_seconds,
                     max_consecutive_failures = excluded.max_consecutive_failures,
                     status = excluded.status,
                     consecutive_failure_count = excluded.consecutive_failure_count,
                     next_run_at = excluded.next_run_at,
                     updated_by = excluded.updated_by,
                     updated_at = excluded.updated_at,
                     version = scheduled_jobs.version + 1",
                params![
                    Uuid::new_v4().to_string(),
                    tenant,
                    key,
                    draft.name,
                    draft.description,
                    draft.cron_expr,
                    draft.timezone,
                    draft.enabled as i64,
                    draft.target,
                    params_json,
                    draft.timeout_seconds as i64,
                    draft.max_consecutive_failures as i64,
                    draft.status.as_str(),
                    draft.consecutive_failure_count as i64,
                    opt_ts(draft.next_run_at),
                    draft.actor,
                    now,
                ],
            );

            match result {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    return Err(SchedulerError::DuplicateKey { tenant, key });
                }
                Err(e) => return Err(e.into()),
            }

            select_by_key(conn, &tenant, &key)?
                .ok_or_else(|| SchedulerError::Storage(format!("upserted job {}/{} vanished", tenant, key)))
        })
        .await
    }

    async fn update_run_state(
        &self,
        id: JobId,
        expected_version: i64,
        state: &RunState,
        actor: Option<&str>,
    ) -> Result<ScheduledJob> {
        let state = state.clone();
        let actor = actor.map(str::to_string);
        let last_result_json = state
            .last_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.with_conn(move |conn| {
            let id_str = id.to_string();
            let changed = conn.execute(
                "UPDATE scheduled_jobs SET
                     enabled = ?1,
                     status = ?2,
                     consecutive_failure_count = ?3,
                     last_run_at = ?4,
                     next_run_at = ?5,
                     last_error = ?6,
                     last_result_json = ?7,
                     updated_by = COALESCE(?8, updated_by),
                     updated_at = ?9,
                     version = version + 1
                 WHERE id = ?10 AND version = ?11",
                params![
                    state.enabled as i64,
                    state.status.as_str(),
                    state.consecutive_failure_count as i64,
                    opt_ts(state.last_run_at),
                    opt_ts(state.next_run_at),
                    state.last_error,
                    last_result_json,
                    actor,
                    format_ts(Utc::now()),
                    id_str,
                    expected_version,
                ],
            )?;

            if changed == 0 {
                return match select_by_id(conn, &id_str)? {
                    Some(_) => Err(SchedulerError::StaleUpdate { id, expected: expected_version }),
                    None => Err(SchedulerError::NotFound(id)),
                };
            }

            select_by_id(conn, &id_str)?.ok_or(SchedulerError::NotFound(id))
        })
        .await
    }

    async fn list(&self, tenant: Option<&str>, filter: &JobFilter) -> Result<Vec<ScheduledJob>> {
        let tenant = tenant.map(str::to_string);
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut jobs = Vec::new();
            match &tenant {
                Some(t) => {
                    let sql = format!(
                        "SELECT {} FROM scheduled_jobs WHERE tenant_id = ?1 ORDER BY job_key",
                        JOB_COLUMNS
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    for r in stmt.query_map(params![t], row_to_job)? {
                        jobs.push(r?);
                    }
                }
                None => {
                    let sql = format!(
                        "SELECT {} FROM scheduled_jobs ORDER BY tenant_id, job_key",
                        JOB_COLUMNS
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    for r in stmt.query_map([], row_to_job)? {
                        jobs.push(r?);
                    }
                }
            }

            let limit = filter.limit.unwrap_or(usize::MAX);
            Ok(jobs.into_iter().filter(|j| filter.matches(j)).take(limit).collect())
        })
        .await
    }

    async fn list_enabled(&self, tenant: Option<&str>) -> Result<Vec<ScheduledJob>> {
        let tenant = tenant.map(str::to_string);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM scheduled_jobs
                 WHERE enabled = 1 AND status != 'error' AND (?1 IS NULL OR tenant_id = ?1)
                 ORDER BY tenant_id, job_key",
                JOB_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![tenant], row_to_job)?;
            let mut jobs = Vec::new();
            for r in rows {
                jobs.push(r?);
            }
            Ok(jobs)
        })
        .await
    }

    async fn delete(&self, id: JobId) -> Result<bool> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "DELETE FROM scheduled_jobs WHERE id = ?1",
                params![id.to_string()],
            )?;
            Ok(changed > 0)
        })
        .await
    }
}

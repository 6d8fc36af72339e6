//! Target functions: the host-supplied units of work a job invokes by name.
//!
//! Targets are registered explicitly with a [`TargetRegistry`] so the set of
//! valid names is known when a job is created, not discovered at fire time.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::model::{JobId, Params, TriggerType};

/// Metadata about the run, passed alongside the parameter bag.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub tenant_id: String,
    pub job_id: JobId,
    pub trigger_type: TriggerType,
    pub triggered_by: Option<String>,
    /// The slot a scheduled run was armed for; `None` for manual runs.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Fires when the run times out or is cancelled by its caller.
    /// Long-running targets should poll or select on it.
    pub cancel: CancellationToken,
}

impl ExecContext {
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "tenantId": self.tenant_id,
            "jobId": self.job_id,
            "triggerType": self.trigger_type,
            "triggeredBy": self.triggered_by,
            "scheduledFor": self.scheduled_for,
        })
    }
}

/// A single invocable unit of work.
#[async_trait::async_trait]
pub trait TargetFunction: Send + Sync {
    async fn invoke(&self, params: Params, ctx: ExecContext) -> Result<Value>;
}

/// Maps target names to invocable handlers.
#[async_trait::async_trait]
pub trait TargetResolver: Send + Sync {
    fn contains(&self, name: &str) -> bool;

    async fn invoke(&self, name: &str, params: Params, ctx: ExecContext) -> Result<Value>;
}

/// In-process resolver backed by a name -> handler table.
#[derive(Default, Clone)]
pub struct TargetRegistry {
    handlers: HashMap<String, Arc<dyn TargetFunction>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TargetFunction>) -> &mut Self {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::warn!(target_fn = %name, "target function re-registered; previous handler replaced");
        }
        self
    }

    /// Register a closure-based target.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Params, ExecContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(name, Arc::new(FnTarget(f)))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait::async_trait]
impl TargetResolver for TargetRegistry {
    fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    async fn invoke(&self, name: &str, params: Params, ctx: ExecContext) -> Result<Value> {
        let handler = self
            .handlers
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown target function '{}'", name))?;
        handler.invoke(params, ctx).await
    }
}

struct FnTarget<F>(F);

#[async_trait::async_trait]
impl<F, Fut> TargetFunction for FnTarget<F>
where
    F: Fn(Params, ExecContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
{
    async fn invoke(&self, params: Params, ctx: ExecContext) -> Result<Value> {
        (self.0)(params, ctx).await
    }
}

//! Built-in target functions shipped with the daemon.
//!
//! Hosts embedding the library register their own targets; these cover the
//! standalone binary and smoke-testing a deployment.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde_json::{json, Value};

use super::model::Params;
use super::target::{ExecContext, TargetFunction, TargetRegistry};

/// Returns a registry holding `noop`, `sleep`, and `webhook`.
pub fn registry() -> Result<TargetRegistry> {
    let mut registry = TargetRegistry::new();
    registry
        .register("noop", Arc::new(Noop))
        .register("sleep", Arc::new(Sleep))
        .register("webhook", Arc::new(Webhook::new()?));
    Ok(registry)
}

/// Succeeds immediately.
pub struct Noop;

#[async_trait::async_trait]
impl TargetFunction for Noop {
    async fn invoke(&self, _params: Params, _ctx: ExecContext) -> Result<Value> {
        Ok(json!({ "ok": true }))
    }
}

/// Sleeps for `params.seconds`, stopping early when cancelled.
pub struct Sleep;

#[async_trait::async_trait]
impl TargetFunction for Sleep {
    async fn invoke(&self, params: Params, ctx: ExecContext) -> Result<Value> {
        let seconds = params
            .get("seconds")
            .and_then(Value::as_f64)
            .unwrap_or(1.0);
        if !(0.0..=86_400.0).contains(&seconds) {
            bail!("sleep: seconds must be between 0 and 86400, got {}", seconds);
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {
                Ok(json!({ "slept_seconds": seconds }))
            }
            _ = ctx.cancel.cancelled() => {
                bail!("sleep cancelled")
            }
        }
    }
}

/// POSTs the parameter bag (plus execution context) to `params.url`.
pub struct Webhook {
    client: Client,
}

impl Webhook {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("orgcron/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl TargetFunction for Webhook {
    async fn invoke(&self, params: Params, ctx: ExecContext) -> Result<Value> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .context("webhook: missing string parameter 'url'")?
            .to_string();

        let body = json!({ "params": params, "context": ctx.to_value() });
        let start = Instant::now();

        let response = tokio::select! {
            r = self.client.post(&url).json(&body).send() => r.with_context(|| format!("webhook request to {} failed", url))?,
            _ = ctx.cancel.cancelled() => bail!("webhook cancelled"),
        };

        let status = response.status();
        let elapsed_ms = start.elapsed().as_millis() as u64;
        if !status.is_success() {
            bail!("webhook {} returned HTTP {}", url, status.as_u16());
        }

        Ok(json!({ "status": status.as_u16(), "latency_ms": elapsed_ms }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::model::TriggerType;
    use crate::scheduler::target::TargetResolver;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx(cancel: CancellationToken) -> ExecContext {
        ExecContext {
            tenant_id: "t".into(),
            job_id: Uuid::new_v4(),
            trigger_type: TriggerType::Scheduled,
            triggered_by: None,
            scheduled_for: None,
            cancel,
        }
    }

    #[tokio::test]
    async fn test_builtin_names() {
        let reg = registry().unwrap();
        assert_eq!(reg.names(), vec!["noop", "sleep", "webhook"]);
    }

    #[tokio::test]
    async fn test_noop_succeeds() {
        let out = Noop.invoke(Params::new(), ctx(CancellationToken::new())).await.unwrap();
        assert_eq!(out["ok"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_observes_cancellation() {
        let token = CancellationToken::new();
        let mut params = Params::new();
        params.insert("seconds".into(), json!(600));

        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            child.cancel();
        });

        let err = Sleep.invoke(params, ctx(token)).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_sleep_rejects_negative() {
        let mut params = Params::new();
        params.insert("seconds".into(), json!(-3));
        assert!(Sleep.invoke(params, ctx(CancellationToken::new())).await.is_err());
    }

    #[tokio::test]
    async fn test_webhook_requires_url() {
        let reg = registry().unwrap();
        let err = reg
            .invoke("webhook", Params::new(), ctx(CancellationToken::new()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("url"));
    }
}

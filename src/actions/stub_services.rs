//! Concrete [`MarketplaceService`] implementations.
//!
//! `DirectHttpService` calls a marketplace's own HTTPS API directly (M2/M3).
//! `BridgedHttpService` proxies through the plugin bridge (M1), the only
//! bridged marketplace. Both are thin: classification of failure into
//! [`OrchestratorError`] is the only logic that belongs here — retry policy
//! lives in the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::bridge::{BridgeRequest, PluginBridge};
use crate::error::OrchestratorError;
use crate::model::{ActionOutcome, Job, Task};

use super::MarketplaceService;

pub struct DirectHttpService {
    client: reqwest::Client,
    base_url: String,
}

impl DirectHttpService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl MarketplaceService for DirectHttpService {
    async fn execute(&self, job: &Job, task: &Task) -> Result<ActionOutcome, OrchestratorError> {
        let url = format!("{}/{}", self.base_url, job.action_code);
        let resp = self
            .client
            .post(&url)
            .json(&task.payload)
            .send()
            .await
            .map_err(|e| OrchestratorError::UpstreamFailure(e.to_string()))?;

        if resp.status().is_server_error() {
            return Err(OrchestratorError::UpstreamFailure(format!(
                "{} returned {}",
                self.base_url,
                resp.status()
            )));
        }
        if resp.status().is_client_error() {
            return Ok(ActionOutcome {
                success: false,
                result: serde_json::Value::Null,
                error: Some(format!("client error {}", resp.status())),
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| OrchestratorError::UpstreamFailure(e.to_string()))?;
        Ok(ActionOutcome {
            success: true,
            result: body,
            error: None,
        })
    }
}

/// Local task step that does no outbound call at all — used for `db`/`file`
/// pipeline steps that only need to persist or read something already on
/// hand. Always succeeds, echoing its payload back as the result.
pub struct LocalEchoService;

#[async_trait]
impl MarketplaceService for LocalEchoService {
    async fn execute(&self, _job: &Job, task: &Task) -> Result<ActionOutcome, OrchestratorError> {
        Ok(ActionOutcome {
            success: true,
            result: task.payload.clone(),
            error: None,
        })
    }
}

pub struct BridgedHttpService {
    bridge: Arc<PluginBridge>,
    default_timeout: Duration,
}

impl BridgedHttpService {
    pub fn new(bridge: Arc<PluginBridge>, default_timeout: Duration) -> Self {
        Self {
            bridge,
            default_timeout,
        }
    }
}

#[async_trait]
impl MarketplaceService for BridgedHttpService {
    async fn execute(&self, job: &Job, task: &Task) -> Result<ActionOutcome, OrchestratorError> {
        let now = crate::time::now_ms() as i64;
        let request = BridgeRequest {
            request_id: Uuid::new_v4(),
            tenant: job.tenant.clone(),
            job_id: job.id,
            task_id: task.id,
            action: job.action_code.clone(),
            payload: task.payload.clone(),
            deadline_ms: now + self.default_timeout.as_millis() as i64,
        };

        let response = self.bridge.dispatch(request, self.default_timeout).await?;
        Ok(ActionOutcome {
            success: response.success,
            result: response.result,
            error: response.error,
        })
    }
}

use crate::handle::AgentHandle;
use async_trait::async_trait;
use conductor_core::{
    AgentDescriptor, AgentResponse, ConductorError, ConductorResult, StatusReport, Task,
};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote agent reached over HTTP.
///
/// Expects the agent to serve `POST /process`, `GET /health` and
/// `GET /tasks/{id}` relative to its base URL.
pub struct HttpAgent {
    descriptor: AgentDescriptor,
    base_url: String,
    http: reqwest::Client,
}

impl HttpAgent {
    /// Client with the default 30 s timeout. Fails without a base URL.
    pub fn new(descriptor: AgentDescriptor) -> ConductorResult<Self> {
        Self::with_timeout(descriptor, DEFAULT_TIMEOUT)
    }

    /// Client with a custom per-request timeout.
    pub fn with_timeout(descriptor: AgentDescriptor, timeout: Duration) -> ConductorResult<Self> {
        let base_url = descriptor
            .base_url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                ConductorError::Validation(format!(
                    "agent '{}' has no base URL",
                    descriptor.name
                ))
            })?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConductorError::Http(e.to_string()))?;
        Ok(Self {
            descriptor,
            base_url,
            http,
        })
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl AgentHandle for HttpAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn process(&self, task: &Task) -> ConductorResult<AgentResponse> {
        let url = format!("{}/process", self.base_url);
        debug!(agent = %self.descriptor.name, task_id = %task.id, %url, "Forwarding task");

        let resp = self
            .http
            .post(&url)
            .json(task)
            .send()
            .await
            .map_err(|e| ConductorError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ConductorError::Agent(format!(
                "{} returned {}: {}",
                self.descriptor.name, status, body
            )));
        }

        resp.json::<AgentResponse>()
            .await
            .map_err(|e| ConductorError::Http(e.to_string()))
    }

    async fn health_check(&self) -> ConductorResult<()> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ConductorError::Http(e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ConductorError::AgentUnavailable(format!(
                "{} health check returned {}",
                self.descriptor.name,
                resp.status()
            )))
        }
    }

    async fn task_status(&self, task_id: Uuid) -> ConductorResult<StatusReport> {
        let url = format!("{}/tasks/{}", self.base_url, task_id);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ConductorError::Http(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(ConductorError::TaskNotFound(task_id)),
            s if s.is_success() => resp
                .json::<StatusReport>()
                .await
                .map_err(|e| ConductorError::Http(e.to_string())),
            s => Err(ConductorError::Agent(format!(
                "{} status query returned {}",
                self.descriptor.name, s
            ))),
        }
    }
}

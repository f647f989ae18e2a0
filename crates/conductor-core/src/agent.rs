use serde::{Deserialize, Serialize};

/// Health of a registered agent as observed by the last health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Not checked yet.
    #[default]
    Unknown,
    /// Last check passed.
    Healthy,
    /// Last check failed.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "unknown"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Static identity of an agent: what it is called, what kind it is and what it can do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDescriptor {
    /// Unique registry key.
    pub name: String,
    /// Kind of agent, e.g. `knowledge` or `assistant`.
    #[serde(rename = "type")]
    pub agent_type: String,
    /// Capabilities in declaration order.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Root URL of a remote agent.
    #[serde(default)]
    pub base_url: Option<String>,
}

impl AgentDescriptor {
    /// Descriptor without capabilities or URL.
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            capabilities: Vec::new(),
            base_url: None,
        }
    }

    /// Replace the capability list.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Set the remote URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Exact, case-sensitive match.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// True when every required capability is declared by this agent.
    pub fn covers(&self, required: &[String]) -> bool {
        required.iter().all(|r| self.has_capability(r))
    }
}

/// Rolling execution metrics for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    /// Fraction of successful tasks, 0.0–1.0.
    pub success_rate: f64,
    /// Running mean over finished tasks.
    pub avg_response_time_ms: f64,
    /// Dispatched and not yet finished.
    pub active_tasks: u32,
    /// Finished tasks.
    pub total_tasks: u64,
    /// Finished tasks that failed.
    pub failed_tasks: u64,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self {
            success_rate: 1.0,
            avg_response_time_ms: 0.0,
            active_tasks: 0,
            total_tasks: 0,
            failed_tasks: 0,
        }
    }
}

impl AgentMetrics {
    /// Fold one finished task into the rolling averages.
    pub fn record(&mut self, success: bool, duration_ms: u64) {
        self.total_tasks += 1;
        if !success {
            self.failed_tasks += 1;
        }
        let total = self.total_tasks as f64;
        self.success_rate = (total - self.failed_tasks as f64) / total;
        self.avg_response_time_ms += (duration_ms as f64 - self.avg_response_time_ms) / total;
        self.active_tasks = self.active_tasks.saturating_sub(1);
    }
}

/// Snapshot of a registered agent: descriptor plus observed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    /// Identity, flattened into the JSON form.
    #[serde(flatten)]
    pub descriptor: AgentDescriptor,
    /// Result of the last health check.
    pub status: HealthStatus,
    /// Execution metrics.
    pub metrics: AgentMetrics,
}

impl AgentInfo {
    /// Unchecked agent with fresh metrics.
    pub fn new(descriptor: AgentDescriptor) -> Self {
        Self {
            descriptor,
            status: HealthStatus::Unknown,
            metrics: AgentMetrics::default(),
        }
    }

    /// Registry key.
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// True only after a passed health check.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

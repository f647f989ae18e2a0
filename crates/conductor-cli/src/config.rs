//! `conductor.toml` layout.

use conductor_agents::{AgentConfig, DiscoveryConfig, HealthConfig, SelectionConfig};
use conductor_orchestrator::{ConductorSettings, OrchestratorConfig, PollerConfig, ProviderConfig};
use serde::Deserialize;

/// Environment variable consulted when `[provider] api_key` is empty.
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Root of `conductor.toml`. Every section is optional.
#[derive(Debug, Default, Deserialize)]
pub struct ConductorConfig {
    /// `[server]` bind address and API keys.
    #[serde(default)]
    pub server: ServerConfig,
    /// `[poller]` status polling cadence.
    #[serde(default)]
    pub poller: PollerConfig,
    /// `[orchestrator]` worker pool and retry settings.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// `[health]` periodic health checks.
    #[serde(default)]
    pub health: HealthConfig,
    /// `[discovery]` endpoints queried at startup.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// `[selection]` intent routes.
    #[serde(default)]
    pub selection: SelectionConfig,
    /// `[provider]` messages API used for decomposition and intent analysis.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Classify intent through the provider before selecting an agent.
    #[serde(default)]
    pub analyze_intent: bool,
    /// Statically configured `[[agents]]`.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

/// `[server]` section.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Accepted gateway keys; empty disables auth.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_keys: vec![],
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}

impl ConductorConfig {
    /// Parse TOML text.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Settings for [`Conductor::new`](conductor_orchestrator::Conductor::new).
    pub fn settings(&self) -> ConductorSettings {
        ConductorSettings {
            poller: self.poller.clone(),
            orchestrator: self.orchestrator.clone(),
            selection: self.selection.clone(),
            discovery: self.discovery.clone(),
            analyze_intent: self.analyze_intent,
        }
    }

    /// Provider settings with the API key filled from the environment if unset.
    pub fn provider(&self) -> ProviderConfig {
        let mut provider = self.provider.clone();
        if provider.api_key.is_empty() {
            if let Ok(key) = std::env::var(API_KEY_ENV) {
                provider.api_key = key;
            }
        }
        provider
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::IntentKind;
    use conductor_orchestrator::SelectionStrategy;

    #[test]
    fn empty_file_uses_defaults() {
        let config = ConductorConfig::parse("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.poller.interval_ms, 2000);
        assert_eq!(config.poller.max_retries, 3);
        assert_eq!(config.health.interval_secs, 30);
        assert_eq!(config.orchestrator.max_concurrent_per_worker, 3);
        assert!(config.agents.is_empty());
        assert!(!config.analyze_intent);
    }

    #[test]
    fn full_file_parses_every_section() {
        let text = r#"
            analyze_intent = true

            [server]
            host = "127.0.0.1"
            port = 8088
            api_keys = ["k1"]

            [poller]
            interval_ms = 500
            max_retries = 5

            [orchestrator]
            strategy = "least_loaded"
            worker_wait_attempts = 4

            [orchestrator.retry]
            max_retries = 1

            [health]
            interval_secs = 10

            [discovery]
            endpoints = ["http://10.0.0.5:9000"]

            [selection.intent_routes]
            code = "coder"

            [provider]
            model_id = "test-model"
            max_tokens = 512

            [[agents]]
            name = "researcher"
            type = "knowledge"
            base_url = "http://localhost:9001"
            capabilities = ["search", "summarize"]
        "#;
        let config = ConductorConfig::parse(text).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.api_keys, vec!["k1"]);
        assert_eq!(config.poller.interval_ms, 500);
        assert_eq!(config.poller.grace_period_ms, 5000);
        assert_eq!(config.orchestrator.strategy, SelectionStrategy::LeastLoaded);
        assert_eq!(config.orchestrator.worker_wait_attempts, 4);
        assert_eq!(config.orchestrator.retry.max_retries, 1);
        assert_eq!(config.health.interval_secs, 10);
        assert_eq!(config.discovery.endpoints.len(), 1);
        assert_eq!(config.selection.intent_routes[&IntentKind::Code], "coder");
        assert_eq!(config.provider.max_tokens, 512);
        assert_eq!(config.agents[0].capabilities, vec!["search", "summarize"]);

        let settings = config.settings();
        assert!(settings.analyze_intent);
        assert_eq!(settings.poller.max_retries, 5);
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let err = ConductorConfig::parse("[orchestrator]\nstrategy = \"random\"\n");
        assert!(err.is_err());
    }
}

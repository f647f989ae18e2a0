use crate::config::DiscoveryConfig;
use crate::http::HttpAgent;
use crate::registry::AgentRegistry;
use conductor_core::{AgentDescriptor, ConductorError, ConductorResult};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Path every discoverable agent serves its card on.
pub const WELL_KNOWN_PATH: &str = "/.well-known/agent.json";

/// Self-description served at [`WELL_KNOWN_PATH`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    /// Name the agent registers under.
    pub name: String,
    /// Agent type.
    #[serde(rename = "type")]
    pub agent_type: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Agent version, if published.
    #[serde(default)]
    pub version: Option<String>,
    /// Declared capabilities.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Base URL of the agent. Defaults to the endpoint the card was fetched from.
    #[serde(default)]
    pub url: Option<String>,
}

impl AgentCard {
    /// Descriptor for the card fetched from `endpoint`.
    pub fn descriptor(&self, endpoint: &str) -> AgentDescriptor {
        AgentDescriptor::new(&self.name, &self.agent_type)
            .with_capabilities(self.capabilities.iter().cloned())
            .with_base_url(self.url.as_deref().unwrap_or(endpoint))
    }
}

/// An endpoint whose card could not be fetched or registered.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryFailure {
    /// Endpoint queried.
    pub endpoint: String,
    /// What went wrong.
    pub error: String,
}

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    /// Names of newly registered agents.
    pub registered: Vec<String>,
    /// Endpoints that failed.
    pub failed: Vec<DiscoveryFailure>,
}

/// Finds remote agents by fetching their cards from configured endpoints.
pub struct Discovery {
    endpoints: Vec<String>,
    http: reqwest::Client,
}

impl Discovery {
    /// Client for the configured endpoints; trailing slashes are dropped.
    pub fn new(config: &DiscoveryConfig) -> ConductorResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConductorError::Http(e.to_string()))?;
        Ok(Self {
            endpoints: config
                .endpoints
                .iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            http,
        })
    }

    /// Normalized endpoints.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Fetch and parse the card published at `endpoint`.
    pub async fn fetch_card(&self, endpoint: &str) -> ConductorResult<AgentCard> {
        let url = format!("{endpoint}{WELL_KNOWN_PATH}");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ConductorError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ConductorError::Http(format!(
                "{url} returned {}",
                resp.status()
            )));
        }
        resp.json::<AgentCard>()
            .await
            .map_err(|e| ConductorError::Http(e.to_string()))
    }

    /// Fetch every endpoint's card concurrently and register what was found.
    /// Failures are collected per endpoint; one bad endpoint never stops the pass.
    pub async fn discover(&self, registry: &AgentRegistry) -> DiscoveryReport {
        let fetched = join_all(self.endpoints.iter().map(|endpoint| async move {
            (endpoint.as_str(), self.fetch_card(endpoint).await)
        }))
        .await;

        let mut report = DiscoveryReport::default();
        for (endpoint, result) in fetched {
            let registered = result.and_then(|card| {
                let agent = HttpAgent::new(card.descriptor(endpoint))?;
                registry.register(Arc::new(agent))?;
                Ok(card.name)
            });
            match registered {
                Ok(name) => {
                    info!(agent = %name, %endpoint, "Discovered agent");
                    report.registered.push(name);
                }
                Err(e) => {
                    warn!(%endpoint, error = %e, "Agent discovery failed");
                    report.failed.push(DiscoveryFailure {
                        endpoint: endpoint.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::EventBus;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_discover_registers_cards_and_collects_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(WELL_KNOWN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "kg",
                "type": "knowledge",
                "capabilities": ["extract", "query"]
            })))
            .mount(&server)
            .await;
        let broken = MockServer::start().await;

        let discovery = Discovery::new(&DiscoveryConfig {
            endpoints: vec![server.uri(), broken.uri()],
        })
        .unwrap();
        let registry = AgentRegistry::new(Arc::new(EventBus::new()));

        let report = discovery.discover(&registry).await;

        assert_eq!(report.registered, vec!["kg".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].endpoint, broken.uri());
        let info = registry.get("kg").unwrap();
        assert_eq!(info.descriptor.base_url.as_deref(), Some(server.uri().as_str()));
        assert_eq!(registry.by_capability("query"), vec!["kg".to_string()]);
    }

    #[test]
    fn test_card_url_overrides_endpoint() {
        let card: AgentCard = serde_json::from_value(serde_json::json!({
            "name": "a",
            "type": "assistant",
            "url": "http://agent.internal:7000"
        }))
        .unwrap();
        let desc = card.descriptor("http://proxy:80");
        assert_eq!(desc.base_url.as_deref(), Some("http://agent.internal:7000"));
        assert!(desc.capabilities.is_empty());
    }
}

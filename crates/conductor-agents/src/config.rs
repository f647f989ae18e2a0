use conductor_core::{AgentDescriptor, IntentKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A statically configured remote agent (`[[agents]]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Registry name.
    pub name: String,
    /// Agent type used by intent routing.
    #[serde(rename = "type")]
    pub agent_type: String,
    /// Root URL the agent serves its API on.
    pub base_url: String,
    /// Declared capabilities.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl AgentConfig {
    /// Descriptor to register the agent under.
    pub fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor::new(&self.name, &self.agent_type)
            .with_capabilities(self.capabilities.iter().cloned())
            .with_base_url(&self.base_url)
    }
}

/// `[health]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds between health checks.
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
}

fn default_health_interval() -> u64 {
    30
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
        }
    }
}

/// `[discovery]` section: base URLs queried for `/.well-known/agent.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Agent base URLs.
    #[serde(default)]
    pub endpoints: Vec<String>,
}

/// `[selection]` section: intent kind → agent type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Agent type preferred for each intent kind.
    #[serde(default = "default_intent_routes")]
    pub intent_routes: HashMap<IntentKind, String>,
}

/// Extraction and analysis go to `knowledge` agents, the rest to `assistant`.
pub fn default_intent_routes() -> HashMap<IntentKind, String> {
    HashMap::from([
        (IntentKind::Extraction, "knowledge".to_string()),
        (IntentKind::Analysis, "knowledge".to_string()),
        (IntentKind::General, "assistant".to_string()),
        (IntentKind::Code, "assistant".to_string()),
    ])
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            intent_routes: default_intent_routes(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_config_from_toml() {
        let cfg: AgentConfig = toml::from_str(
            r#"
            name = "kg"
            type = "knowledge"
            base_url = "http://localhost:9001"
            capabilities = ["extract", "query"]
            "#,
        )
        .unwrap();
        let desc = cfg.descriptor();
        assert_eq!(desc.agent_type, "knowledge");
        assert_eq!(desc.base_url.as_deref(), Some("http://localhost:9001"));
        assert!(desc.has_capability("query"));
    }

    #[test]
    fn test_selection_routes_override() {
        let cfg: SelectionConfig = toml::from_str(
            r#"
            [intent_routes]
            code = "coder"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.intent_routes.get(&IntentKind::Code).unwrap(), "coder");
        assert!(!cfg.intent_routes.contains_key(&IntentKind::General));
        assert_eq!(
            SelectionConfig::default()
                .intent_routes
                .get(&IntentKind::Analysis)
                .unwrap(),
            "knowledge"
        );
    }
}

use crate::retry::{provider_error, RetryPolicy};
use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One structured-generation call.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    /// Instructions for the model.
    pub system: String,
    /// The user-facing input.
    pub prompt: String,
    /// JSON schema the answer must follow, appended to the instructions.
    pub schema: Option<serde_json::Value>,
}

impl GenerationRequest {
    /// Request without a schema.
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            schema: None,
        }
    }

    /// Constrain the answer to `schema`.
    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }
}

/// Text-generation backend used for decomposition, aggregation and intent analysis.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Generate a JSON answer for `request`.
    async fn generate(&self, request: &GenerationRequest) -> ConductorResult<serde_json::Value>;
}

/// `[provider]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// API origin.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model identifier sent with each call.
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Key sent as `x-api-key`; read from the environment when empty.
    #[serde(default)]
    pub api_key: String,
    /// Completion token limit.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Retry policy for transient failures.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_model_id() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model_id: default_model_id(),
            api_key: String::new(),
            max_tokens: default_max_tokens(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Provider speaking the messages API (`POST {base}/v1/messages`).
pub struct MessagesApiProvider {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl MessagesApiProvider {
    /// Provider with its own HTTP client.
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }
}

#[async_trait]
impl GenerationProvider for MessagesApiProvider {
    async fn generate(&self, request: &GenerationRequest) -> ConductorResult<serde_json::Value> {
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));

        let mut system = request.system.clone();
        if let Some(schema) = &request.schema {
            system.push_str("\n\nRespond with a single JSON object matching this schema:\n");
            system.push_str(&schema.to_string());
        }

        let body = serde_json::json!({
            "model": self.config.model_id,
            "max_tokens": self.config.max_tokens,
            "system": system,
            "messages": [{"role": "user", "content": request.prompt}],
        });

        let resp = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| provider_error(e.to_string()))?;

        let status = resp.status();
        let resp_body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| provider_error(e.to_string()))?;

        if !status.is_success() {
            let msg = format!("messages API error {status}: {resp_body}");
            return Err(
                if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    provider_error(msg)
                } else {
                    ConductorError::Validation(msg)
                },
            );
        }

        let text: String = resp_body["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "text")
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        debug!(chars = text.len(), "Provider answered");
        extract_json(&text)
    }
}

/// Parse the JSON object embedded in a model answer, tolerating code fences
/// and surrounding prose.
pub fn extract_json(text: &str) -> ConductorResult<serde_json::Value> {
    let start = text.find('{');
    let end = text.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if s < e => serde_json::from_str(&text[s..=e])
            .map_err(|err| provider_error(format!("malformed JSON answer: {err}"))),
        _ => Err(provider_error("answer contains no JSON object")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_extract_json_from_fenced_answer() {
        let value = extract_json("Sure:\n```json\n{\"a\": {\"b\": 1}}\n```\n").unwrap();
        assert_eq!(value["a"]["b"], 1);
        assert!(extract_json("no json here").is_err());
    }

    #[tokio::test]
    async fn test_messages_api_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": "{\"summary\": \"done\"}"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = MessagesApiProvider::new(ProviderConfig {
            base_url: server.uri(),
            api_key: "sk-test".into(),
            ..ProviderConfig::default()
        });
        let value = provider
            .generate(&GenerationRequest::new("be brief", "summarize"))
            .await
            .unwrap();
        assert_eq!(value["summary"], "done");
    }

    #[tokio::test]
    async fn test_server_error_is_retryable_client_error_is_not() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let provider = MessagesApiProvider::new(ProviderConfig {
            base_url: server.uri(),
            ..ProviderConfig::default()
        });
        let request = GenerationRequest::new("s", "p");
        assert!(provider.generate(&request).await.unwrap_err().is_retryable());
        assert!(!provider.generate(&request).await.unwrap_err().is_retryable());
    }
}

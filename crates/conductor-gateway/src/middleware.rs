use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::warn;

/// Paths reachable without a key.
const PUBLIC_PATHS: &[&str] = &["/health", "/.well-known/agent.json"];

/// API keys accepted by the gateway (`[server] api_keys`).
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Empty disables authentication.
    pub api_keys: Vec<String>,
}

impl AuthConfig {
    /// Accept the given keys.
    pub fn new(api_keys: Vec<String>) -> Self {
        Self { api_keys }
    }

    /// Whether any key is configured.
    pub fn is_enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }

    fn accepts(&self, key: &str) -> bool {
        self.api_keys.iter().any(|k| k == key)
    }
}

/// Query string fallback for clients that cannot set headers.
#[derive(serde::Deserialize, Default)]
pub struct AuthQuery {
    /// `?api_key=`
    pub api_key: Option<String>,
}

/// Rejects requests without a known key. The key is read from
/// `Authorization: Bearer <key>`, falling back to `?api_key=<key>`. Health and
/// the agent card stay public.
pub async fn auth_middleware(
    State(auth): State<Arc<AuthConfig>>,
    headers: HeaderMap,
    query: Query<AuthQuery>,
    request: Request,
    next: Next,
) -> Response {
    if !auth.is_enabled() || PUBLIC_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    let key_from_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let key = key_from_header.or_else(|| query.api_key.clone());

    match key {
        Some(k) if auth.accepts(&k) => next.run(request).await,
        Some(_) => {
            warn!(path = %request.uri().path(), "Rejected request: invalid API key");
            unauthorized("Invalid API key")
        }
        None => {
            warn!(path = %request.uri().path(), "Rejected request: missing API key");
            unauthorized("API key required")
        }
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"success": false, "error": message})),
    )
        .into_response()
}

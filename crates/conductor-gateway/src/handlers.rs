//! HTTP handlers for agent-to-agent traffic and task management.

use crate::error::ApiError;
use crate::server::AppState;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use conductor_agents::{NegotiationRequest, Preferences};
use conductor_core::{AgentInfo, ConductorError, Task, TaskRequest};
use conductor_orchestrator::CancelOutcome;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub(crate) type ApiResult = Result<Json<Value>, ApiError>;

/// Wire protocol version advertised in the agent card.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Unwrap a JSON body; a malformed or mistyped body is a validation error.
fn parse_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match payload {
        Ok(Json(body)) => Ok(body),
        Err(rejection) => {
            debug!(error = %rejection.body_text(), "Rejected request body");
            Err(ApiError::validation(format!(
                "invalid request body: {}",
                rejection.body_text()
            )))
        }
    }
}

fn require<T>(value: Option<T>, field: &str) -> Result<T, ApiError> {
    value.ok_or_else(|| ApiError::validation(format!("missing required field: {field}")))
}

fn require_name(value: Option<String>, field: &str) -> Result<String, ApiError> {
    require(value.filter(|v| !v.trim().is_empty()), field)
}

fn lookup(state: &AppState, name: &str) -> Result<AgentInfo, ApiError> {
    state
        .conductor
        .registry()
        .get(name)
        .ok_or_else(|| ConductorError::AgentNotFound(name.to_string()).into())
}

/// Resolve both ends of an agent-to-agent call; the target must be healthy.
fn resolve_pair(state: &AppState, from: &str, to: &str) -> Result<AgentInfo, ApiError> {
    lookup(state, from)?;
    let target = lookup(state, to)?;
    if !target.is_healthy() {
        return Err(ConductorError::AgentUnavailable(to.to_string()).into());
    }
    Ok(target)
}

// ── Health & self-description ───────────────────────────────────────────

/// `GET /health`: liveness plus agent counts.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let agents = state.conductor.registry().list();
    Json(json!({
        "status": "ok",
        "service": "conductor",
        "agents": agents.len(),
        "healthyAgents": agents.iter().filter(|a| a.is_healthy()).count(),
    }))
}

/// `GET /.well-known/agent.json`: static self-description.
pub async fn agent_card() -> Json<Value> {
    Json(json!({
        "name": "conductor",
        "description": "Routes tasks to agents and orchestrates compound work",
        "protocolVersion": PROTOCOL_VERSION,
        "version": env!("CARGO_PKG_VERSION"),
        "capabilities": ["delegation", "communication", "negotiation", "discovery", "orchestration"],
        "endpoints": {
            "delegate": "/delegate",
            "communicate": "/communicate",
            "negotiate": "/negotiate",
            "discover": "/discover",
            "tasks": "/tasks",
            "events": "/ws",
        },
    }))
}

/// `GET /metrics`
pub async fn metrics(State(state): State<Arc<AppState>>) -> ApiResult {
    let metrics = state.conductor.metrics().await;
    Ok(Json(serde_json::to_value(metrics).map_err(ConductorError::from)?))
}

// ── Agents ──────────────────────────────────────────────────────────────

/// `GET /agents`
pub async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "agents": state.conductor.registry().list() }))
}

/// `GET /agents/{name}`
pub async fn get_agent(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult {
    let agent = lookup(&state, &name)?;
    Ok(Json(json!({ "agent": agent })))
}

/// `POST /discover`: query the discovery endpoints, then list every agent.
pub async fn discover(State(state): State<Arc<AppState>>) -> Json<Value> {
    let report = state.conductor.discover().await;
    Json(json!({
        "agents": state.conductor.registry().list(),
        "registered": report.registered,
        "failed": report.failed,
    }))
}

// ── Delegation ──────────────────────────────────────────────────────────

/// Task payload of a delegation: plain text or a full request.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum DelegatedTask {
    /// Just the message.
    Text(String),
    /// A full task request.
    Request(TaskRequest),
}

impl DelegatedTask {
    fn into_request(self) -> TaskRequest {
        match self {
            DelegatedTask::Text(message) => TaskRequest::new(message),
            DelegatedTask::Request(request) => request,
        }
    }
}

/// Body of `POST /delegate`.
#[derive(Debug, Deserialize)]
pub struct DelegateRequest {
    /// Delegating agent.
    pub from: Option<String>,
    /// Agent that should run the task; must be healthy.
    pub to: Option<String>,
    /// Task to run.
    pub task: Option<DelegatedTask>,
}

/// Provenance attached to a delegated task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delegation {
    /// Agent that handed the task over.
    pub delegated_by: String,
    /// Agent that received it.
    pub delegated_to: String,
    /// When the handover happened.
    pub delegated_at: DateTime<Utc>,
}

/// `POST /delegate`: run a task on a named agent on behalf of another.
pub async fn delegate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DelegateRequest>, JsonRejection>,
) -> ApiResult {
    let body = parse_body(payload)?;
    let from = require_name(body.from, "from")?;
    let to = require_name(body.to, "to")?;
    let request = require(body.task, "task")?.into_request();
    if request.message.trim().is_empty() {
        return Err(ApiError::validation("missing required field: task"));
    }
    resolve_pair(&state, &from, &to)?;

    let delegation = Delegation {
        delegated_by: from,
        delegated_to: to.clone(),
        delegated_at: Utc::now(),
    };
    let mut task = Task::from_request(request).with_target(&to);
    task.metadata.insert(
        "delegation".to_string(),
        serde_json::to_value(&delegation).map_err(ConductorError::from)?,
    );
    info!(
        task_id = %task.id,
        from = %delegation.delegated_by,
        to = %delegation.delegated_to,
        "Delegating task"
    );

    let outcome = state.conductor.dispatch(task, &to).await?;
    Ok(Json(json!({
        "success": outcome.success,
        "taskId": outcome.task_id,
        "status": outcome.status,
        "result": outcome.output,
        "error": outcome.error,
        "delegation": delegation,
    })))
}

// ── Communication ───────────────────────────────────────────────────────

/// Message exchanged between two agents.
#[derive(Debug, Deserialize)]
pub struct AgentMessage {
    /// One of `query`, `request`, `inform` or `response`.
    #[serde(rename = "type")]
    pub message_type: Option<String>,
    /// Payload; non-string content is forwarded as its JSON text.
    #[serde(default)]
    pub content: Value,
    /// Forwarded to the target under `communication.metadata`.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Body of `POST /communicate`.
#[derive(Debug, Deserialize)]
pub struct CommunicateRequest {
    /// Sending agent.
    pub from: Option<String>,
    /// Receiving agent.
    pub to: Option<String>,
    /// The message itself.
    pub message: Option<AgentMessage>,
}

/// `POST /communicate`: queries and requests are forwarded to the target as
/// tasks; informs and responses are only acknowledged.
pub async fn communicate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CommunicateRequest>, JsonRejection>,
) -> ApiResult {
    let body = parse_body(payload)?;
    let from = require_name(body.from, "from")?;
    let to = require_name(body.to, "to")?;
    let message = require(body.message, "message")?;
    let message_type = require_name(message.message_type, "message.type")?;

    match message_type.as_str() {
        "query" | "request" => {
            resolve_pair(&state, &from, &to)?;
            let text = match &message.content {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let mut task = Task::new(text).with_target(&to);
            task.metadata.insert(
                "communication".to_string(),
                json!({
                    "from": from,
                    "type": message_type,
                    "metadata": message.metadata,
                }),
            );
            info!(task_id = %task.id, from = %from, to = %to, kind = %message_type, "Forwarding message");
            let outcome = state.conductor.dispatch(task, &to).await?;
            Ok(Json(json!({
                "success": outcome.success,
                "type": message_type,
                "taskId": outcome.task_id,
                "result": outcome.output,
                "error": outcome.error,
            })))
        }
        "inform" | "response" => {
            lookup(&state, &from)?;
            lookup(&state, &to)?;
            info!(from = %from, to = %to, kind = %message_type, "Message acknowledged");
            Ok(Json(json!({
                "success": true,
                "type": message_type,
                "acknowledged": true,
                "receivedAt": Utc::now(),
            })))
        }
        other => Ok(Json(json!({
            "success": false,
            "error": format!("Unknown message type '{other}': expected query, request, inform or response"),
        }))),
    }
}

// ── Negotiation ─────────────────────────────────────────────────────────

/// Body of `POST /negotiate`.
#[derive(Debug, Deserialize)]
pub struct NegotiateBody {
    /// Requesting agent.
    pub from: Option<String>,
    /// Capabilities every candidate must have.
    pub requirements: Option<Vec<String>>,
    /// Ranking hints.
    #[serde(default)]
    pub preferences: Preferences,
}

/// `POST /negotiate`: rank the agents able to meet the requirements.
pub async fn negotiate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NegotiateBody>, JsonRejection>,
) -> ApiResult {
    let body = parse_body(payload)?;
    let request = NegotiationRequest {
        from: require_name(body.from, "from")?,
        requirements: require(body.requirements, "requirements")?,
        preferences: body.preferences,
    };
    let conductor = &state.conductor;
    let outcome = conductor
        .selector()
        .negotiate(&conductor.registry().snapshot(), &request);
    Ok(Json(serde_json::to_value(outcome).map_err(ConductorError::from)?))
}

// ── Tasks ───────────────────────────────────────────────────────────────

/// `POST /tasks`
pub async fn submit_task(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TaskRequest>, JsonRejection>,
) -> ApiResult {
    let request = parse_body(payload)?;
    let outcome = state.conductor.submit(request).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(ConductorError::from)?))
}

/// `GET /tasks/{id}`: a polled task or a running orchestration.
pub async fn get_task(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult {
    let conductor = &state.conductor;
    if let Some(tracked) = conductor.poller().get(id).await {
        return Ok(Json(json!({ "task": tracked })));
    }
    if let Some(orchestration) = conductor.orchestrator().state(id) {
        return Ok(Json(json!({ "orchestration": orchestration })));
    }
    Err(ConductorError::TaskNotFound(id).into())
}

/// `DELETE /tasks/{id}`. Idempotent: an unknown or already finished task
/// reports `"outcome": "notFound"`.
pub async fn cancel_task(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Json<Value> {
    let outcome = state.conductor.cancel(id).await;
    if outcome == CancelOutcome::NotFound {
        debug!(task_id = %id, "Nothing to cancel");
    }
    Json(json!({ "success": true, "taskId": id, "outcome": outcome }))
}

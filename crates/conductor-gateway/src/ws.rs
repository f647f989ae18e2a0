//! WebSocket event stream.
//!
//! Every connection subscribes to the event bus on connect and receives each
//! lifecycle event as a JSON text frame. Clients may also send requests; each
//! is handled on its own task so a long-running submission does not hold up
//! the stream.

use crate::connection::{Connection, ConnectionSink};
use crate::server::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use conductor_core::{ConductorError, ConductorResult, TaskRequest};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Requests a client may send over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Submit a task routed by the selector.
    #[serde(rename = "message")]
    Message {
        /// Task text.
        content: String,
        /// Capabilities the chosen agent must have.
        #[serde(default)]
        capabilities: Vec<String>,
    },
    /// Submit a task to a named agent.
    #[serde(rename = "message:agent")]
    AgentMessage {
        /// Target agent.
        agent: String,
        /// Task text.
        content: String,
    },
    /// Re-run discovery against the configured endpoints.
    #[serde(rename = "agents:discover")]
    Discover,
    /// List registered agents.
    #[serde(rename = "agents:list")]
    ListAgents,
    /// Describe one agent.
    #[serde(rename = "agent:info")]
    AgentInfo {
        /// Agent name.
        name: String,
    },
    /// Snapshot of system metrics.
    #[serde(rename = "system:metrics")]
    Metrics,
    /// Submit a compound task for orchestration.
    #[serde(rename = "workflow:execute")]
    Workflow {
        /// Task text.
        content: String,
        /// Capabilities every subtask agent must have.
        #[serde(default)]
        capabilities: Vec<String>,
    },
}

/// Upgrade `/ws` and stream bus events to the client.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    let session_id = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state
        .connections
        .add(Connection {
            id: connection_id,
            session_id,
            tx: tx.clone(),
        })
        .await;

    let welcome = json!({
        "type": "connected",
        "sessionId": session_id,
        "connectionId": connection_id,
    });
    let _ = tx.send(welcome.to_string());

    let events = state.conductor.events();
    events.subscribe_session(session_id, Arc::new(ConnectionSink::new(tx.clone())));
    info!(connection_id = %connection_id, session_id = %session_id, "WebSocket connected");

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_state = Arc::clone(&state);
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let state = Arc::clone(&recv_state);
                    let tx = tx.clone();
                    let text = text.to_string();
                    tokio::spawn(async move {
                        let reply = respond(&state, session_id, &text).await;
                        let _ = tx.send(reply.to_string());
                    });
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    events.unsubscribe_session(session_id);
    state.connections.remove(connection_id).await;
    info!(connection_id = %connection_id, "WebSocket disconnected");
}

/// Answer one client frame. Failures become `{"type": "error"}` frames.
async fn respond(state: &AppState, session_id: Uuid, text: &str) -> Value {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "Unreadable client message");
            return json!({"type": "error", "error": format!("invalid message: {e}")});
        }
    };
    match handle_client_message(state, session_id, message).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Client request failed");
            json!({"type": "error", "error": e.to_string()})
        }
    }
}

async fn handle_client_message(
    state: &AppState,
    session_id: Uuid,
    message: ClientMessage,
) -> ConductorResult<Value> {
    let conductor = &state.conductor;
    match message {
        ClientMessage::Message {
            content,
            capabilities,
        } => {
            let request = TaskRequest {
                required_capabilities: capabilities,
                session_id: Some(session_id),
                ..TaskRequest::new(content)
            };
            let outcome = conductor.submit(request).await?;
            Ok(json!({"type": "message:response", "outcome": outcome}))
        }
        ClientMessage::AgentMessage { agent, content } => {
            let request = TaskRequest {
                session_id: Some(session_id),
                ..TaskRequest::for_agent(content, agent)
            };
            let outcome = conductor.submit(request).await?;
            Ok(json!({"type": "message:response", "outcome": outcome}))
        }
        ClientMessage::Discover => {
            let report = conductor.discover().await;
            Ok(json!({
                "type": "agents:discovered",
                "registered": report.registered,
                "failed": report.failed,
                "agents": conductor.registry().list(),
            }))
        }
        ClientMessage::ListAgents => Ok(json!({
            "type": "agents:list",
            "agents": conductor.registry().list(),
        })),
        ClientMessage::AgentInfo { name } => {
            let agent = conductor
                .registry()
                .get(&name)
                .ok_or(ConductorError::AgentNotFound(name))?;
            Ok(json!({"type": "agent:info", "agent": agent}))
        }
        ClientMessage::Metrics => Ok(json!({
            "type": "system:metrics",
            "metrics": conductor.metrics().await,
            "connections": state.connections.connection_count().await,
        })),
        ClientMessage::Workflow {
            content,
            capabilities,
        } => {
            let request = TaskRequest {
                required_capabilities: capabilities,
                compound: true,
                session_id: Some(session_id),
                ..TaskRequest::new(content)
            };
            let outcome = conductor.submit(request).await?;
            Ok(json!({"type": "workflow:result", "outcome": outcome}))
        }
    }
}

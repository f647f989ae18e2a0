#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use conductor_agents::{AgentRegistry, LocalAgent};
use conductor_core::{
    AgentDescriptor, ConductorError, ConductorResult, EventBus, HealthStatus,
};
use conductor_gateway::{AuthConfig, GatewayServer};
use conductor_orchestrator::{
    Conductor, ConductorSettings, GenerationProvider, GenerationRequest, TrackedTask,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Provider that is never reachable; only compound tasks would need it.
struct OfflineProvider;

#[async_trait]
impl GenerationProvider for OfflineProvider {
    async fn generate(&self, _request: &GenerationRequest) -> ConductorResult<serde_json::Value> {
        Err(ConductorError::Provider("offline".into()))
    }
}

/// Helper: build a test server on a random port, returning the address.
async fn start_test_server(auth: AuthConfig) -> (String, Arc<Conductor>) {
    let registry = Arc::new(AgentRegistry::new(Arc::new(EventBus::new())));
    let conductor = Arc::new(
        Conductor::new(registry, Arc::new(OfflineProvider), ConductorSettings::default()).unwrap(),
    );
    let app = GatewayServer::build_with_auth(Arc::clone(&conductor), auth);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let addr_str = format!("127.0.0.1:{}", addr.port());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Small yield to let the server task start
    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr_str, conductor)
}

fn add_agent(conductor: &Conductor, name: &str, caps: &[&str], healthy: bool) -> Arc<LocalAgent> {
    let agent = Arc::new(LocalAgent::echo(
        AgentDescriptor::new(name, "assistant").with_capabilities(caps.iter().copied()),
    ));
    conductor.registry().register(agent.clone()).unwrap();
    let status = if healthy {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    };
    conductor
        .registry()
        .set_health(name, status, None)
        .unwrap();
    agent
}

/// Connect to WebSocket, return (ws_stream, session id from welcome).
async fn connect_ws(addr: &str) -> (WsStream, String) {
    let url = format!("ws://{addr}/ws");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["type"], "connected");
    let session_id = welcome["sessionId"].as_str().unwrap().to_string();
    (ws, session_id)
}

async fn next_json(ws: &mut WsStream) -> serde_json::Value {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    serde_json::from_str(&msg.into_text().unwrap()).unwrap()
}

/// Read frames until one with the given `type` arrives.
async fn next_of_type(ws: &mut WsStream, kind: &str) -> serde_json::Value {
    loop {
        let frame = next_json(ws).await;
        if frame["type"] == kind {
            return frame;
        }
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, _conductor) = start_test_server(AuthConfig::default()).await;
    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "conductor");
}

#[tokio::test]
async fn test_agent_card_is_static() {
    let (addr, _conductor) = start_test_server(AuthConfig::default()).await;
    let body: serde_json::Value = reqwest::get(format!("http://{addr}/.well-known/agent.json"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["name"], "conductor");
    assert_eq!(body["protocolVersion"], "1.0");
    assert_eq!(body["endpoints"]["delegate"], "/delegate");
}

#[tokio::test]
async fn test_submit_task_routes_by_capability() {
    let (addr, conductor) = start_test_server(AuthConfig::default()).await;
    add_agent(&conductor, "echoer", &["echo"], true);

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/tasks"))
        .json(&serde_json::json!({"message": "hello", "requiredCapabilities": ["echo"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["agent"], "echoer");
    assert_eq!(body["success"], true);
    assert_eq!(body["output"]["echo"], "hello");
}

#[tokio::test]
async fn test_submit_without_capable_agent_is_unavailable() {
    let (addr, conductor) = start_test_server(AuthConfig::default()).await;
    add_agent(&conductor, "echoer", &["echo"], true);

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/tasks"))
        .json(&serde_json::json!({"message": "hello", "requiredCapabilities": ["translate"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
}

#[tokio::test]
async fn test_delegate_to_unhealthy_agent_is_not_forwarded() {
    let (addr, conductor) = start_test_server(AuthConfig::default()).await;
    add_agent(&conductor, "planner", &[], true);
    let target = add_agent(&conductor, "writer", &[], false);

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/delegate"))
        .json(&serde_json::json!({"from": "planner", "to": "writer", "task": "draft it"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(target.processed_count(), 0);
}

#[tokio::test]
async fn test_delegate_records_provenance() {
    let (addr, conductor) = start_test_server(AuthConfig::default()).await;
    add_agent(&conductor, "planner", &[], true);
    let target = add_agent(&conductor, "writer", &[], true);

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/delegate"))
        .json(&serde_json::json!({
            "from": "planner",
            "to": "writer",
            "task": {"message": "draft it", "metadata": {"priority": "high"}}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["result"]["echo"], "draft it");
    assert_eq!(body["delegation"]["delegatedBy"], "planner");
    assert_eq!(body["delegation"]["delegatedTo"], "writer");
    assert!(body["delegation"]["delegatedAt"].is_string());
    assert_eq!(target.processed_count(), 1);
}

#[tokio::test]
async fn test_communicate_query_is_forwarded() {
    let (addr, conductor) = start_test_server(AuthConfig::default()).await;
    add_agent(&conductor, "a", &[], true);
    let target = add_agent(&conductor, "b", &[], true);

    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("http://{addr}/communicate"))
        .json(&serde_json::json!({
            "from": "a",
            "to": "b",
            "message": {"type": "query", "content": "status?"}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["type"], "query");
    assert_eq!(body["result"]["echo"], "status?");
    assert_eq!(target.processed_count(), 1);
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let (addr, _conductor) = start_test_server(AuthConfig::default()).await;
    let client = reqwest::Client::new();
    let id = uuid::Uuid::new_v4();

    let resp = client.get(format!("http://{addr}/tasks/{id}")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let (addr, conductor) = start_test_server(AuthConfig::default()).await;
    let client = reqwest::Client::new();
    let id = uuid::Uuid::new_v4();
    conductor
        .poller()
        .add_task(TrackedTask::new(id, "remote"))
        .await;

    let resp = client.delete(format!("http://{addr}/tasks/{id}")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["taskId"], id.to_string());
    assert_eq!(body["outcome"], "cancelled");
    assert!(conductor.poller().get(id).await.is_none());

    let resp = client.delete(format!("http://{addr}/tasks/{id}")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["outcome"], "notFound");
}

#[tokio::test]
async fn test_websocket_streams_bus_events() {
    let (addr, conductor) = start_test_server(AuthConfig::default()).await;
    let (mut ws, session_id) = connect_ws(&addr).await;
    assert!(!session_id.is_empty());

    add_agent(&conductor, "late", &["echo"], true);

    let registered = next_of_type(&mut ws, "agent:registered").await;
    assert_eq!(registered["agent"]["name"], "late");
    let healthy = next_of_type(&mut ws, "agent:healthy").await;
    assert_eq!(healthy["name"], "late");
}

#[tokio::test]
async fn test_websocket_client_requests() {
    let (addr, conductor) = start_test_server(AuthConfig::default()).await;
    add_agent(&conductor, "echoer", &["echo"], true);
    let (mut ws, _) = connect_ws(&addr).await;

    ws.send(Message::Text(r#"{"type":"agents:list"}"#.into()))
        .await
        .unwrap();
    let list = next_of_type(&mut ws, "agents:list").await;
    assert_eq!(list["agents"][0]["name"], "echoer");

    ws.send(Message::Text(
        r#"{"type":"message:agent","agent":"echoer","content":"ping"}"#.into(),
    ))
    .await
    .unwrap();
    let reply = next_of_type(&mut ws, "message:response").await;
    assert_eq!(reply["outcome"]["agent"], "echoer");
    assert_eq!(reply["outcome"]["output"]["echo"], "ping");

    ws.send(Message::Text(r#"{"type":"agent:info","name":"ghost"}"#.into()))
        .await
        .unwrap();
    let error = next_of_type(&mut ws, "error").await;
    assert!(error["error"].as_str().unwrap().contains("ghost"));

    ws.send(Message::Text(r#"{"type":"system:metrics"}"#.into()))
        .await
        .unwrap();
    let metrics = next_of_type(&mut ws, "system:metrics").await;
    assert_eq!(metrics["metrics"]["agents"], 1);
    assert_eq!(metrics["connections"], 1);
}

#[tokio::test]
async fn test_websocket_requires_key_when_auth_enabled() {
    let (addr, _conductor) = start_test_server(AuthConfig::new(vec!["secret".into()])).await;

    let denied = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await;
    assert!(denied.is_err());

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?api_key=secret"))
        .await
        .unwrap();
    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["type"], "connected");
}

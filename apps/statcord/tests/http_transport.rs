//! End-to-end posting against a local axum server standing in for Statcord.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value as JsonValue};

use cluster_statcord::{
    AgentConfig, ClusterId, CommandInvocation, GuildInfo, HttpTransport, StaticHost,
    StatcordClient, StatcordError,
};

#[derive(Debug, Clone, Default)]
struct Captured {
    requests: Arc<Mutex<Vec<(Option<String>, JsonValue)>>>,
}

type ServerState = (Captured, StatusCode, &'static str);

async fn clusters(
    State((captured, status, body)): State<ServerState>,
    headers: HeaderMap,
    raw: String,
) -> (StatusCode, &'static str) {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let json = serde_json::from_str(&raw).unwrap_or(JsonValue::Null);
    captured.requests.lock().push((content_type, json));
    (status, body)
}

/// Serve one canned response on `/v3/clusters`, returning the API root.
async fn spawn_server(status: StatusCode, body: &'static str) -> (String, Captured) {
    let captured = Captured::default();
    let app = Router::new()
        .route("/v3/clusters", post(clusters))
        .with_state((captured.clone(), status, body));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/v3/", addr), captured)
}

fn client_for(base_url: &str) -> StatcordClient {
    let config = AgentConfig::new("statcord.com-integration", ClusterId::Number(3))
        .with_base_url(base_url)
        .with_memory(false)
        .with_cpu(false)
        .with_bandwidth(false);
    let host = Arc::new(StaticHost::ready(
        "42",
        vec![GuildInfo::new("1", Some(7)), GuildInfo::new("2", Some(5))],
    ));
    StatcordClient::new(config, host).unwrap()
}

#[tokio::test]
async fn test_post_sends_json_body_to_clusters_endpoint() {
    let (base_url, captured) = spawn_server(StatusCode::OK, r#"{"ok":true}"#).await;
    let client = client_for(&base_url);
    client.command_run(&CommandInvocation::new("u1", "ping"));

    let response = client.post_data().await.unwrap();
    assert_eq!(response, json!({"ok": true}));

    let requests = captured.requests.lock().clone();
    assert_eq!(requests.len(), 1);

    let (content_type, body) = &requests[0];
    assert_eq!(content_type.as_deref(), Some("application/json"));
    assert_eq!(
        body,
        &json!({
            "id": "42",
            "key": "statcord.com-integration",
            "servers": "2",
            "users": "12",
            "commands": "1",
            "active": ["u1"],
            "popular": [{"name": "ping", "count": "1"}],
            "memactive": "0",
            "memload": "0",
            "cpuload": "0",
            "bandwidth": "0",
            "cluster_id": 3
        })
    );
}

#[tokio::test]
async fn test_empty_success_body_becomes_empty_object() {
    let (base_url, _) = spawn_server(StatusCode::OK, "").await;
    let response = client_for(&base_url).post_data().await.unwrap();
    assert_eq!(response, json!({}));
}

#[tokio::test]
async fn test_too_many_requests_reports_wait() {
    let (base_url, _) = spawn_server(StatusCode::TOO_MANY_REQUESTS, r#"{"wait": 5}"#).await;
    match client_for(&base_url).post_data().await {
        Err(StatcordError::RateLimited { wait_secs }) => assert_eq!(wait_secs, 5),
        other => panic!("expected rate limit, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_error_reports_status_and_body() {
    let (base_url, _) = spawn_server(StatusCode::INTERNAL_SERVER_ERROR, "boom").await;
    match client_for(&base_url).post_data().await {
        Err(StatcordError::RequestFailed { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "boom");
        }
        other => panic!("expected request failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_endpoint_is_a_transport_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client_for(&format!("http://{}/v3/", addr));
    client.command_run(&CommandInvocation::new("u1", "ping"));

    let err = client.post_data().await.unwrap_err();
    assert_eq!(err.category(), "transport");
    assert!(err.is_recoverable());
    // fire-and-forget: the interval is gone
    assert_eq!(client.counters().pending_commands(), 0);
}

#[test]
fn test_transport_resolves_clusters_endpoint() {
    let config = AgentConfig::new("key", "eu-1").with_base_url("https://example.com/api/v3");
    let transport = HttpTransport::new(&config).unwrap();
    assert_eq!(transport.endpoint().as_str(), "https://example.com/api/v3/clusters");
}

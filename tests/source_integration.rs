//! Source and HTTP action integration tests against an in-process axum server.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use livedoc_core::actions::executor::MAX_ACTION_RESPONSE_BYTES;
use livedoc_core::actions::{ActionExecutor, ActionOutcome, ExecutorSettings};
use livedoc_core::resilience::{CircuitState, Resilience};
use livedoc_core::source::rest::{ERROR_EXCERPT_BYTES, MAX_RESPONSE_BYTES};
use livedoc_core::source::{GraphqlSource, RestSource, Source};
use livedoc_core::types::{
    ActionConfig, CircuitBreakerConfig, ErrorKind, RetryConfig, SourceConfig, SourceType,
};
use livedoc_core::{Context, Error};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Default)]
struct Hits {
    flaky: Arc<AtomicUsize>,
    down: Arc<AtomicUsize>,
    huge: Arc<AtomicUsize>,
}

async fn items() -> Json<Value> {
    Json(json!({"data": {"items": [{"id": 1}, {"id": 2}]}}))
}

async fn no_items() -> Json<Value> {
    Json(json!({"data": {"total": 0}}))
}

async fn flaky(State(hits): State<Hits>) -> (StatusCode, Json<Value>) {
    if hits.flaky.fetch_add(1, Ordering::SeqCst) < 2 {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "warming up"})));
    }
    (StatusCode::OK, Json(json!([{"ok": true}])))
}

async fn down(State(hits): State<Hits>) -> (StatusCode, &'static str) {
    hits.down.fetch_add(1, Ordering::SeqCst);
    (StatusCode::INTERNAL_SERVER_ERROR, "database unavailable")
}

async fn huge(State(hits): State<Hits>) -> String {
    hits.huge.fetch_add(1, Ordering::SeqCst);
    "x".repeat(MAX_RESPONSE_BYTES + 1)
}

async fn long_error() -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, "e".repeat(ERROR_EXCERPT_BYTES * 5))
}

async fn big_hook() -> String {
    "y".repeat(MAX_ACTION_RESPONSE_BYTES * 2)
}

async fn echo(headers: HeaderMap, Query(query): Query<HashMap<String, String>>) -> Json<Value> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    Json(json!({"auth": auth, "query": query}))
}

async fn graphql(Json(request): Json<Value>) -> Json<Value> {
    let query = request["query"].as_str().unwrap_or_default();
    if query.contains("broken") {
        return Json(json!({"errors": [{"message": "Cannot query field \"broken\""}]}));
    }
    Json(json!({
        "data": {"users": {"nodes": [
            {"name": "ada", "team": request["variables"]["team"]},
            {"name": "bob", "team": request["variables"]["team"]}
        ]}}
    }))
}

async fn hook(Path(id): Path<String>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    (StatusCode::CREATED, Json(json!({"id": id, "received": body})))
}

/// Helper: serve the test routes on a random port.
async fn start_server() -> (SocketAddr, Hits) {
    let hits = Hits::default();
    let app = Router::new()
        .route("/items", get(items))
        .route("/no-items", get(no_items))
        .route("/flaky", get(flaky))
        .route("/down", get(down))
        .route("/echo", get(echo))
        .route("/graphql", post(graphql))
        .route("/hooks/{id}", post(hook))
        .route("/huge", get(huge).post(huge))
        .route("/long-error", get(long_error))
        .route("/big-hook", post(big_hook))
        .with_state(hits.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

fn fast_policy(label: &str, max_retries: u32, failure_threshold: u32) -> Resilience {
    Resilience::new(
        label,
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            enable_log: false,
        },
        CircuitBreakerConfig {
            failure_threshold,
            cooldown: Duration::from_secs(60),
        },
    )
}

fn rest(addr: SocketAddr, path: &str) -> SourceConfig {
    let mut cfg = SourceConfig::new(SourceType::Rest);
    cfg.from = Some(format!("http://{addr}{path}"));
    cfg
}

#[tokio::test]
async fn test_rest_result_path_keeps_order() {
    let (addr, _) = start_server().await;
    let mut cfg = rest(addr, "/items");
    cfg.result_path = Some("data.items".into());
    let source = RestSource::new("items", &cfg, fast_policy("items", 0, 5)).unwrap();

    let records = source.fetch(&Context::background()).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["id"], 1);
    assert_eq!(records[1]["id"], 2);
}

#[tokio::test]
async fn test_rest_missing_path_names_path() {
    let (addr, _) = start_server().await;
    let mut cfg = rest(addr, "/no-items");
    cfg.result_path = Some("data.items".into());
    let source = RestSource::new("items", &cfg, fast_policy("items", 3, 5)).unwrap();

    let err = source.fetch(&Context::background()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permanent);
    let message = err.to_string();
    assert!(message.contains("data.items"), "{message}");
    assert!(message.contains("not found"), "{message}");
}

#[tokio::test]
async fn test_rest_retries_transient_status() {
    let (addr, hits) = start_server().await;
    let source = RestSource::new("flaky", &rest(addr, "/flaky"), fast_policy("flaky", 3, 5)).unwrap();

    let records = source.fetch(&Context::background()).await.unwrap();
    assert_eq!(records[0]["ok"], true);
    assert_eq!(hits.flaky.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_rest_breaker_opens_after_exhausted_retries() {
    let (addr, hits) = start_server().await;
    let source = RestSource::new("down", &rest(addr, "/down"), fast_policy("down", 1, 1)).unwrap();
    let ctx = Context::background();

    let err = source.fetch(&ctx).await.unwrap_err();
    assert!(matches!(err, Error::RetriesExhausted { attempts: 2, .. }));
    assert!(err.to_string().contains("HTTP 500: database unavailable"));
    assert_eq!(hits.down.load(Ordering::SeqCst), 2);

    let err = source.fetch(&ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    assert_eq!(hits.down.load(Ordering::SeqCst), 2);
    assert_eq!(source.health().unwrap().state, CircuitState::Open);
}

#[tokio::test]
async fn test_rest_env_expansion_and_query_merge() {
    std::env::set_var("LIVEDOC_IT_TOKEN", "s3cret-token");
    let (addr, _) = start_server().await;
    let mut cfg = rest(addr, "/echo?limit=10&page=2");
    cfg.headers
        .insert("Authorization".into(), "Bearer ${LIVEDOC_IT_TOKEN}".into());
    cfg.query_params.insert("limit".into(), "50".into());
    let source = RestSource::new("echo", &cfg, fast_policy("echo", 0, 5)).unwrap();

    let records = source.fetch(&Context::background()).await.unwrap();
    assert_eq!(records[0]["auth"], "Bearer s3cret-token");
    assert_eq!(records[0]["query"], json!({"limit": "50", "page": "2"}));

    let debug = format!("{source:?}");
    assert!(!debug.contains("s3cret-token"), "{debug}");
}

#[tokio::test]
async fn test_graphql_extracts_nodes() {
    let (addr, _) = start_server().await;
    let mut cfg = SourceConfig::new(SourceType::Graphql);
    cfg.from = Some(format!("http://{addr}/graphql"));
    cfg.query = Some("query($team: String) { users(team: $team) { nodes { name } } }".into());
    cfg.variables = Some(json!({"team": "core"}));
    cfg.result_path = Some("users.nodes".into());
    let source = GraphqlSource::new("users", &cfg, fast_policy("users", 0, 5)).unwrap();

    let records = source.fetch(&Context::background()).await.unwrap();
    let names: Vec<_> = records.iter().map(|r| r["name"].clone()).collect();
    assert_eq!(names, vec![json!("ada"), json!("bob")]);
    assert_eq!(records[0]["team"], "core");
}

#[tokio::test]
async fn test_graphql_errors_are_permanent() {
    let (addr, _) = start_server().await;
    let mut cfg = SourceConfig::new(SourceType::Graphql);
    cfg.from = Some(format!("http://{addr}/graphql"));
    cfg.query = Some("{ broken }".into());
    cfg.result_path = Some("users.nodes".into());
    let source = GraphqlSource::new("users", &cfg, fast_policy("users", 3, 5)).unwrap();

    let err = source.fetch(&Context::background()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permanent);
    assert!(err.to_string().contains("Cannot query field"));
}

#[tokio::test]
async fn test_http_action_posts_rendered_body() {
    let (addr, _) = start_server().await;
    let executor = ActionExecutor::new(ExecutorSettings {
        operator: "alice".into(),
        ..ExecutorSettings::default()
    });
    let config = ActionConfig {
        kind: "http".into(),
        url: Some(format!("http://{addr}/hooks/{{{{.id}}}}")),
        body: Some(r#"{"by": "{{.operator}}", "note": "{{.note}}"}"#.into()),
        ..Default::default()
    };
    let data = json!({"id": "42", "note": "shipped"});
    let Value::Object(data) = data else {
        unreachable!()
    };

    let outcome = executor
        .execute_config(&Context::background(), "notify", &config, data)
        .await
        .unwrap();
    let (status, body) = match outcome {
        ActionOutcome::Http { status, body } => (status, body),
        other => panic!("expected http outcome, got {other:?}"),
    };
    assert_eq!(status, 201);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(
        body,
        json!({"id": "42", "received": {"by": "alice", "note": "shipped"}})
    );
}

#[tokio::test]
async fn test_http_action_non_2xx_is_transient() {
    let (addr, _) = start_server().await;
    let executor = ActionExecutor::new(ExecutorSettings::default());
    let config = ActionConfig {
        kind: "rest".into(),
        url: Some(format!("http://{addr}/down")),
        method: Some("get".into()),
        ..Default::default()
    };
    let err = executor
        .execute_config(&Context::background(), "ping", &config, Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Http { status: 500, .. }));
    assert!(err.is_retryable());
}

/// Unwrap the last attempt's error from an exhausted retry loop.
fn last_error(err: Error) -> Error {
    match err {
        Error::RetriesExhausted { last, .. } => *last,
        other => other,
    }
}

#[tokio::test]
async fn test_rest_oversized_response_is_permanent() {
    let (addr, hits) = start_server().await;
    let source = RestSource::new("huge", &rest(addr, "/huge"), fast_policy("huge", 3, 5)).unwrap();

    let err = source.fetch(&Context::background()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permanent);
    assert!(err.to_string().contains("response exceeds"), "{err}");
    assert_eq!(hits.huge.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_graphql_oversized_response_is_permanent() {
    let (addr, hits) = start_server().await;
    let mut cfg = SourceConfig::new(SourceType::Graphql);
    cfg.from = Some(format!("http://{addr}/huge"));
    cfg.query = Some("{ users { nodes { name } } }".into());
    cfg.result_path = Some("users.nodes".into());
    let source = GraphqlSource::new("users", &cfg, fast_policy("users", 3, 5)).unwrap();

    let err = source.fetch(&Context::background()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permanent);
    assert!(err.to_string().contains("response exceeds"), "{err}");
    assert_eq!(hits.huge.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_error_body_is_truncated_to_excerpt() {
    let (addr, _) = start_server().await;
    let source = RestSource::new("loud", &rest(addr, "/long-error"), fast_policy("loud", 0, 5)).unwrap();

    let err = last_error(source.fetch(&Context::background()).await.unwrap_err());
    match err {
        Error::Http { status, body, .. } => {
            assert_eq!(status, 500);
            assert_eq!(body.len(), ERROR_EXCERPT_BYTES);
        }
        other => panic!("expected http error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_http_action_body_is_capped() {
    let (addr, _) = start_server().await;
    let executor = ActionExecutor::new(ExecutorSettings::default());
    let config = ActionConfig {
        kind: "http".into(),
        url: Some(format!("http://{addr}/big-hook")),
        ..Default::default()
    };

    let outcome = executor
        .execute_config(&Context::background(), "big", &config, Default::default())
        .await
        .unwrap();
    match outcome {
        ActionOutcome::Http { status, body } => {
            assert_eq!(status, 200);
            assert_eq!(body.len(), MAX_ACTION_RESPONSE_BYTES);
        }
        other => panic!("expected http outcome, got {other:?}"),
    }
}

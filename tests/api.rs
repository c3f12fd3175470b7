use apimux::app::{build_app, load_state_with_runtime, AppState, RuntimeConfig};
use apimux::health::HealthMonitor;
use apimux::keys::{CreateKeyInput, KeyLimits};
use apimux::logs::{LogQuery, RequestLog};
use apimux::registry::SourceRegistry;
use apimux::settings::RuntimeSettings;
use apimux::source::{AggregatorConfig, Capabilities, SourceConfig, SourceType};
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::Json;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const PROXY_KEY: &str = "static-test-key";
const ADMIN_KEY: &str = "admin-test-key";

// ---------- mock upstream ----------

#[derive(Clone)]
struct UpstreamState {
    chat_status: Arc<AtomicU16>,
    chat_delay_ms: u64,
    chat_text: String,
    sse_data: Vec<String>,
    send_done: bool,
    models_status: Arc<AtomicU16>,
    models_body: Value,
    chat_hits: Arc<AtomicUsize>,
    probe_hits: Arc<AtomicUsize>,
    last_chat_body: Arc<Mutex<Option<Value>>>,
    captured_headers: Arc<Mutex<Vec<(String, String)>>>,
}

fn upstream_defaults() -> UpstreamState {
    UpstreamState {
        chat_status: Arc::new(AtomicU16::new(200)),
        chat_delay_ms: 0,
        chat_text: "Hello from upstream".to_string(),
        sse_data: Vec::new(),
        send_done: true,
        models_status: Arc::new(AtomicU16::new(200)),
        models_body: json!({ "data": [] }),
        chat_hits: Arc::new(AtomicUsize::new(0)),
        probe_hits: Arc::new(AtomicUsize::new(0)),
        last_chat_body: Arc::new(Mutex::new(None)),
        captured_headers: Arc::new(Mutex::new(Vec::new())),
    }
}

fn capture_auth_headers(state: &UpstreamState, headers: &HeaderMap) {
    let mut captured = state.captured_headers.lock().unwrap();
    for name in ["authorization", "x-api-key", "anthropic-version"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            captured.push((name.to_string(), value.to_string()));
        }
    }
}

async fn mock_chat(
    State(state): State<UpstreamState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.chat_hits.fetch_add(1, Ordering::SeqCst);
    capture_auth_headers(&state, &headers);
    *state.last_chat_body.lock().unwrap() = Some(body.clone());

    if state.chat_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(state.chat_delay_ms)).await;
    }

    let status = state.chat_status.load(Ordering::SeqCst);
    if status != 200 {
        return (
            StatusCode::from_u16(status).unwrap(),
            Json(json!({ "error": { "message": "forced failure" } })),
        )
            .into_response();
    }

    let streaming = body
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if streaming && !state.sse_data.is_empty() {
        let mut events: Vec<Result<Event, Infallible>> = state
            .sse_data
            .iter()
            .map(|data| Ok(Event::default().data(data.clone())))
            .collect();
        if state.send_done {
            events.push(Ok(Event::default().data("[DONE]")));
        }
        return Sse::new(futures_util::stream::iter(events)).into_response();
    }

    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("mock")
        .to_string();
    Json(json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "created": 1700000000,
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": state.chat_text },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 3, "completion_tokens": 5, "total_tokens": 8 }
    }))
    .into_response()
}

async fn mock_models(State(state): State<UpstreamState>, headers: HeaderMap) -> Response {
    state.probe_hits.fetch_add(1, Ordering::SeqCst);
    capture_auth_headers(&state, &headers);
    let status = state.models_status.load(Ordering::SeqCst);
    if status != 200 {
        return (StatusCode::from_u16(status).unwrap(), "probe down").into_response();
    }
    Json(state.models_body.clone()).into_response()
}

async fn start_upstream(state: UpstreamState) -> SocketAddr {
    let app = axum::Router::new()
        .route("/v1/chat/completions", post(mock_chat))
        .route("/v1/models", get(mock_models))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

// ---------- gateway context ----------

struct TestContext {
    state: AppState,
    app: axum::Router,
    _temp_dir: TempDir,
}

async fn build_context() -> TestContext {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("gateway.db");
    let runtime = RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        database_dsn: format!("sqlite://{}", db_path.display()),
        metrics_path: "/metrics".to_string(),
        api_key: PROXY_KEY.to_string(),
        admin_api_key: ADMIN_KEY.to_string(),
        sources_file: None,
    };
    let state = load_state_with_runtime(runtime).await.unwrap();
    let app = build_app(state.clone());
    TestContext {
        state,
        app,
        _temp_dir: temp_dir,
    }
}

fn source_config(
    id: &str,
    addr: SocketAddr,
    priority: i32,
    function_calling: bool,
    models: Vec<&str>,
) -> SourceConfig {
    SourceConfig {
        id: id.to_string(),
        name: id.to_string(),
        source_type: SourceType::Openai,
        base_url: format!("http://{addr}"),
        api_key: "sk-upstream".to_string(),
        priority,
        weight: 100,
        enabled: true,
        capabilities: Capabilities {
            function_calling,
            extended_thinking: false,
            vision: false,
            models: models.into_iter().map(String::from).collect(),
        },
        aggregator: None,
    }
}

async fn send_request(
    app: &axum::Router,
    method: &str,
    path: &str,
    token: Option<&str>,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, bytes.to_vec())
}

async fn send_json(
    app: &axum::Router,
    method: &str,
    path: &str,
    token: Option<&str>,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> (StatusCode, Value) {
    let (status, _, bytes) = send_request(app, method, path, token, headers, body).await;
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn chat_body(model: &str) -> Value {
    json!({
        "model": model,
        "messages": [{ "role": "user", "content": "hi" }]
    })
}

/// Stream log rows are written by the pump task after the response body
/// completes, so tests poll briefly.
async fn wait_for_logs(state: &AppState, expected: usize) -> Vec<RequestLog> {
    for _ in 0..40 {
        let logs = state.log_store.query(&LogQuery::default()).await.unwrap();
        if logs.len() >= expected {
            return logs;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("expected {expected} log rows");
}

// ---------- proxy plane ----------

#[tokio::test]
async fn happy_path_routes_by_priority() {
    let ctx = build_context().await;
    let up_a = upstream_defaults();
    let up_b = upstream_defaults();
    let addr_a = start_upstream(up_a.clone()).await;
    let addr_b = start_upstream(up_b.clone()).await;
    ctx.state
        .registry
        .add(source_config("src-a", addr_a, 1, true, vec!["gpt-4"]))
        .await
        .unwrap();
    ctx.state
        .registry
        .add(source_config("src-b", addr_b, 2, true, vec!["gpt-4"]))
        .await
        .unwrap();

    let (status, body) = send_json(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(PROXY_KEY),
        &[],
        Some(chat_body("gpt-4")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "Hello from upstream"
    );
    assert_eq!(up_a.chat_hits.load(Ordering::SeqCst), 1);
    assert_eq!(up_b.chat_hits.load(Ordering::SeqCst), 0);

    let logs = wait_for_logs(&ctx.state, 1).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].source_id, "src-a");
    assert!(logs[0].success);
    assert!(logs[0].failover_from.is_empty());
    assert_eq!(logs[0].total_tokens, 8);
}

#[tokio::test]
async fn failover_moves_to_next_source() {
    let ctx = build_context().await;
    let up_a = upstream_defaults();
    up_a.chat_status.store(500, Ordering::SeqCst);
    let up_b = upstream_defaults();
    let addr_a = start_upstream(up_a.clone()).await;
    let addr_b = start_upstream(up_b.clone()).await;
    ctx.state
        .registry
        .add(source_config("src-a", addr_a, 1, true, vec!["gpt-4"]))
        .await
        .unwrap();
    ctx.state
        .registry
        .add(source_config("src-b", addr_b, 2, true, vec!["gpt-4"]))
        .await
        .unwrap();

    let (status, body) = send_json(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(PROXY_KEY),
        &[],
        Some(chat_body("gpt-4")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "Hello from upstream"
    );
    assert_eq!(up_a.chat_hits.load(Ordering::SeqCst), 1);
    assert_eq!(up_b.chat_hits.load(Ordering::SeqCst), 1);

    let logs = wait_for_logs(&ctx.state, 1).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].source_id, "src-b");
    assert_eq!(logs[0].failover_from, "src-a");
    assert!(logs[0].success);

    // The failed attempt left its mark on src-a's status.
    let src_a = ctx.state.registry.get("src-a").unwrap();
    assert_eq!(src_a.status().error_count, 1);
}

#[tokio::test]
async fn no_source_tried_twice_when_all_fail() {
    let ctx = build_context().await;
    let up_a = upstream_defaults();
    up_a.chat_status.store(503, Ordering::SeqCst);
    let up_b = upstream_defaults();
    up_b.chat_status.store(503, Ordering::SeqCst);
    let addr_a = start_upstream(up_a.clone()).await;
    let addr_b = start_upstream(up_b.clone()).await;
    ctx.state
        .registry
        .add(source_config("src-a", addr_a, 1, true, vec!["gpt-4"]))
        .await
        .unwrap();
    ctx.state
        .registry
        .add(source_config("src-b", addr_b, 2, true, vec!["gpt-4"]))
        .await
        .unwrap();

    let (status, body) = send_json(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(PROXY_KEY),
        &[],
        Some(chat_body("gpt-4")),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "all_sources_failed");
    // Default retry budget is 3 attempts, but only two distinct sources
    // exist; neither may be attempted twice.
    assert_eq!(up_a.chat_hits.load(Ordering::SeqCst), 1);
    assert_eq!(up_b.chat_hits.load(Ordering::SeqCst), 1);

    let logs = wait_for_logs(&ctx.state, 1).await;
    assert_eq!(logs.len(), 1);
    assert!(!logs[0].success);
}

#[tokio::test]
async fn client_errors_do_not_fail_over() {
    let ctx = build_context().await;
    let up_a = upstream_defaults();
    up_a.chat_status.store(400, Ordering::SeqCst);
    let up_b = upstream_defaults();
    let addr_a = start_upstream(up_a.clone()).await;
    let addr_b = start_upstream(up_b.clone()).await;
    ctx.state
        .registry
        .add(source_config("src-a", addr_a, 1, true, vec!["gpt-4"]))
        .await
        .unwrap();
    ctx.state
        .registry
        .add(source_config("src-b", addr_b, 2, true, vec!["gpt-4"]))
        .await
        .unwrap();

    let (status, body) = send_json(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(PROXY_KEY),
        &[],
        Some(chat_body("gpt-4")),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "upstream_error");
    assert_eq!(up_b.chat_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn terminal_upstream_status_is_surfaced_verbatim() {
    let ctx = build_context().await;
    let up_a = upstream_defaults();
    up_a.chat_status.store(404, Ordering::SeqCst);
    let up_b = upstream_defaults();
    let addr_a = start_upstream(up_a.clone()).await;
    let addr_b = start_upstream(up_b.clone()).await;
    ctx.state
        .registry
        .add(source_config("src-a", addr_a, 1, true, vec!["gpt-4"]))
        .await
        .unwrap();
    ctx.state
        .registry
        .add(source_config("src-b", addr_b, 2, true, vec!["gpt-4"]))
        .await
        .unwrap();

    let (status, body) = send_json(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(PROXY_KEY),
        &[],
        Some(chat_body("gpt-4")),
    )
    .await;

    // 404 is terminal and passed through as-is, not mapped to 502.
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "upstream_error");
    assert_eq!(up_b.chat_hits.load(Ordering::SeqCst), 0);

    let logs = wait_for_logs(&ctx.state, 1).await;
    assert_eq!(logs[0].status_code, 404);
    assert!(!logs[0].success);
}

#[tokio::test]
async fn stream_forwards_chunks_and_logs_once() {
    let ctx = build_context().await;
    let mut up_a = upstream_defaults();
    up_a.sse_data = vec![
        json!({"id":"c1","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"}}]}).to_string(),
        json!({"id":"c1","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":"lo"}}]}).to_string(),
    ];
    // Upstream drops before [DONE]: the client stream terminates and no
    // other source is tried.
    up_a.send_done = false;
    let up_b = upstream_defaults();
    let addr_a = start_upstream(up_a.clone()).await;
    let addr_b = start_upstream(up_b.clone()).await;
    ctx.state
        .registry
        .add(source_config("src-a", addr_a, 1, true, vec!["gpt-4"]))
        .await
        .unwrap();
    ctx.state
        .registry
        .add(source_config("src-b", addr_b, 2, true, vec!["gpt-4"]))
        .await
        .unwrap();

    let mut body = chat_body("gpt-4");
    body["stream"] = json!(true);
    let (status, headers, bytes) = send_request(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(PROXY_KEY),
        &[],
        Some(body),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("text/event-stream"));
    let text = String::from_utf8(bytes).unwrap();
    assert!(text.contains("Hel"));
    assert!(text.contains("lo"));
    assert_eq!(up_b.chat_hits.load(Ordering::SeqCst), 0);

    let logs = wait_for_logs(&ctx.state, 1).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].source_id, "src-a");
    assert!(logs[0].stream);
    assert!(logs[0].success);
}

#[tokio::test]
async fn stream_emits_done_when_upstream_finishes() {
    let ctx = build_context().await;
    let mut up_a = upstream_defaults();
    up_a.sse_data = vec![
        json!({"id":"c1","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":"hi"}}]}).to_string(),
    ];
    let addr_a = start_upstream(up_a.clone()).await;
    ctx.state
        .registry
        .add(source_config("src-a", addr_a, 1, true, vec!["gpt-4"]))
        .await
        .unwrap();

    let mut body = chat_body("gpt-4");
    body["stream"] = json!(true);
    let (status, _, bytes) = send_request(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(PROXY_KEY),
        &[],
        Some(body),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(bytes).unwrap();
    assert!(text.contains("data: [DONE]"));
}

#[tokio::test]
async fn stream_log_captures_usage_from_final_chunk() {
    let ctx = build_context().await;
    let mut up = upstream_defaults();
    up.sse_data = vec![
        json!({"id":"c1","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"role":"assistant","content":"hi"}}]}).to_string(),
        json!({"id":"c1","object":"chat.completion.chunk","choices":[{"index":0,"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":4,"completion_tokens":9,"total_tokens":13}}).to_string(),
    ];
    let addr = start_upstream(up.clone()).await;
    ctx.state
        .registry
        .add(source_config("src-a", addr, 1, true, vec!["gpt-4"]))
        .await
        .unwrap();

    let mut body = chat_body("gpt-4");
    body["stream"] = json!(true);
    let (status, _, _) = send_request(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(PROXY_KEY),
        &[],
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let logs = wait_for_logs(&ctx.state, 1).await;
    assert!(logs[0].stream);
    assert_eq!(logs[0].prompt_tokens, 4);
    assert_eq!(logs[0].completion_tokens, 9);
    assert_eq!(logs[0].total_tokens, 13);
}

#[tokio::test]
async fn concurrent_limit_rejects_second_in_flight_request() {
    let ctx = build_context().await;
    let mut up = upstream_defaults();
    up.chat_delay_ms = 300;
    let addr = start_upstream(up.clone()).await;
    ctx.state
        .registry
        .add(source_config("src-a", addr, 1, true, vec!["gpt-4"]))
        .await
        .unwrap();

    let key = ctx
        .state
        .key_store
        .create(CreateKeyInput {
            name: "limited".to_string(),
            limits: KeyLimits {
                concurrent: 1,
                ..KeyLimits::default()
            },
            allowed_tools: Vec::new(),
        })
        .await
        .unwrap();

    let first = send_json(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(&key.key),
        &[],
        Some(chat_body("gpt-4")),
    );
    let second = async {
        // Let the first request win the slot.
        tokio::time::sleep(Duration::from_millis(50)).await;
        send_json(
            &ctx.app,
            "POST",
            "/v1/chat/completions",
            Some(&key.key),
            &[],
            Some(chat_body("gpt-4")),
        )
        .await
    };
    let ((status_a, _), (status_b, body_b)) = tokio::join!(first, second);

    assert_eq!(status_a, StatusCode::OK);
    assert_eq!(status_b, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_b["error"]["code"], "rate_limit_exceeded");

    // Both requests finished; the slot must be free again.
    let (status_c, _) = send_json(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(&key.key),
        &[],
        Some(chat_body("gpt-4")),
    )
    .await;
    assert_eq!(status_c, StatusCode::OK);
}

#[tokio::test]
async fn tool_quota_limits_detected_tool() {
    let ctx = build_context().await;
    let up = upstream_defaults();
    let addr = start_upstream(up.clone()).await;
    ctx.state
        .registry
        .add(source_config("src-a", addr, 1, true, vec!["gpt-4"]))
        .await
        .unwrap();

    let mut limits = KeyLimits {
        rpm: 100,
        daily_quota: 100,
        ..KeyLimits::default()
    };
    limits.tool_quotas.insert("cursor".to_string(), 1);
    let key = ctx
        .state
        .key_store
        .create(CreateKeyInput {
            name: "tooled".to_string(),
            limits,
            allowed_tools: Vec::new(),
        })
        .await
        .unwrap();

    let cursor_ua = [("user-agent", "Cursor/0.42 (darwin)")];
    let (status_1, _) = send_json(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(&key.key),
        &cursor_ua,
        Some(chat_body("gpt-4")),
    )
    .await;
    assert_eq!(status_1, StatusCode::OK);

    let (status_2, body_2) = send_json(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(&key.key),
        &cursor_ua,
        Some(chat_body("gpt-4")),
    )
    .await;
    assert_eq!(status_2, StatusCode::TOO_MANY_REQUESTS);
    assert!(body_2["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Tool quota exceeded"));

    // The rejected call did not consume the global quotas: a different
    // tool still gets through.
    let (status_3, _) = send_json(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(&key.key),
        &[("user-agent", "claude-code/1.0")],
        Some(chat_body("gpt-4")),
    )
    .await;
    assert_eq!(status_3, StatusCode::OK);
}

#[tokio::test]
async fn fc_compat_projects_tool_call_from_plain_text() {
    let ctx = build_context().await;
    let mut up = upstream_defaults();
    up.chat_text =
        "```json\n{\"tool_call\":{\"name\":\"get_weather\",\"arguments\":{\"city\":\"NYC\"}}}\n```"
            .to_string();
    let addr = start_upstream(up.clone()).await;
    // The only available source cannot call tools natively.
    ctx.state
        .registry
        .add(source_config("src-c", addr, 1, false, vec!["gpt-4"]))
        .await
        .unwrap();

    let body = json!({
        "model": "gpt-4",
        "messages": [{ "role": "user", "content": "what's the weather in NYC?" }],
        "tools": [{ "type": "function", "function": {
            "name": "get_weather",
            "description": "Get weather",
            "parameters": { "type": "object", "properties": { "city": { "type": "string" } } }
        }}]
    });
    let (status, resp) = send_json(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(PROXY_KEY),
        &[],
        Some(body),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let choice = &resp["choices"][0];
    assert_eq!(choice["finish_reason"], "tool_calls");
    let call = &choice["message"]["tool_calls"][0];
    assert_eq!(call["type"], "function");
    assert_eq!(call["function"]["name"], "get_weather");
    assert_eq!(call["function"]["arguments"], "{\"city\":\"NYC\"}");

    // The upstream saw the rewritten request: non-stream, no tool fields,
    // synthesized system prompt first.
    let sent = up.last_chat_body.lock().unwrap().clone().unwrap();
    assert!(sent.get("tools").is_none());
    assert!(sent.get("tool_choice").is_none());
    assert_eq!(sent["messages"][0]["role"], "system");
    assert!(sent.get("stream").is_none());

    let logs = wait_for_logs(&ctx.state, 1).await;
    assert!(logs[0].fc_compat_used);
    assert!(logs[0].success);
}

#[tokio::test]
async fn fc_compat_synthesizes_stream_for_streaming_clients() {
    let ctx = build_context().await;
    let mut up = upstream_defaults();
    up.chat_text = "{\"final\":\"All done.\"}".to_string();
    let addr = start_upstream(up.clone()).await;
    ctx.state
        .registry
        .add(source_config("src-c", addr, 1, false, vec!["gpt-4"]))
        .await
        .unwrap();

    let body = json!({
        "model": "gpt-4",
        "stream": true,
        "messages": [{ "role": "user", "content": "hi" }],
        "tools": [{ "type": "function", "function": { "name": "noop" } }]
    });
    let (status, headers, bytes) = send_request(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(PROXY_KEY),
        &[],
        Some(body),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("text/event-stream"));

    let text = String::from_utf8(bytes).unwrap();
    let data_lines: Vec<&str> = text
        .lines()
        .filter(|line| line.starts_with("data: "))
        .collect();
    // Exactly two chunks plus the [DONE] sentinel.
    assert_eq!(data_lines.len(), 3);
    assert!(data_lines[0].contains("All done."));
    assert!(data_lines[1].contains("finish_reason"));
    assert_eq!(data_lines[2], "data: [DONE]");

    // The upstream call itself was non-stream.
    let sent = up.last_chat_body.lock().unwrap().clone().unwrap();
    assert!(sent.get("stream").is_none());
}

#[tokio::test]
async fn request_id_is_echoed_and_logged() {
    let ctx = build_context().await;
    let up = upstream_defaults();
    let addr = start_upstream(up.clone()).await;
    ctx.state
        .registry
        .add(source_config("src-a", addr, 1, true, vec!["gpt-4"]))
        .await
        .unwrap();

    let (status, headers, _) = send_request(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(PROXY_KEY),
        &[("x-request-id", "req-fixed-42")],
        Some(chat_body("gpt-4")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("req-fixed-42")
    );
    let logs = wait_for_logs(&ctx.state, 1).await;
    assert_eq!(logs[0].request_id, "req-fixed-42");
}

// ---------- authentication ----------

#[tokio::test]
async fn missing_and_invalid_tokens_are_rejected() {
    let ctx = build_context().await;

    let (status, body) = send_json(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        None,
        &[],
        Some(chat_body("gpt-4")),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "missing_api_key");

    let (status, body) = send_json(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some("nope"),
        &[],
        Some(chat_body("gpt-4")),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "invalid_api_key");
    assert_eq!(body["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn disabled_key_and_disallowed_tool_are_forbidden() {
    let ctx = build_context().await;

    let key = ctx
        .state
        .key_store
        .create(CreateKeyInput {
            name: "restricted".to_string(),
            limits: KeyLimits::default(),
            allowed_tools: vec!["claude-code".to_string()],
        })
        .await
        .unwrap();

    // Wrong tool for a tool-restricted key.
    let (status, body) = send_json(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(&key.key),
        &[("user-agent", "Cursor/0.42")],
        Some(chat_body("gpt-4")),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "tool_not_allowed");

    ctx.state.key_store.set_enabled(&key.id, false).await.unwrap();
    let (status, body) = send_json(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(&key.key),
        &[("user-agent", "claude-code/1.0")],
        Some(chat_body("gpt-4")),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "key_disabled");
}

// ---------- models & health ----------

#[tokio::test]
async fn models_endpoint_unions_healthy_sources() {
    let ctx = build_context().await;
    let up = upstream_defaults();
    let addr = start_upstream(up).await;
    ctx.state
        .registry
        .add(source_config("src-a", addr, 1, true, vec!["gpt-4", "gpt-4o"]))
        .await
        .unwrap();
    ctx.state
        .registry
        .add(source_config("src-b", addr, 2, true, vec!["gpt-4", "claude-3"]))
        .await
        .unwrap();

    let (status, body) = send_json(
        &ctx.app,
        "GET",
        "/v1/models",
        Some(PROXY_KEY),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let mut ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["claude-3", "gpt-4", "gpt-4o"]);
}

#[tokio::test]
async fn health_state_machine_flips_on_threshold() {
    let registry = Arc::new(SourceRegistry::detached());
    let settings = Arc::new(tokio::sync::RwLock::new(RuntimeSettings::default()));
    let monitor = HealthMonitor::new(registry.clone(), settings, reqwest::Client::new());

    let up = upstream_defaults();
    up.models_status.store(500, Ordering::SeqCst);
    let addr = start_upstream(up.clone()).await;
    let src = registry
        .add(source_config("src-a", addr, 1, true, vec!["gpt-4"]))
        .await
        .unwrap();

    let timeout = Duration::from_secs(2);
    monitor.check_source(&src, 2, timeout).await;
    assert!(src.is_healthy(), "one failure below threshold stays healthy");
    assert_eq!(src.status().consecutive_fail, 1);
    assert!(!src.status().last_error.is_empty());

    monitor.check_source(&src, 2, timeout).await;
    assert!(!src.is_healthy(), "threshold reached flips to unhealthy");
    assert_eq!(src.status().error_count, 2);

    up.models_status.store(200, Ordering::SeqCst);
    monitor.check_source(&src, 2, timeout).await;
    assert!(src.is_healthy(), "one success recovers");
    assert_eq!(src.status().consecutive_fail, 0);
    assert!(src.status().last_error.is_empty());
    assert!(src.status().last_check.is_some());
}

#[tokio::test]
async fn probe_sends_source_type_auth_headers() {
    let registry = Arc::new(SourceRegistry::detached());
    let settings = Arc::new(tokio::sync::RwLock::new(RuntimeSettings::default()));
    let monitor = HealthMonitor::new(registry.clone(), settings, reqwest::Client::new());

    // Anthropic: x-api-key + anthropic-version.
    let up = upstream_defaults();
    let addr = start_upstream(up.clone()).await;
    let mut cfg = source_config("src-anthropic", addr, 1, true, vec![]);
    cfg.source_type = SourceType::Anthropic;
    cfg.api_key = "ak-test".to_string();
    let src = registry.add(cfg).await.unwrap();
    monitor.test_connection(&src).await.unwrap();
    {
        let captured = up.captured_headers.lock().unwrap();
        assert!(captured.contains(&("x-api-key".to_string(), "ak-test".to_string())));
        assert!(captured.contains(&("anthropic-version".to_string(), "2023-06-01".to_string())));
    }

    // Aggregator without a credential sends no Authorization at all.
    let up2 = upstream_defaults();
    let addr2 = start_upstream(up2.clone()).await;
    let mut cfg2 = source_config("src-agg", addr2, 1, false, vec![]);
    cfg2.source_type = SourceType::Cpa;
    cfg2.api_key = String::new();
    cfg2.aggregator = Some(AggregatorConfig {
        providers: vec!["gemini".to_string()],
        account_mode: "multi".to_string(),
        auto_detect: false,
    });
    let src2 = registry.add(cfg2).await.unwrap();
    monitor.test_connection(&src2).await.unwrap();
    {
        let captured = up2.captured_headers.lock().unwrap();
        assert!(captured.iter().all(|(name, _)| name != "authorization"));
    }
}

#[tokio::test]
async fn aggregator_auto_detect_uses_a_single_probe() {
    let registry = Arc::new(SourceRegistry::detached());
    let settings = Arc::new(tokio::sync::RwLock::new(RuntimeSettings::default()));
    let monitor = HealthMonitor::new(registry.clone(), settings, reqwest::Client::new());

    let mut up = upstream_defaults();
    up.models_body = json!({ "data": [
        { "id": "gemini-2.0-flash", "provider": "gemini" },
        { "id": "claude-3.5-sonnet", "provider": "claude" },
        { "id": "qwen-72b", "provider": "qwen" }
    ]});
    let addr = start_upstream(up.clone()).await;

    let mut cfg = source_config("src-agg", addr, 1, false, vec![]);
    cfg.source_type = SourceType::Cpa;
    cfg.api_key = String::new();
    cfg.aggregator = Some(AggregatorConfig {
        providers: vec!["gemini".to_string(), "claude".to_string()],
        account_mode: "multi".to_string(),
        auto_detect: true,
    });
    let src = registry.add(cfg).await.unwrap();

    monitor.check_source(&src, 3, Duration::from_secs(2)).await;

    assert_eq!(up.probe_hits.load(Ordering::SeqCst), 1, "probe and detection share one request");
    assert!(src.is_healthy());

    let caps = src.capabilities();
    let mut models = caps.models.clone();
    models.sort_unstable();
    assert_eq!(models, vec!["claude-3.5-sonnet", "gemini-2.0-flash"]);
    assert!(caps.function_calling);
    assert!(caps.vision);
    assert!(!caps.extended_thinking);

    assert_eq!(
        src.provider_for_model("gemini-2.0-flash").as_deref(),
        Some("gemini")
    );
    // qwen is not an enabled provider; its model was dropped.
    assert!(src.provider_for_model("qwen-72b").is_none());
}

#[tokio::test]
async fn aggregator_with_disabled_provider_yields_no_route() {
    let ctx = build_context().await;
    let mut up = upstream_defaults();
    up.models_body = json!({ "data": [
        { "id": "gemini-2.0-flash", "provider": "gemini" }
    ]});
    let addr = start_upstream(up.clone()).await;

    let mut cfg = source_config("src-agg", addr, 1, false, vec![]);
    cfg.source_type = SourceType::Cpa;
    cfg.api_key = String::new();
    cfg.aggregator = Some(AggregatorConfig {
        providers: vec!["gemini".to_string()],
        account_mode: "multi".to_string(),
        auto_detect: true,
    });
    let src = ctx.state.registry.add(cfg).await.unwrap();
    ctx.state
        .monitor
        .check_source(&src, 3, Duration::from_secs(2))
        .await;

    // qwen-72b was never detected, so the aggregator's model filter
    // excludes it and routing comes up empty.
    let body = json!({
        "model": "qwen-72b",
        "messages": [{ "role": "user", "content": "hi" }],
        "tools": [{ "type": "function", "function": { "name": "noop" } }]
    });
    let (status, resp) = send_json(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(PROXY_KEY),
        &[],
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp["error"]["code"], "all_sources_failed");
}

// ---------- admin plane ----------

#[tokio::test]
async fn admin_requires_its_own_key() {
    let ctx = build_context().await;

    let (status, _) = send_json(&ctx.app, "GET", "/api/sources", None, &[], None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send_json(&ctx.app, "GET", "/api/sources", Some(PROXY_KEY), &[], None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) =
        send_json(&ctx.app, "GET", "/api/sources", Some(ADMIN_KEY), &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn admin_source_crud_round_trip() {
    let ctx = build_context().await;

    let (status, created) = send_json(
        &ctx.app,
        "POST",
        "/api/sources",
        Some(ADMIN_KEY),
        &[],
        Some(json!({
            "name": "primary",
            "type": "openai",
            "base_url": "http://127.0.0.1:9",
            "api_key": "sk-secret",
            "capabilities": { "function_calling": true, "models": ["gpt-4"] }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["data"]["id"].as_str().unwrap().to_string();
    // The secret never appears in admin responses.
    assert!(created["data"].get("api_key").is_none());

    let (status, fetched) = send_json(
        &ctx.app,
        "GET",
        &format!("/api/sources/{id}"),
        Some(ADMIN_KEY),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["data"]["name"], "primary");
    assert_eq!(fetched["data"]["status"]["state"], "healthy");

    // Update without a secret keeps the stored one.
    let (status, _) = send_json(
        &ctx.app,
        "PUT",
        &format!("/api/sources/{id}"),
        Some(ADMIN_KEY),
        &[],
        Some(json!({
            "name": "renamed",
            "type": "openai",
            "base_url": "http://127.0.0.1:9",
            "capabilities": { "function_calling": true, "models": ["gpt-4"] }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let src = ctx.state.registry.get(&id).unwrap();
    assert_eq!(src.name, "renamed");
    assert_eq!(src.api_key, "sk-secret");

    let (status, _) = send_json(
        &ctx.app,
        "DELETE",
        &format!("/api/sources/{id}"),
        Some(ADMIN_KEY),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(ctx.state.registry.get(&id).is_none());
}

#[tokio::test]
async fn admin_key_lifecycle() {
    let ctx = build_context().await;

    let (status, created) = send_json(
        &ctx.app,
        "POST",
        "/api/keys",
        Some(ADMIN_KEY),
        &[],
        Some(json!({
            "name": "ci-key",
            "limits": { "rpm": 10, "daily_quota": 100 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["data"]["id"].as_str().unwrap().to_string();
    let secret = created["data"]["key"].as_str().unwrap().to_string();
    assert!(secret.starts_with("sk-apimux-"));

    let (_, rotated) = send_json(
        &ctx.app,
        "POST",
        &format!("/api/keys/{id}/rotate"),
        Some(ADMIN_KEY),
        &[],
        None,
    )
    .await;
    let new_secret = rotated["data"]["key"].as_str().unwrap().to_string();
    assert_ne!(secret, new_secret);
    assert_eq!(rotated["data"]["id"], id.as_str());

    let (_, blocked) = send_json(
        &ctx.app,
        "PUT",
        &format!("/api/keys/{id}/block"),
        Some(ADMIN_KEY),
        &[],
        None,
    )
    .await;
    assert_eq!(blocked["data"]["enabled"], false);

    let (_, unblocked) = send_json(
        &ctx.app,
        "PUT",
        &format!("/api/keys/{id}/unblock"),
        Some(ADMIN_KEY),
        &[],
        None,
    )
    .await;
    assert_eq!(unblocked["data"]["enabled"], true);

    // The old secret is gone after rotation.
    assert!(ctx
        .state
        .key_store
        .get_by_secret(&secret)
        .await
        .unwrap()
        .is_none());
    assert!(ctx
        .state
        .key_store
        .get_by_secret(&new_secret)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn settings_update_hot_swaps_strategy() {
    let ctx = build_context().await;
    assert_eq!(ctx.state.router.strategy().as_str(), "priority");

    let (status, body) = send_json(
        &ctx.app,
        "PUT",
        "/api/config",
        Some(ADMIN_KEY),
        &[],
        Some(json!({
            "route_strategy": "least-latency",
            "failover_enabled": false,
            "max_retries": 2,
            "stream_retry_before_first_chunk": false,
            "health_enabled": true,
            "health_interval_seconds": 60,
            "health_timeout_seconds": 10,
            "health_failure_threshold": 3,
            "auto_ban_threshold": 50,
            "auto_ban_minutes": 30,
            "upstream_timeout_seconds": 300,
            "log_retention_days": 7
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["route_strategy"], "least-latency");

    assert_eq!(ctx.state.router.strategy().as_str(), "least-latency");
    assert!(!ctx.state.settings.read().await.failover_enabled);

    // Persisted: a reload sees the new values.
    let reloaded = ctx.state.settings_store.load().await.unwrap();
    assert_eq!(reloaded.route_strategy.as_str(), "least-latency");
    assert!(!reloaded.failover_enabled);
}

#[tokio::test]
async fn disabled_failover_stops_after_first_attempt() {
    let ctx = build_context().await;
    {
        let mut settings = ctx.state.settings.write().await;
        settings.failover_enabled = false;
    }

    let up_a = upstream_defaults();
    up_a.chat_status.store(502, Ordering::SeqCst);
    let up_b = upstream_defaults();
    let addr_a = start_upstream(up_a.clone()).await;
    let addr_b = start_upstream(up_b.clone()).await;
    ctx.state
        .registry
        .add(source_config("src-a", addr_a, 1, true, vec!["gpt-4"]))
        .await
        .unwrap();
    ctx.state
        .registry
        .add(source_config("src-b", addr_b, 2, true, vec!["gpt-4"]))
        .await
        .unwrap();

    let (status, _) = send_json(
        &ctx.app,
        "POST",
        "/v1/chat/completions",
        Some(PROXY_KEY),
        &[],
        Some(chat_body("gpt-4")),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(up_a.chat_hits.load(Ordering::SeqCst), 1);
    assert_eq!(up_b.chat_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn ping_and_metrics_respond() {
    let ctx = build_context().await;

    let (status, body) = send_json(&ctx.app, "GET", "/ping", None, &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _, _) = send_request(&ctx.app, "GET", "/metrics", None, &[], None).await;
    assert_eq!(status, StatusCode::OK);
}

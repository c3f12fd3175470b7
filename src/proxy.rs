use crate::app::AppState;
use crate::authn::{ClientInfo, RequestGuard, SharedReleaseGuard};
use crate::chat::{ChatCompletionRequest, ChatCompletionResponse, Usage};
use crate::error::AppError;
use crate::fc_compat;
use crate::health::read_limited;
use crate::logs::RequestLog;
use crate::settings::RuntimeSettings;
use crate::source::{HealthState, Source, SourceType};
use crate::translator::translate_request;
use axum::extract::{Extension, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const ERROR_BODY_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub message: String,
}

impl UpstreamCallError {
    fn network(message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::Network,
            status: None,
            message: message.into(),
        }
    }

    fn http(status: Option<StatusCode>, message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::Http,
            status,
            message: message.into(),
        }
    }
}

/// Transient failures worth a failover attempt: transport errors,
/// timeouts, throttling, server-side errors.
pub fn is_retryable_error(err: &UpstreamCallError) -> bool {
    if err.kind == UpstreamErrorKind::Network {
        return true;
    }
    match err.status {
        Some(status) => {
            status.is_server_error()
                || status == StatusCode::REQUEST_TIMEOUT
                || status == StatusCode::TOO_MANY_REQUESTS
        }
        None => false,
    }
}

/// Caller mistakes (bad parameters, bad credentials) that no other
/// source will fix.
pub fn is_non_retryable_client_error(err: &UpstreamCallError) -> bool {
    matches!(
        err.status,
        Some(StatusCode::BAD_REQUEST)
            | Some(StatusCode::UNAUTHORIZED)
            | Some(StatusCode::FORBIDDEN)
            | Some(StatusCode::UNPROCESSABLE_ENTITY)
    )
}

/// Source-type-appropriate auth headers for egress calls.
pub fn upstream_auth(builder: reqwest::RequestBuilder, src: &Source) -> reqwest::RequestBuilder {
    match src.source_type {
        SourceType::Anthropic => builder
            .header("x-api-key", &src.api_key)
            .header("anthropic-version", "2023-06-01"),
        SourceType::Cpa => {
            if src.api_key.is_empty() {
                builder
            } else {
                builder.bearer_auth(&src.api_key)
            }
        }
        _ => builder.bearer_auth(&src.api_key),
    }
}

async fn send_completion(
    client: &reqwest::Client,
    src: &Source,
    body: &ChatCompletionRequest,
    timeout: Option<Duration>,
) -> Result<reqwest::Response, UpstreamCallError> {
    let url = format!("{}/v1/chat/completions", src.base_url.trim_end_matches('/'));
    let mut builder = client.post(url).json(body);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    let resp = upstream_auth(builder, src)
        .send()
        .await
        .map_err(|e| UpstreamCallError::network(e.to_string()))?;

    let status = resp.status();
    if status != StatusCode::OK {
        let body = read_limited(resp, ERROR_BODY_LIMIT).await;
        return Err(UpstreamCallError::http(
            Some(status),
            format!("status {}: {}", status.as_u16(), body),
        ));
    }
    Ok(resp)
}

pub async fn call_upstream(
    client: &reqwest::Client,
    src: &Source,
    body: &ChatCompletionRequest,
    timeout: Duration,
) -> Result<ChatCompletionResponse, UpstreamCallError> {
    let resp = send_completion(client, src, body, Some(timeout)).await?;
    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| UpstreamCallError::network(e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| {
        UpstreamCallError::http(Some(status), format!("invalid upstream response: {e}"))
    })
}

/// Records one attempt's result onto the source status, mirroring the
/// health monitor's state machine.
fn apply_attempt_result(src: &Source, latency_ms: i64, error: Option<&str>, threshold: u32) {
    let mut status = src.status();
    status.latency_ms = latency_ms;
    status.last_check = Some(Utc::now());
    match error {
        Some(message) => {
            status.consecutive_fail += 1;
            status.error_count += 1;
            status.last_error = message.to_string();
            if status.consecutive_fail >= threshold {
                status.state = HealthState::Unhealthy;
            }
        }
        None => {
            status.consecutive_fail = 0;
            status.state = HealthState::Healthy;
        }
    }
    src.set_status(status);
}

fn base_log(req: &ChatCompletionRequest, client_info: &ClientInfo, request_id: &str) -> RequestLog {
    let mut log = RequestLog::new(req.model.clone());
    log.request_id = request_id.to_string();
    log.has_tools = req.has_tools();
    log.has_thinking = req.has_thinking();
    log.stream = req.stream;
    log.client_ip = client_info.ip.clone();
    log.client_tool = client_info.tool.clone();
    log.api_key_id = client_info.key_id.clone();
    log
}

async fn persist_log(state: &AppState, log: RequestLog) {
    if let Err(err) = state.log_store.insert(&log).await {
        tracing::warn!(error = %err, "request log write failed");
    }
}

/// Armed for the lifetime of a proxied request: if the client disconnects
/// and the handler future is dropped mid-flight, the drop still produces
/// the request's one log row. Disarmed once a terminal outcome has been
/// logged through the normal paths.
struct CancelLog {
    state: AppState,
    log: Option<RequestLog>,
    started: Instant,
}

impl CancelLog {
    fn arm(state: AppState, log: RequestLog, started: Instant) -> Self {
        Self {
            state,
            log: Some(log),
            started,
        }
    }

    fn disarm(&mut self) {
        self.log = None;
    }
}

impl Drop for CancelLog {
    fn drop(&mut self) {
        if let Some(mut log) = self.log.take() {
            log.error = "client disconnected".to_string();
            log.latency_ms = self.started.elapsed().as_millis() as i64;
            let store = self.state.log_store.clone();
            tokio::spawn(async move {
                if let Err(err) = store.insert(&log).await {
                    tracing::warn!(error = %err, "disconnect log write failed");
                }
            });
        }
    }
}

fn record_outcome(state: &AppState, client_info: &ClientInfo, success: bool) {
    if client_info.key_id.is_empty() {
        return;
    }
    if success {
        state.rate_limiter.record_success(&client_info.key_id);
    } else if state.rate_limiter.record_error(&client_info.key_id) {
        tracing::warn!(
            key_id = %client_info.key_id,
            "credential auto-banned after consecutive errors"
        );
    }
}

/// `POST /v1/chat/completions`. Drives the per-request lifecycle:
/// route, translate, forward (compat / stream / normal), failover.
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(client_info): Extension<ClientInfo>,
    Extension(RequestGuard(guard)): Extension<RequestGuard>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let req: ChatCompletionRequest = match serde_json::from_value(body) {
        Ok(req) => req,
        Err(err) => {
            return AppError::new(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                format!("Invalid request: {err}"),
            )
            .into_response();
        }
    };
    if req.model.trim().is_empty() {
        return AppError::new(StatusCode::BAD_REQUEST, "invalid_request", "missing model")
            .with_param("model")
            .into_response();
    }

    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let settings = state.settings.read().await.clone();
    let threshold = settings.health_failure_threshold.max(1);
    let started = Instant::now();

    let max_retries = if settings.failover_enabled {
        settings.max_retries
    } else {
        0
    };

    let mut cancel_log = CancelLog::arm(
        state.clone(),
        base_log(&req, &client_info, &request_id),
        started,
    );

    let mut tried: Vec<String> = Vec::new();
    let mut last_error = String::new();
    let mut last_source: Option<Arc<Source>> = None;

    for _ in 0..=max_retries {
        let Some(src) = state.router.route(&req, &tried) else {
            if last_error.is_empty() {
                last_error = "no available source".to_string();
            }
            break;
        };
        tried.push(src.id.clone());
        last_source = Some(src.clone());
        let failover_from = if tried.len() > 1 {
            tried[0].clone()
        } else {
            String::new()
        };

        let translated = translate_request(&req, &src);
        let attempt_started = Instant::now();
        let use_compat = req.has_tools() && !src.supports_fc_for_model(&req.model);

        let result = if use_compat {
            attempt_compat(
                &state,
                &req,
                &translated,
                &src,
                &client_info,
                &request_id,
                &settings,
                started,
                &failover_from,
                guard.clone(),
            )
            .await
        } else if req.stream {
            attempt_stream(
                &state,
                &req,
                &translated,
                &src,
                &client_info,
                &request_id,
                &settings,
                started,
                &failover_from,
                guard.clone(),
            )
            .await
        } else {
            attempt_normal(
                &state,
                &req,
                &translated,
                &src,
                &client_info,
                &request_id,
                &settings,
                started,
                &failover_from,
            )
            .await
        };

        match result {
            Ok(response) => {
                cancel_log.disarm();
                return response;
            }
            Err(err) => {
                let attempt_ms = attempt_started.elapsed().as_millis() as i64;
                apply_attempt_result(&src, attempt_ms, Some(&err.message), threshold);

                if !is_retryable_error(&err) {
                    let status_out = err.status.unwrap_or(StatusCode::BAD_GATEWAY);
                    let mut log = base_log(&req, &client_info, &request_id);
                    log.source_id = src.id.clone();
                    log.source_name = src.name.clone();
                    log.success = false;
                    log.status_code = status_out.as_u16();
                    log.latency_ms = started.elapsed().as_millis() as i64;
                    log.error = err.message.clone();
                    log.failover_from = failover_from;
                    cancel_log.disarm();
                    persist_log(&state, log).await;
                    record_outcome(&state, &client_info, false);
                    metrics::counter!("apimux_requests_total", "outcome" => "upstream_error")
                        .increment(1);

                    return AppError::new(
                        status_out,
                        "upstream_error",
                        format!("source {} failed", src.name),
                    )
                    .with_type("upstream_error")
                    .into_response();
                }

                tracing::warn!(
                    source = %src.name,
                    error = %err.message,
                    "attempt failed, trying next source"
                );
                last_error = format!("source {} failed", src.name);
            }
        }
    }

    // Retry budget exhausted or nothing routable.
    let mut log = base_log(&req, &client_info, &request_id);
    if let Some(src) = &last_source {
        log.source_id = src.id.clone();
        log.source_name = src.name.clone();
    }
    log.success = false;
    log.status_code = 500;
    log.latency_ms = started.elapsed().as_millis() as i64;
    log.error = last_error.clone();
    log.failover_from = if tried.len() > 1 {
        tried[0].clone()
    } else {
        String::new()
    };
    cancel_log.disarm();
    persist_log(&state, log).await;
    record_outcome(&state, &client_info, false);
    metrics::counter!("apimux_requests_total", "outcome" => "all_sources_failed").increment(1);

    AppError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "all_sources_failed",
        format!("All sources failed: {last_error}"),
    )
    .with_type("upstream_error")
    .into_response()
}

#[allow(clippy::too_many_arguments)]
async fn attempt_normal(
    state: &AppState,
    req: &ChatCompletionRequest,
    translated: &ChatCompletionRequest,
    src: &Arc<Source>,
    client_info: &ClientInfo,
    request_id: &str,
    settings: &RuntimeSettings,
    started: Instant,
    failover_from: &str,
) -> Result<Response, UpstreamCallError> {
    let timeout = Duration::from_secs(settings.upstream_timeout_seconds.max(1));
    let attempt_started = Instant::now();
    let upstream = call_upstream(&state.http, src, translated, timeout).await?;
    apply_attempt_result(
        src,
        attempt_started.elapsed().as_millis() as i64,
        None,
        settings.health_failure_threshold.max(1),
    );

    let mut log = base_log(req, client_info, request_id);
    log.source_id = src.id.clone();
    log.source_name = src.name.clone();
    log.success = true;
    log.status_code = 200;
    log.latency_ms = started.elapsed().as_millis() as i64;
    log.failover_from = failover_from.to_string();
    if let Some(usage) = &upstream.usage {
        log.prompt_tokens = usage.prompt_tokens;
        log.completion_tokens = usage.completion_tokens;
        log.total_tokens = usage.total_tokens;
    }
    persist_log(state, log).await;
    record_outcome(state, client_info, true);
    metrics::counter!("apimux_requests_total", "outcome" => "success").increment(1);

    Ok(Json(upstream).into_response())
}

#[allow(clippy::too_many_arguments)]
async fn attempt_compat(
    state: &AppState,
    req: &ChatCompletionRequest,
    translated: &ChatCompletionRequest,
    src: &Arc<Source>,
    client_info: &ClientInfo,
    request_id: &str,
    settings: &RuntimeSettings,
    started: Instant,
    failover_from: &str,
    guard: Option<SharedReleaseGuard>,
) -> Result<Response, UpstreamCallError> {
    let compat_req = fc_compat::build_compat_request(req, translated)
        .map_err(|e| UpstreamCallError::http(None, e))?;

    let timeout = Duration::from_secs(settings.upstream_timeout_seconds.max(1));
    let attempt_started = Instant::now();
    let upstream = call_upstream(&state.http, src, &compat_req, timeout).await?;
    apply_attempt_result(
        src,
        attempt_started.elapsed().as_millis() as i64,
        None,
        settings.health_failure_threshold.max(1),
    );

    let resp = fc_compat::build_compat_response(&upstream);

    let mut log = base_log(req, client_info, request_id);
    log.source_id = src.id.clone();
    log.source_name = src.name.clone();
    log.success = true;
    log.status_code = 200;
    log.latency_ms = started.elapsed().as_millis() as i64;
    log.failover_from = failover_from.to_string();
    log.fc_compat_used = true;
    if let Some(usage) = &upstream.usage {
        log.prompt_tokens = usage.prompt_tokens;
        log.completion_tokens = usage.completion_tokens;
        log.total_tokens = usage.total_tokens;
    }
    persist_log(state, log).await;
    record_outcome(state, client_info, true);
    metrics::counter!("apimux_requests_total", "outcome" => "success").increment(1);

    if req.stream {
        let mut events: Vec<Event> = fc_compat::compat_stream_chunks(&resp)
            .iter()
            .filter_map(|chunk| serde_json::to_string(chunk).ok())
            .map(|data| Event::default().data(data))
            .collect();
        events.push(Event::default().data("[DONE]"));
        let stream = futures_util::stream::iter(events.into_iter().map(move |event| {
            let _hold = &guard;
            Ok::<_, Infallible>(event)
        }));
        return Ok(Sse::new(stream).into_response());
    }

    Ok(Json(resp).into_response())
}

#[allow(clippy::too_many_arguments)]
async fn attempt_stream(
    state: &AppState,
    req: &ChatCompletionRequest,
    translated: &ChatCompletionRequest,
    src: &Arc<Source>,
    client_info: &ClientInfo,
    request_id: &str,
    settings: &RuntimeSettings,
    started: Instant,
    failover_from: &str,
    guard: Option<SharedReleaseGuard>,
) -> Result<Response, UpstreamCallError> {
    // Streams run without an aggregate deadline: total time is bounded by
    // the upstream's pace and client disconnect.
    let attempt_started = Instant::now();
    let resp = send_completion(&state.http, src, translated, None).await?;
    let mut events = resp.bytes_stream().eventsource();

    let mut first_event = None;
    if settings.stream_retry_before_first_chunk {
        match events.next().await {
            Some(Ok(ev)) => first_event = Some(ev),
            Some(Err(err)) => return Err(UpstreamCallError::network(err.to_string())),
            None => {
                return Err(UpstreamCallError::network(
                    "stream ended before first chunk",
                ));
            }
        }
    }

    // Committed: from here the stream is never retried on another source.
    apply_attempt_result(
        src,
        attempt_started.elapsed().as_millis() as i64,
        None,
        settings.health_failure_threshold.max(1),
    );

    let mut log = base_log(req, client_info, request_id);
    log.source_id = src.id.clone();
    log.source_name = src.name.clone();
    log.success = true;
    log.status_code = 200;
    log.failover_from = failover_from.to_string();

    let (tx, rx) = mpsc::channel::<Event>(64);
    let pump_state = state.clone();
    let pump_client = client_info.clone();
    let source_name = src.name.clone();

    tokio::spawn(async move {
        let _hold = guard;
        let mut pending = first_event;
        let mut usage: Option<Usage> = None;
        loop {
            let item = match pending.take() {
                Some(ev) => Some(Ok(ev)),
                None => events.next().await,
            };
            match item {
                Some(Ok(ev)) => {
                    if ev.data.trim() == "[DONE]" {
                        let _ = tx.send(Event::default().data("[DONE]")).await;
                        break;
                    }
                    // Most providers attach usage only to the last chunk;
                    // keep whatever the latest frame reported.
                    if ev.data.contains("\"usage\"") {
                        if let Some(u) = extract_chunk_usage(&ev.data) {
                            usage = Some(u);
                        }
                    }
                    // A failed send means the client went away; stop
                    // pulling from the upstream immediately.
                    if tx.send(Event::default().data(ev.data)).await.is_err() {
                        tracing::debug!(source = %source_name, "client disconnected mid-stream");
                        break;
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(
                        source = %source_name,
                        error = %err,
                        "upstream stream ended early"
                    );
                    break;
                }
                None => break,
            }
        }

        log.latency_ms = started.elapsed().as_millis() as i64;
        if let Some(usage) = usage {
            log.prompt_tokens = usage.prompt_tokens;
            log.completion_tokens = usage.completion_tokens;
            log.total_tokens = usage.total_tokens;
        }
        persist_log(&pump_state, log).await;
        record_outcome(&pump_state, &pump_client, true);
        metrics::counter!("apimux_requests_total", "outcome" => "success").increment(1);
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Ok(Sse::new(stream).into_response())
}

/// Usage reported inside a stream chunk, when the upstream includes it.
fn extract_chunk_usage(data: &str) -> Option<Usage> {
    let chunk: Value = serde_json::from_str(data).ok()?;
    let usage = chunk.get("usage")?;
    if usage.is_null() {
        return None;
    }
    serde_json::from_value(usage.clone()).ok()
}

/// `GET /v1/models`. Union of model ids contributed by healthy sources.
pub async fn list_models(State(state): State<AppState>) -> Response {
    let created = Utc::now().timestamp();
    let data: Vec<Value> = state
        .registry
        .healthy_model_ids()
        .into_iter()
        .map(|(id, source_type)| {
            json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": source_type.as_str()
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data })).into_response()
}

pub async fn ping() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

use crate::app::AppState;
use crate::error::AppError;
use crate::ratelimit::{AdmissionDenied, ReleaseGuard};
use crate::tooldetect::detect_tool;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

/// Per-request identity attached after authentication. `key_id` is empty
/// for legacy single-key auth.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub key_id: String,
    pub tool: String,
    pub ip: String,
}

/// The request's concurrency-slot guard, shared through extensions so a
/// streaming handler can keep the slot held for its stream's lifetime.
/// Empty when the credential carries no concurrency limit.
#[derive(Clone, Default)]
pub struct RequestGuard(pub Option<Arc<ReleaseGuard>>);

pub fn extract_client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let auth = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    // Accept a bare token for clients that skip the Bearer prefix.
    Some(auth.strip_prefix("Bearer ").unwrap_or(auth))
}

/// Authentication + admission for the proxy plane. Admission runs here,
/// before the handler, so a concurrency cap cannot be bypassed by any
/// handler-side composition. The release guard is shared through request
/// extensions: streaming handlers clone it into their response stream so
/// the slot stays held until the stream is drained or dropped.
pub async fn proxy_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let tool = detect_tool(req.headers());
    let ip = extract_client_ip(req.headers());

    let static_key = state.runtime.api_key.clone();
    if static_key.is_empty() {
        req.extensions_mut().insert(ClientInfo {
            key_id: String::new(),
            tool,
            ip,
        });
        req.extensions_mut().insert(RequestGuard::default());
        return next.run(req).await;
    }

    let Some(token) = bearer_token(req.headers()).map(str::to_string) else {
        return AppError::unauthorized("missing_api_key", "Missing Authorization header")
            .into_response();
    };

    let lookup = state.key_store.get_by_secret(&token).await;
    let key = match lookup {
        Ok(key) => key,
        Err(err) => return AppError::store(err).into_response(),
    };

    if let Some(key) = key {
        if !key.enabled {
            return AppError::forbidden("key_disabled", "API key is disabled").into_response();
        }

        if !key.allowed_tools.is_empty() && !key.allowed_tools.iter().any(|t| t == &tool) {
            return AppError::forbidden("tool_not_allowed", "Tool not allowed for this API key")
                .into_response();
        }

        let guard = match state.rate_limiter.enter(&key.id, &key.limits, &tool) {
            Ok(guard) => Arc::new(guard),
            Err(AdmissionDenied::AutoBanned { remaining }) => {
                return AppError::forbidden(
                    "key_auto_banned",
                    format!(
                        "API key auto-banned due to excessive errors, remaining: {}s",
                        remaining.as_secs()
                    ),
                )
                .into_response();
            }
            Err(AdmissionDenied::Limited { reason }) => {
                return AppError::new(StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded", reason)
                    .into_response();
            }
        };

        let key_store = state.key_store.clone();
        let key_id = key.id.clone();
        tokio::spawn(async move {
            if let Err(err) = key_store.touch_last_used(&key_id).await {
                tracing::warn!(key_id = %key_id, error = %err, "last-used update failed");
            }
        });

        req.extensions_mut().insert(ClientInfo {
            key_id: key.id.clone(),
            tool,
            ip,
        });
        req.extensions_mut().insert(RequestGuard(Some(guard.clone())));

        let response = next.run(req).await;
        // This clone drops here; a streaming handler's clone keeps the
        // slot held until its stream finishes.
        drop(guard);
        return response;
    }

    if token != static_key {
        return AppError::unauthorized("invalid_api_key", "Invalid API key").into_response();
    }

    req.extensions_mut().insert(ClientInfo {
        key_id: String::new(),
        tool,
        ip,
    });
    req.extensions_mut().insert(RequestGuard::default());
    next.run(req).await
}

/// Static-key check for the admin surface.
pub async fn admin_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let admin_key = state.runtime.admin_api_key.clone();
    if admin_key.is_empty() {
        return next.run(req).await;
    }

    let Some(token) = bearer_token(req.headers()) else {
        return AppError::unauthorized("missing_api_key", "Missing Authorization header")
            .into_response();
    };
    if token != admin_key {
        return AppError::unauthorized("invalid_api_key", "Invalid API key").into_response();
    }
    next.run(req).await
}

pub type SharedReleaseGuard = Arc<ReleaseGuard>;

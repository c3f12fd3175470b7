use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::keys::{CreateKeyInput, UpdateKeyInput};
use crate::logs::LogQuery;
use crate::settings::RuntimeSettings;
use crate::source::SourceConfig;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default = "default_days")]
    pub days: u32,
}

fn default_days() -> u32 {
    7
}

// === Sources ===

pub async fn list_sources(State(state): State<AppState>) -> Response {
    let views: Vec<_> = state.registry.list().iter().map(|s| s.to_view()).collect();
    Json(json!({ "data": views })).into_response()
}

pub async fn create_source(
    State(state): State<AppState>,
    Json(cfg): Json<SourceConfig>,
) -> AppResult<Response> {
    let src = state.registry.add(cfg).await.map_err(AppError::store)?;
    Ok((
        axum::http::StatusCode::CREATED,
        Json(json!({ "data": src.to_view() })),
    )
        .into_response())
}

pub async fn get_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let src = state
        .registry
        .get(&id)
        .ok_or_else(|| AppError::not_found("Source not found"))?;
    Ok(Json(json!({ "data": src.to_view() })).into_response())
}

pub async fn update_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut cfg): Json<SourceConfig>,
) -> AppResult<Response> {
    let existing = state
        .registry
        .get(&id)
        .ok_or_else(|| AppError::not_found("Source not found"))?;
    cfg.id = id;
    // An omitted secret keeps the stored one.
    if cfg.api_key.is_empty() {
        cfg.api_key = existing.api_key.clone();
    }
    let src = state.registry.update(cfg).await.map_err(AppError::store)?;
    Ok(Json(json!({ "data": src.to_view() })).into_response())
}

pub async fn delete_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    state.registry.delete(&id).await.map_err(|err| {
        if err == "source not found" {
            AppError::not_found("Source not found")
        } else {
            AppError::store(err)
        }
    })?;
    Ok(Json(json!({ "message": "Source deleted" })).into_response())
}

pub async fn test_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let src = state
        .registry
        .get(&id)
        .ok_or_else(|| AppError::not_found("Source not found"))?;
    match state.monitor.test_connection(&src).await {
        Ok(()) => Ok(Json(json!({ "success": true })).into_response()),
        Err(err) => Ok(Json(json!({ "success": false, "error": err })).into_response()),
    }
}

pub async fn source_balance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let src = state
        .registry
        .get(&id)
        .ok_or_else(|| AppError::not_found("Source not found"))?;
    match state.monitor.check_balance(&src).await {
        Ok(balance) => Ok(Json(json!({ "success": true, "balance": balance })).into_response()),
        Err(err) => Ok(Json(json!({ "success": false, "error": err })).into_response()),
    }
}

// === Status & stats ===

pub async fn get_status(State(state): State<AppState>) -> Response {
    let sources = state.registry.list();
    let mut healthy = 0;
    let mut unhealthy = 0;
    let mut disabled = 0;
    for src in &sources {
        if !src.enabled {
            disabled += 1;
        } else if src.is_healthy() {
            healthy += 1;
        } else {
            unhealthy += 1;
        }
    }
    let settings = state.settings.read().await.clone();

    Json(json!({
        "total_sources": sources.len(),
        "healthy_sources": healthy,
        "unhealthy_sources": unhealthy,
        "disabled_sources": disabled,
        "routing_strategy": state.router.strategy().as_str(),
        "failover_enabled": settings.failover_enabled,
    }))
    .into_response()
}

pub async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> AppResult<Response> {
    let logs = state.log_store.query(&query).await.map_err(AppError::store)?;
    Ok(Json(json!({ "data": logs })).into_response())
}

pub async fn get_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> AppResult<Response> {
    let daily = state
        .log_store
        .daily_stats(query.days)
        .await
        .map_err(AppError::store)?;
    let sources = state
        .log_store
        .source_stats(query.days)
        .await
        .map_err(AppError::store)?;
    Ok(Json(json!({ "daily": daily, "sources": sources })).into_response())
}

pub async fn get_tool_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> AppResult<Response> {
    let stats = state
        .log_store
        .tool_stats(query.days)
        .await
        .map_err(AppError::store)?;
    Ok(Json(json!({ "data": stats })).into_response())
}

// === Credentials ===

pub async fn list_keys(State(state): State<AppState>) -> AppResult<Response> {
    let keys = state.key_store.list().await.map_err(AppError::store)?;
    Ok(Json(json!({ "data": keys })).into_response())
}

pub async fn create_key(
    State(state): State<AppState>,
    Json(input): Json<CreateKeyInput>,
) -> AppResult<Response> {
    let key = state.key_store.create(input).await.map_err(AppError::store)?;
    Ok((
        axum::http::StatusCode::CREATED,
        Json(json!({ "data": key })),
    )
        .into_response())
}

pub async fn get_key(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Response> {
    let key = state
        .key_store
        .get(&id)
        .await
        .map_err(AppError::store)?
        .ok_or_else(|| AppError::not_found("Key not found"))?;
    let ban_remaining = state
        .rate_limiter
        .is_auto_banned(&id)
        .map(|remaining| remaining.as_secs());
    Ok(Json(json!({ "data": key, "auto_ban_remaining_seconds": ban_remaining })).into_response())
}

pub async fn update_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<UpdateKeyInput>,
) -> AppResult<Response> {
    let key = state
        .key_store
        .update(&id, input)
        .await
        .map_err(map_key_error)?;
    Ok(Json(json!({ "data": key })).into_response())
}

pub async fn delete_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    state.key_store.delete(&id).await.map_err(map_key_error)?;
    Ok(Json(json!({ "message": "Key deleted" })).into_response())
}

pub async fn rotate_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let key = state.key_store.rotate(&id).await.map_err(map_key_error)?;
    Ok(Json(json!({ "data": key })).into_response())
}

pub async fn block_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let key = state
        .key_store
        .set_enabled(&id, false)
        .await
        .map_err(map_key_error)?;
    Ok(Json(json!({ "data": key })).into_response())
}

pub async fn unblock_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let key = state
        .key_store
        .set_enabled(&id, true)
        .await
        .map_err(map_key_error)?;
    Ok(Json(json!({ "data": key })).into_response())
}

pub async fn key_usage(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StatsQuery>,
) -> AppResult<Response> {
    let usage = state
        .log_store
        .key_daily_usage(&id, query.days)
        .await
        .map_err(AppError::store)?;
    Ok(Json(json!({ "data": usage })).into_response())
}

fn map_key_error(err: String) -> AppError {
    if err == "key not found" {
        AppError::not_found("Key not found")
    } else {
        AppError::store(err)
    }
}

// === Settings ===

pub async fn get_settings(State(state): State<AppState>) -> Response {
    let settings = state.settings.read().await.clone();
    Json(json!({ "data": settings })).into_response()
}

/// Persists new runtime settings and re-arms the live consumers: the
/// router strategy, the rate limiter's auto-ban parameters, and (via the
/// shared snapshot) the health monitor and the proxy executor.
pub async fn update_settings(
    State(state): State<AppState>,
    Json(mut settings): Json<RuntimeSettings>,
) -> AppResult<Response> {
    settings.updated_at = Utc::now();
    state
        .settings_store
        .save(&settings)
        .await
        .map_err(AppError::store)?;

    state.router.set_strategy(settings.route_strategy);
    state.rate_limiter.set_config(settings.rate_limit_config());
    *state.settings.write().await = settings.clone();

    tracing::info!(
        strategy = settings.route_strategy.as_str(),
        failover = settings.failover_enabled,
        "runtime settings updated"
    );
    Ok(Json(json!({ "data": settings })).into_response())
}

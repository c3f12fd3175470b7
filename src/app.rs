use crate::admin;
use crate::authn;
use crate::error::{AppError, AppResult};
use crate::health::HealthMonitor;
use crate::keys::ApiKeyStore;
use crate::logs::RequestLogStore;
use crate::ratelimit::RateLimiter;
use crate::registry::{SourceRegistry, SourceStore};
use crate::settings::{RuntimeSettings, SettingsStore};
use crate::source::SourceConfig;
use axum::extract::State;
use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use tokio::time::sleep;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub registry: Arc<SourceRegistry>,
    pub router: Arc<crate::router::Router>,
    pub rate_limiter: Arc<RateLimiter>,
    pub key_store: ApiKeyStore,
    pub log_store: RequestLogStore,
    pub settings_store: SettingsStore,
    pub settings: Arc<tokio::sync::RwLock<RuntimeSettings>>,
    pub monitor: Arc<HealthMonitor>,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

/// Process-level configuration, read once from the environment. Hot
/// parameters live in [`RuntimeSettings`] instead.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub database_dsn: String,
    pub metrics_path: String,
    /// Static proxy key; empty disables proxy-plane auth entirely.
    pub api_key: String,
    /// Static admin key; empty leaves the admin surface open.
    pub admin_api_key: String,
    /// Optional JSON file of seed sources merged at startup.
    pub sources_file: Option<String>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            listen: env_or("APIMUX_LISTEN", "0.0.0.0:8080"),
            database_dsn: env_or("APIMUX_DATABASE", "sqlite://./data/apimux.db"),
            metrics_path: env_or("APIMUX_METRICS_PATH", "/metrics"),
            api_key: env_or("APIMUX_API_KEY", ""),
            admin_api_key: env_or("APIMUX_ADMIN_API_KEY", ""),
            sources_file: std::env::var("APIMUX_SOURCES_FILE")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("apimux/0.1")
        .build()
        .map_err(|err| AppError::internal(format!("http client init failed: {err}")))?;

    ensure_sqlite_file(&runtime.database_dsn).map_err(AppError::internal)?;

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            runtime
                .database_dsn
                .parse::<sqlx::sqlite::SqliteConnectOptions>()
                .map_err(|err| AppError::internal(format!("database dsn invalid: {err}")))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5)),
        )
        .await
        .map_err(|err| AppError::internal(format!("database connect failed: {err}")))?;

    let source_store = SourceStore::new(pool.clone()).await.map_err(AppError::store)?;
    let key_store = ApiKeyStore::new(pool.clone()).await.map_err(AppError::store)?;
    let log_store = RequestLogStore::new(pool.clone())
        .await
        .map_err(AppError::store)?;
    let settings_store = SettingsStore::new(pool.clone())
        .await
        .map_err(AppError::store)?;
    let settings_snapshot = settings_store.load().await.map_err(AppError::store)?;

    let registry = Arc::new(SourceRegistry::new(source_store));
    let loaded = registry.load().await.map_err(AppError::store)?;
    tracing::info!(count = loaded, "sources loaded from store");

    if let Some(path) = &runtime.sources_file {
        match load_seed_sources(path) {
            Ok(seeds) if !seeds.is_empty() => {
                let count = seeds.len();
                registry
                    .load_from_config(seeds)
                    .await
                    .map_err(AppError::store)?;
                tracing::info!(count, path = %path, "seed sources merged");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "seed sources load failed");
            }
        }
    }

    let router = Arc::new(crate::router::Router::new(
        registry.clone(),
        settings_snapshot.route_strategy,
    ));
    let rate_limiter = Arc::new(RateLimiter::new(settings_snapshot.rate_limit_config()));
    rate_limiter.spawn_janitor();

    let settings = Arc::new(tokio::sync::RwLock::new(settings_snapshot));
    let monitor = Arc::new(HealthMonitor::new(
        registry.clone(),
        settings.clone(),
        http.clone(),
    ));
    monitor.clone().spawn();
    spawn_log_retention(log_store.clone(), settings.clone());

    let metrics = init_metrics()?;

    Ok(AppState {
        runtime: Arc::new(runtime),
        http,
        metrics,
        registry,
        router,
        rate_limiter,
        key_store,
        log_store,
        settings_store,
        settings,
        monitor,
    })
}

fn load_seed_sources(path: &str) -> Result<Vec<SourceConfig>, String> {
    let raw = std::fs::read_to_string(path).map_err(|err| err.to_string())?;
    serde_json::from_str(&raw).map_err(|err| err.to_string())
}

fn spawn_log_retention(
    log_store: RequestLogStore,
    settings: Arc<tokio::sync::RwLock<RuntimeSettings>>,
) {
    tokio::spawn(async move {
        loop {
            sleep(std::time::Duration::from_secs(3600)).await;
            let retention_days = settings.read().await.log_retention_days.max(1);
            match log_store.prune_older_than(retention_days).await {
                Ok(0) => {}
                Ok(pruned) => tracing::info!(pruned, retention_days, "old request logs pruned"),
                Err(err) => tracing::warn!(error = %err, "log retention sweep failed"),
            }
        }
    });
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::internal(format!(
                    "metrics recorder init failed: {err}"
                )));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE
        .get()
        .cloned()
        .ok_or_else(|| AppError::internal("metrics recorder not available"))
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> axum::response::Response {
    use axum::response::IntoResponse;

    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = %detail, "request handler panicked");
    AppError::internal("Internal server error").into_response()
}

pub fn build_app(state: AppState) -> Router {
    use tower_http::catch_panic::CatchPanicLayer;
    use tower_http::cors::CorsLayer;
    use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
    use tower_http::trace::TraceLayer;

    let proxy_routes = Router::new()
        .route("/v1/chat/completions", post(crate::proxy::chat_completions))
        .route("/v1/models", get(crate::proxy::list_models))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            authn::proxy_auth,
        ));

    let admin_routes = Router::new()
        .route(
            "/api/sources",
            get(admin::list_sources).post(admin::create_source),
        )
        .route(
            "/api/sources/{id}",
            get(admin::get_source)
                .put(admin::update_source)
                .delete(admin::delete_source),
        )
        .route("/api/sources/{id}/test", post(admin::test_source))
        .route("/api/sources/{id}/balance", get(admin::source_balance))
        .route("/api/status", get(admin::get_status))
        .route("/api/logs", get(admin::list_logs))
        .route("/api/stats", get(admin::get_stats))
        .route("/api/tools/stats", get(admin::get_tool_stats))
        .route(
            "/api/config",
            get(admin::get_settings).put(admin::update_settings),
        )
        .route("/api/keys", get(admin::list_keys).post(admin::create_key))
        .route(
            "/api/keys/{id}",
            get(admin::get_key)
                .put(admin::update_key)
                .delete(admin::delete_key),
        )
        .route("/api/keys/{id}/rotate", post(admin::rotate_key))
        .route("/api/keys/{id}/block", put(admin::block_key))
        .route("/api/keys/{id}/unblock", put(admin::unblock_key))
        .route("/api/keys/{id}/usage", get(admin::key_usage))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            authn::admin_auth,
        ));

    let metrics_path = state.runtime.metrics_path.clone();

    Router::new()
        .merge(proxy_routes)
        .merge(admin_routes)
        .route(&metrics_path, get(render_metrics))
        .route("/ping", get(crate::proxy::ping))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

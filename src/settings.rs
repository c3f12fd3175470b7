use crate::router::RouteStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};

/// Hot-reloadable gateway settings. The live copy lives in
/// `Arc<RwLock<RuntimeSettings>>`; readers clone a snapshot, writers
/// replace the whole value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    pub route_strategy: RouteStrategy,
    pub failover_enabled: bool,
    pub max_retries: u32,
    /// When true, a stream whose upstream dies before the first data
    /// frame counts as a failed attempt and may fail over.
    pub stream_retry_before_first_chunk: bool,
    pub health_enabled: bool,
    pub health_interval_seconds: u64,
    pub health_timeout_seconds: u64,
    pub health_failure_threshold: u32,
    pub auto_ban_threshold: u32,
    pub auto_ban_minutes: u64,
    pub upstream_timeout_seconds: u64,
    pub log_retention_days: u32,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            route_strategy: RouteStrategy::Priority,
            failover_enabled: true,
            max_retries: 2,
            stream_retry_before_first_chunk: false,
            health_enabled: true,
            health_interval_seconds: 60,
            health_timeout_seconds: 10,
            health_failure_threshold: 3,
            auto_ban_threshold: 50,
            auto_ban_minutes: 30,
            upstream_timeout_seconds: 300,
            log_retention_days: 7,
            updated_at: Utc::now(),
        }
    }
}

impl RuntimeSettings {
    pub fn rate_limit_config(&self) -> crate::ratelimit::RateLimitConfig {
        crate::ratelimit::RateLimitConfig {
            auto_ban_threshold: self.auto_ban_threshold.max(1),
            auto_ban_duration: std::time::Duration::from_secs(self.auto_ban_minutes.max(1) * 60),
        }
    }
}

#[derive(Clone)]
pub struct SettingsStore {
    pool: Pool<Sqlite>,
}

impl SettingsStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        let store = Self { pool };
        store.ensure_defaults().await?;
        Ok(store)
    }

    async fn ensure_defaults(&self) -> Result<(), String> {
        let defaults = RuntimeSettings::default();
        for (key, value) in settings_pairs(&defaults) {
            let now = Utc::now().to_rfc3339();
            sqlx::query("INSERT OR IGNORE INTO settings (key, value, updated_at) VALUES (?, ?, ?)")
                .bind(key)
                .bind(value)
                .bind(&now)
                .execute(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn load(&self) -> Result<RuntimeSettings, String> {
        let rows = sqlx::query("SELECT key, value, updated_at FROM settings")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        let mut settings = RuntimeSettings::default();
        let mut latest = settings.updated_at;
        for row in rows {
            let key: String = row.try_get("key").map_err(|e| e.to_string())?;
            let value: String = row.try_get("value").map_err(|e| e.to_string())?;
            let updated_raw: String = row.try_get("updated_at").map_err(|e| e.to_string())?;
            if let Ok(updated) = DateTime::parse_from_rfc3339(&updated_raw) {
                let updated = updated.with_timezone(&Utc);
                if updated > latest {
                    latest = updated;
                }
            }

            match key.as_str() {
                "route_strategy" => {
                    if let Some(strategy) = RouteStrategy::parse(&value) {
                        settings.route_strategy = strategy;
                    }
                }
                "failover_enabled" => settings.failover_enabled = value.parse().unwrap_or(true),
                "max_retries" => settings.max_retries = value.parse().unwrap_or(2),
                "stream_retry_before_first_chunk" => {
                    settings.stream_retry_before_first_chunk = value.parse().unwrap_or(false)
                }
                "health_enabled" => settings.health_enabled = value.parse().unwrap_or(true),
                "health_interval_seconds" => {
                    settings.health_interval_seconds = value.parse().unwrap_or(60)
                }
                "health_timeout_seconds" => {
                    settings.health_timeout_seconds = value.parse().unwrap_or(10)
                }
                "health_failure_threshold" => {
                    settings.health_failure_threshold = value.parse().unwrap_or(3)
                }
                "auto_ban_threshold" => settings.auto_ban_threshold = value.parse().unwrap_or(50),
                "auto_ban_minutes" => settings.auto_ban_minutes = value.parse().unwrap_or(30),
                "upstream_timeout_seconds" => {
                    settings.upstream_timeout_seconds = value.parse().unwrap_or(300)
                }
                "log_retention_days" => {
                    settings.log_retention_days = value.parse().unwrap_or(7)
                }
                _ => {}
            }
        }
        settings.updated_at = latest;
        Ok(settings)
    }

    pub async fn save(&self, settings: &RuntimeSettings) -> Result<(), String> {
        for (key, value) in settings_pairs(settings) {
            self.set(key, &value).await?;
        }
        Ok(())
    }
}

fn settings_pairs(settings: &RuntimeSettings) -> Vec<(&'static str, String)> {
    vec![
        ("route_strategy", settings.route_strategy.as_str().to_string()),
        ("failover_enabled", settings.failover_enabled.to_string()),
        ("max_retries", settings.max_retries.to_string()),
        (
            "stream_retry_before_first_chunk",
            settings.stream_retry_before_first_chunk.to_string(),
        ),
        ("health_enabled", settings.health_enabled.to_string()),
        (
            "health_interval_seconds",
            settings.health_interval_seconds.to_string(),
        ),
        (
            "health_timeout_seconds",
            settings.health_timeout_seconds.to_string(),
        ),
        (
            "health_failure_threshold",
            settings.health_failure_threshold.to_string(),
        ),
        ("auto_ban_threshold", settings.auto_ban_threshold.to_string()),
        ("auto_ban_minutes", settings.auto_ban_minutes.to_string()),
        (
            "upstream_timeout_seconds",
            settings.upstream_timeout_seconds.to_string(),
        ),
        ("log_retention_days", settings.log_retention_days.to_string()),
    ]
}

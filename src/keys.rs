use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyLimits {
    /// Requests per minute, 0 = unlimited.
    #[serde(default)]
    pub rpm: u32,
    /// Requests per day, 0 = unlimited.
    #[serde(default)]
    pub daily_quota: u32,
    /// Concurrent in-flight requests, 0 = unlimited.
    #[serde(default)]
    pub concurrent: u32,
    /// Client tool -> daily quota.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tool_quotas: HashMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub key: String,
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub limits: KeyLimits,
    /// Empty means any client tool is accepted.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateKeyInput {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub limits: KeyLimits,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateKeyInput {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub limits: Option<KeyLimits>,
    pub allowed_tools: Option<Vec<String>>,
}

fn generate_secret() -> String {
    format!("sk-apimux-{}", uuid::Uuid::new_v4().simple())
}

#[derive(Clone)]
pub struct ApiKeyStore {
    pool: Pool<Sqlite>,
}

impl ApiKeyStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                key TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                enabled INTEGER NOT NULL DEFAULT 1,
                limits TEXT NOT NULL DEFAULT '{}',
                allowed_tools TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                last_used_at TEXT
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_api_keys_key ON api_keys(key)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn create(&self, input: CreateKeyInput) -> Result<ApiKey, String> {
        let key = ApiKey {
            id: format!("key_{}", uuid::Uuid::new_v4().simple()),
            key: generate_secret(),
            name: input.name,
            enabled: true,
            limits: input.limits,
            allowed_tools: input.allowed_tools,
            created_at: Utc::now(),
            last_used_at: None,
        };
        self.save(&key).await?;
        Ok(key)
    }

    async fn save(&self, key: &ApiKey) -> Result<(), String> {
        let limits = serde_json::to_string(&key.limits).map_err(|e| e.to_string())?;
        let tools = serde_json::to_string(&key.allowed_tools).map_err(|e| e.to_string())?;
        sqlx::query(
            r#"INSERT INTO api_keys (id, key, name, enabled, limits, allowed_tools, created_at, last_used_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                   key = excluded.key,
                   name = excluded.name,
                   enabled = excluded.enabled,
                   limits = excluded.limits,
                   allowed_tools = excluded.allowed_tools,
                   last_used_at = excluded.last_used_at"#,
        )
        .bind(&key.id)
        .bind(&key.key)
        .bind(&key.name)
        .bind(key.enabled)
        .bind(&limits)
        .bind(&tools)
        .bind(key.created_at.to_rfc3339())
        .bind(key.last_used_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ApiKey>, String> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.map(|r| row_to_key(&r)).transpose()
    }

    pub async fn get_by_secret(&self, secret: &str) -> Result<Option<ApiKey>, String> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE key = ?")
            .bind(secret)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.map(|r| row_to_key(&r)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<ApiKey>, String> {
        let rows = sqlx::query("SELECT * FROM api_keys ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_key).collect()
    }

    pub async fn update(&self, id: &str, input: UpdateKeyInput) -> Result<ApiKey, String> {
        let mut key = self
            .get(id)
            .await?
            .ok_or_else(|| "key not found".to_string())?;
        if let Some(name) = input.name {
            key.name = name;
        }
        if let Some(enabled) = input.enabled {
            key.enabled = enabled;
        }
        if let Some(limits) = input.limits {
            key.limits = limits;
        }
        if let Some(tools) = input.allowed_tools {
            key.allowed_tools = tools;
        }
        self.save(&key).await?;
        Ok(key)
    }

    /// Issues a fresh secret for an existing identifier.
    pub async fn rotate(&self, id: &str) -> Result<ApiKey, String> {
        let mut key = self
            .get(id)
            .await?
            .ok_or_else(|| "key not found".to_string())?;
        key.key = generate_secret();
        self.save(&key).await?;
        Ok(key)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<ApiKey, String> {
        let mut key = self
            .get(id)
            .await?
            .ok_or_else(|| "key not found".to_string())?;
        key.enabled = enabled;
        self.save(&key).await?;
        Ok(key)
    }

    pub async fn delete(&self, id: &str) -> Result<(), String> {
        let deleted = sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?
            .rows_affected();
        if deleted == 0 {
            return Err("key not found".to_string());
        }
        Ok(())
    }

    pub async fn touch_last_used(&self, id: &str) -> Result<(), String> {
        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

fn row_to_key(row: &sqlx::sqlite::SqliteRow) -> Result<ApiKey, String> {
    let limits_raw: String = row.try_get("limits").map_err(|e| e.to_string())?;
    let tools_raw: String = row.try_get("allowed_tools").map_err(|e| e.to_string())?;
    let created_raw: String = row.try_get("created_at").map_err(|e| e.to_string())?;
    let last_used_raw: Option<String> = row.try_get("last_used_at").map_err(|e| e.to_string())?;

    Ok(ApiKey {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        key: row.try_get("key").map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        enabled: row.try_get("enabled").map_err(|e| e.to_string())?,
        limits: serde_json::from_str(&limits_raw).unwrap_or_default(),
        allowed_tools: serde_json::from_str(&tools_raw).unwrap_or_default(),
        created_at: DateTime::parse_from_rfc3339(&created_raw)
            .map_err(|e| e.to_string())?
            .with_timezone(&Utc),
        last_used_at: last_used_raw
            .filter(|s| !s.is_empty())
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc)),
    })
}

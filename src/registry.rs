use crate::source::{Capabilities, Source, SourceConfig, SourceStatus};
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

fn generate_source_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let bytes = uuid::Uuid::new_v4().into_bytes();
    (0..12)
        .map(|i| CHARSET[bytes[i % 16] as usize % CHARSET.len()] as char)
        .collect()
}

#[derive(Clone)]
pub struct SourceStore {
    pool: Pool<Sqlite>,
}

impl SourceStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS sources (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                base_url TEXT NOT NULL,
                api_key TEXT NOT NULL DEFAULT '',
                priority INTEGER NOT NULL DEFAULT 1,
                weight INTEGER NOT NULL DEFAULT 100,
                enabled INTEGER NOT NULL DEFAULT 1,
                capabilities TEXT NOT NULL DEFAULT '{}',
                aggregator TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sources_priority ON sources(priority)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn save(&self, cfg: &SourceConfig) -> Result<(), String> {
        let caps = serde_json::to_string(&cfg.capabilities).map_err(|e| e.to_string())?;
        let aggregator = cfg
            .aggregator
            .as_ref()
            .map(|a| serde_json::to_string(a).map_err(|e| e.to_string()))
            .transpose()?;
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT INTO sources (id, name, type, base_url, api_key, priority, weight, enabled, capabilities, aggregator, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   type = excluded.type,
                   base_url = excluded.base_url,
                   api_key = excluded.api_key,
                   priority = excluded.priority,
                   weight = excluded.weight,
                   enabled = excluded.enabled,
                   capabilities = excluded.capabilities,
                   aggregator = excluded.aggregator,
                   updated_at = excluded.updated_at"#,
        )
        .bind(&cfg.id)
        .bind(&cfg.name)
        .bind(cfg.source_type.as_str())
        .bind(&cfg.base_url)
        .bind(&cfg.api_key)
        .bind(cfg.priority)
        .bind(cfg.weight)
        .bind(cfg.enabled)
        .bind(&caps)
        .bind(&aggregator)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<SourceConfig>, String> {
        let row = sqlx::query(
            "SELECT id, name, type, base_url, api_key, priority, weight, enabled, capabilities, aggregator FROM sources WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        row.map(|r| row_to_config(&r)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<SourceConfig>, String> {
        let rows = sqlx::query(
            "SELECT id, name, type, base_url, api_key, priority, weight, enabled, capabilities, aggregator FROM sources ORDER BY priority, name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_config).collect()
    }

    pub async fn delete(&self, id: &str) -> Result<(), String> {
        sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

fn row_to_config(row: &sqlx::sqlite::SqliteRow) -> Result<SourceConfig, String> {
    let type_raw: String = row.try_get("type").map_err(|e| e.to_string())?;
    let source_type = crate::source::SourceType::parse(&type_raw)
        .ok_or_else(|| format!("invalid source type: {type_raw}"))?;
    let caps_raw: String = row.try_get("capabilities").map_err(|e| e.to_string())?;
    let capabilities: Capabilities = serde_json::from_str(&caps_raw).unwrap_or_default();
    let aggregator_raw: Option<String> = row.try_get("aggregator").map_err(|e| e.to_string())?;
    let aggregator = aggregator_raw
        .filter(|s| !s.is_empty())
        .and_then(|s| serde_json::from_str(&s).ok());

    Ok(SourceConfig {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        source_type,
        base_url: row.try_get("base_url").map_err(|e| e.to_string())?,
        api_key: row.try_get("api_key").map_err(|e| e.to_string())?,
        priority: row.try_get("priority").map_err(|e| e.to_string())?,
        weight: row.try_get("weight").map_err(|e| e.to_string())?,
        enabled: row.try_get("enabled").map_err(|e| e.to_string())?,
        capabilities,
        aggregator,
    })
}

/// In-memory catalog of upstream sources, backed by [`SourceStore`].
/// The map sits behind one reader-writer lock; per-source runtime state
/// has its own lock inside [`Source`].
pub struct SourceRegistry {
    sources: RwLock<HashMap<String, Arc<Source>>>,
    store: Option<SourceStore>,
}

impl SourceRegistry {
    pub fn new(store: SourceStore) -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            store: Some(store),
        }
    }

    /// Registry without persistence, for embedding and tests.
    pub fn detached() -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    /// Replaces the in-memory map with the persisted catalog. Runtime
    /// status starts fresh as healthy.
    pub async fn load(&self) -> Result<usize, String> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let configs = store.list().await?;
        let mut map = HashMap::with_capacity(configs.len());
        for cfg in configs {
            let src = Arc::new(Source::from_config(cfg));
            map.insert(src.id.clone(), src);
        }
        let count = map.len();
        *self.sources.write().expect("sources lock") = map;
        Ok(count)
    }

    /// Merges seed configs into the catalog, generating ids where missing
    /// and persisting each entry.
    pub async fn load_from_config(&self, configs: Vec<SourceConfig>) -> Result<(), String> {
        for mut cfg in configs {
            if cfg.id.is_empty() {
                cfg.id = generate_source_id();
            }
            if let Some(store) = &self.store {
                store.save(&cfg).await?;
            }
            let src = Arc::new(Source::from_config(cfg));
            self.sources
                .write()
                .expect("sources lock")
                .insert(src.id.clone(), src);
        }
        Ok(())
    }

    pub async fn add(&self, mut cfg: SourceConfig) -> Result<Arc<Source>, String> {
        if cfg.id.is_empty() {
            cfg.id = generate_source_id();
        }
        if let Some(store) = &self.store {
            store.save(&cfg).await?;
        }
        let src = Arc::new(Source::from_config(cfg));
        self.sources
            .write()
            .expect("sources lock")
            .insert(src.id.clone(), src.clone());
        Ok(src)
    }

    /// Replaces a source's configuration while carrying over its live
    /// status (declared capabilities come from the incoming record).
    pub async fn update(&self, cfg: SourceConfig) -> Result<Arc<Source>, String> {
        let existing = self
            .get(&cfg.id)
            .ok_or_else(|| "source not found".to_string())?;
        if let Some(store) = &self.store {
            store.save(&cfg).await?;
        }
        let src = Arc::new(Source::from_config(cfg));
        src.set_status(existing.status());
        self.sources
            .write()
            .expect("sources lock")
            .insert(src.id.clone(), src.clone());
        Ok(src)
    }

    pub async fn delete(&self, id: &str) -> Result<(), String> {
        {
            let map = self.sources.read().expect("sources lock");
            if !map.contains_key(id) {
                return Err("source not found".to_string());
            }
        }
        if let Some(store) = &self.store {
            store.delete(id).await?;
        }
        self.sources.write().expect("sources lock").remove(id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Source>> {
        self.sources.read().expect("sources lock").get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Source>> {
        self.sources
            .read()
            .expect("sources lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn get_healthy(&self) -> Vec<Arc<Source>> {
        self.sources
            .read()
            .expect("sources lock")
            .values()
            .filter(|src| src.enabled && src.is_healthy())
            .cloned()
            .collect()
    }

    /// The routing filter: enabled + healthy, model accepted, capability
    /// demand satisfied. Aggregators are provider-aware: thinking is never
    /// supported, FC resolves through the detected sub-provider, and a
    /// model detected on a disabled provider excludes the source.
    pub fn get_by_capability(
        &self,
        need_fc: bool,
        need_thinking: bool,
        need_vision: bool,
        model: &str,
    ) -> Vec<Arc<Source>> {
        let candidates = self.list();
        let mut out = Vec::new();
        for src in candidates {
            if !src.enabled || !src.is_healthy() {
                continue;
            }
            if src.source_type == crate::source::SourceType::Cpa {
                if !model.is_empty() {
                    if let Some(provider) = src.provider_for_model(model) {
                        if !src.is_provider_enabled(&provider) {
                            continue;
                        }
                    }
                }
                if need_thinking {
                    continue;
                }
                if need_fc && !src.supports_fc_for_model(model) {
                    continue;
                }
            } else {
                let caps = src.capabilities();
                if need_fc && !caps.function_calling {
                    continue;
                }
                if need_thinking && !caps.extended_thinking {
                    continue;
                }
            }
            if need_vision && !src.capabilities().vision {
                continue;
            }
            if !model.is_empty() && !src.supports_model(model) {
                continue;
            }
            out.push(src);
        }
        out
    }

    pub fn update_status(&self, id: &str, status: SourceStatus) {
        if let Some(src) = self.get(id) {
            src.set_status(status);
        }
    }

    /// Union of model identifiers contributed by healthy sources.
    pub fn healthy_model_ids(&self) -> Vec<(String, crate::source::SourceType)> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for src in self.get_healthy() {
            for model in src.capabilities().models {
                if seen.insert(model.clone()) {
                    out.push((model, src.source_type));
                }
            }
        }
        out
    }
}

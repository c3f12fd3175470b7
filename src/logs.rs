use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub source_name: String,
    pub model: String,
    pub has_tools: bool,
    pub has_thinking: bool,
    pub stream: bool,
    pub success: bool,
    pub status_code: u16,
    pub latency_ms: i64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub failover_from: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_tool: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_key_id: String,
    pub fc_compat_used: bool,
}

impl RequestLog {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("log_{}", uuid::Uuid::new_v4().simple()),
            request_id: String::new(),
            timestamp: Utc::now(),
            source_id: String::new(),
            source_name: String::new(),
            model: model.into(),
            has_tools: false,
            has_thinking: false,
            stream: false,
            success: false,
            status_code: 0,
            latency_ms: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            error: String::new(),
            failover_from: String::new(),
            client_ip: String::new(),
            client_tool: String::new(),
            api_key_id: String::new(),
            fc_compat_used: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub client_tool: Option<String>,
    #[serde(default)]
    pub api_key_id: Option<String>,
    #[serde(default)]
    pub fc_compat: Option<bool>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyStats {
    pub date: String,
    pub total_requests: i64,
    pub success_rate: f64,
    pub total_tokens: i64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub source_id: String,
    pub source_name: String,
    pub request_count: i64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolStats {
    pub tool: String,
    pub request_count: i64,
    pub last_used_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyDailyUsage {
    pub date: String,
    pub request_count: i64,
    pub success_count: i64,
    pub fail_count: i64,
    pub total_tokens: i64,
    pub avg_latency_ms: f64,
}

#[derive(Clone)]
pub struct RequestLogStore {
    pool: Pool<Sqlite>,
}

impl RequestLogStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS request_logs (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL DEFAULT '',
                timestamp TEXT NOT NULL,
                source_id TEXT NOT NULL DEFAULT '',
                source_name TEXT NOT NULL DEFAULT '',
                model TEXT NOT NULL DEFAULT '',
                has_tools INTEGER NOT NULL DEFAULT 0,
                has_thinking INTEGER NOT NULL DEFAULT 0,
                stream INTEGER NOT NULL DEFAULT 0,
                success INTEGER NOT NULL DEFAULT 0,
                status_code INTEGER NOT NULL DEFAULT 0,
                latency_ms INTEGER NOT NULL DEFAULT 0,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                error TEXT NOT NULL DEFAULT '',
                failover_from TEXT NOT NULL DEFAULT '',
                client_ip TEXT NOT NULL DEFAULT '',
                client_tool TEXT NOT NULL DEFAULT '',
                api_key_id TEXT NOT NULL DEFAULT '',
                fc_compat_used INTEGER NOT NULL DEFAULT 0
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        for index in &[
            "CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON request_logs(timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_logs_source ON request_logs(source_id)",
            "CREATE INDEX IF NOT EXISTS idx_logs_key ON request_logs(api_key_id)",
        ] {
            sqlx::query(index)
                .execute(&pool)
                .await
                .map_err(|e| e.to_string())?;
        }

        Ok(Self { pool })
    }

    pub async fn insert(&self, log: &RequestLog) -> Result<(), String> {
        sqlx::query(
            r#"INSERT INTO request_logs (id, request_id, timestamp, source_id, source_name, model,
                has_tools, has_thinking, stream, success, status_code, latency_ms,
                prompt_tokens, completion_tokens, total_tokens, error, failover_from,
                client_ip, client_tool, api_key_id, fc_compat_used)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&log.id)
        .bind(&log.request_id)
        .bind(log.timestamp.to_rfc3339())
        .bind(&log.source_id)
        .bind(&log.source_name)
        .bind(&log.model)
        .bind(log.has_tools)
        .bind(log.has_thinking)
        .bind(log.stream)
        .bind(log.success)
        .bind(log.status_code as i64)
        .bind(log.latency_ms)
        .bind(log.prompt_tokens as i64)
        .bind(log.completion_tokens as i64)
        .bind(log.total_tokens as i64)
        .bind(&log.error)
        .bind(&log.failover_from)
        .bind(&log.client_ip)
        .bind(&log.client_tool)
        .bind(&log.api_key_id)
        .bind(log.fc_compat_used)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn query(&self, query: &LogQuery) -> Result<Vec<RequestLog>, String> {
        let mut sql = String::from("SELECT * FROM request_logs WHERE 1=1");
        let mut binds: Vec<String> = Vec::new();

        if let Some(v) = query.source_id.as_deref().filter(|v| !v.is_empty()) {
            sql.push_str(" AND source_id = ?");
            binds.push(v.to_string());
        }
        if let Some(v) = query.request_id.as_deref().filter(|v| !v.is_empty()) {
            sql.push_str(" AND request_id = ?");
            binds.push(v.to_string());
        }
        if let Some(v) = query.model.as_deref().filter(|v| !v.is_empty()) {
            sql.push_str(" AND model = ?");
            binds.push(v.to_string());
        }
        if let Some(v) = query.success {
            sql.push_str(" AND success = ?");
            binds.push(if v { "1".into() } else { "0".into() });
        }
        if let Some(v) = query.client_tool.as_deref().filter(|v| !v.is_empty()) {
            sql.push_str(" AND client_tool = ?");
            binds.push(v.to_string());
        }
        if let Some(v) = query.api_key_id.as_deref().filter(|v| !v.is_empty()) {
            sql.push_str(" AND api_key_id = ?");
            binds.push(v.to_string());
        }
        if let Some(v) = query.fc_compat {
            sql.push_str(" AND fc_compat_used = ?");
            binds.push(if v { "1".into() } else { "0".into() });
        }

        sql.push_str(" ORDER BY timestamp DESC");
        let limit = query.limit.filter(|l| *l > 0).unwrap_or(100);
        sql.push_str(&format!(" LIMIT {limit}"));
        if let Some(offset) = query.offset.filter(|o| *o > 0) {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        let mut q = sqlx::query(&sql);
        for bind in &binds {
            q = q.bind(bind);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(|e| e.to_string())?;
        rows.iter().map(row_to_log).collect()
    }

    pub async fn daily_stats(&self, days: u32) -> Result<Vec<DailyStats>, String> {
        let rows = sqlx::query(
            r#"SELECT
                date(timestamp) as date,
                COUNT(*) as total_requests,
                ROUND(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END) * 100.0 / COUNT(*), 2) as success_rate,
                COALESCE(SUM(total_tokens), 0) as total_tokens,
                COALESCE(ROUND(AVG(latency_ms), 2), 0) as avg_latency
               FROM request_logs
               WHERE timestamp >= date('now', ?)
               GROUP BY date(timestamp)
               ORDER BY date DESC"#,
        )
        .bind(format!("-{days} days"))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        rows.iter()
            .map(|row| {
                Ok(DailyStats {
                    date: row.try_get("date").map_err(|e| e.to_string())?,
                    total_requests: row.try_get("total_requests").map_err(|e| e.to_string())?,
                    success_rate: row.try_get("success_rate").map_err(|e| e.to_string())?,
                    total_tokens: row.try_get("total_tokens").map_err(|e| e.to_string())?,
                    avg_latency_ms: row.try_get("avg_latency").map_err(|e| e.to_string())?,
                })
            })
            .collect()
    }

    pub async fn source_stats(&self, days: u32) -> Result<Vec<SourceStats>, String> {
        let rows = sqlx::query(
            r#"SELECT
                source_id,
                source_name,
                COUNT(*) as request_count,
                ROUND(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END) * 100.0 / COUNT(*), 2) as success_rate,
                COALESCE(ROUND(AVG(latency_ms), 2), 0) as avg_latency,
                COALESCE(SUM(total_tokens), 0) as total_tokens
               FROM request_logs
               WHERE timestamp >= date('now', ?) AND source_id != ''
               GROUP BY source_id
               ORDER BY request_count DESC"#,
        )
        .bind(format!("-{days} days"))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        rows.iter()
            .map(|row| {
                Ok(SourceStats {
                    source_id: row.try_get("source_id").map_err(|e| e.to_string())?,
                    source_name: row.try_get("source_name").map_err(|e| e.to_string())?,
                    request_count: row.try_get("request_count").map_err(|e| e.to_string())?,
                    success_rate: row.try_get("success_rate").map_err(|e| e.to_string())?,
                    avg_latency_ms: row.try_get("avg_latency").map_err(|e| e.to_string())?,
                    total_tokens: row.try_get("total_tokens").map_err(|e| e.to_string())?,
                })
            })
            .collect()
    }

    pub async fn tool_stats(&self, days: u32) -> Result<Vec<ToolStats>, String> {
        let rows = sqlx::query(
            r#"SELECT client_tool, COUNT(*) as request_count, MAX(timestamp) as last_used
               FROM request_logs
               WHERE client_tool != '' AND timestamp >= date('now', ?)
               GROUP BY client_tool
               ORDER BY request_count DESC"#,
        )
        .bind(format!("-{days} days"))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        rows.iter()
            .map(|row| {
                Ok(ToolStats {
                    tool: row.try_get("client_tool").map_err(|e| e.to_string())?,
                    request_count: row.try_get("request_count").map_err(|e| e.to_string())?,
                    last_used_at: row.try_get("last_used").map_err(|e| e.to_string())?,
                })
            })
            .collect()
    }

    pub async fn key_daily_usage(
        &self,
        key_id: &str,
        days: u32,
    ) -> Result<Vec<KeyDailyUsage>, String> {
        let rows = sqlx::query(
            r#"SELECT
                date(timestamp) as date,
                COUNT(*) as request_count,
                SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END) as success_count,
                SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END) as fail_count,
                COALESCE(SUM(total_tokens), 0) as total_tokens,
                COALESCE(ROUND(AVG(latency_ms), 2), 0) as avg_latency
               FROM request_logs
               WHERE api_key_id = ? AND timestamp >= date('now', ?)
               GROUP BY date(timestamp)
               ORDER BY date DESC"#,
        )
        .bind(key_id)
        .bind(format!("-{days} days"))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        rows.iter()
            .map(|row| {
                Ok(KeyDailyUsage {
                    date: row.try_get("date").map_err(|e| e.to_string())?,
                    request_count: row.try_get("request_count").map_err(|e| e.to_string())?,
                    success_count: row.try_get("success_count").map_err(|e| e.to_string())?,
                    fail_count: row.try_get("fail_count").map_err(|e| e.to_string())?,
                    total_tokens: row.try_get("total_tokens").map_err(|e| e.to_string())?,
                    avg_latency_ms: row.try_get("avg_latency").map_err(|e| e.to_string())?,
                })
            })
            .collect()
    }

    pub async fn prune_older_than(&self, retention_days: u32) -> Result<u64, String> {
        let result = sqlx::query("DELETE FROM request_logs WHERE timestamp < date('now', ?)")
            .bind(format!("-{retention_days} days"))
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected())
    }
}

fn row_to_log(row: &sqlx::sqlite::SqliteRow) -> Result<RequestLog, String> {
    let timestamp_raw: String = row.try_get("timestamp").map_err(|e| e.to_string())?;
    let status_code: i64 = row.try_get("status_code").map_err(|e| e.to_string())?;
    let prompt_tokens: i64 = row.try_get("prompt_tokens").map_err(|e| e.to_string())?;
    let completion_tokens: i64 = row.try_get("completion_tokens").map_err(|e| e.to_string())?;
    let total_tokens: i64 = row.try_get("total_tokens").map_err(|e| e.to_string())?;

    Ok(RequestLog {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        request_id: row.try_get("request_id").map_err(|e| e.to_string())?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp_raw)
            .map_err(|e| e.to_string())?
            .with_timezone(&Utc),
        source_id: row.try_get("source_id").map_err(|e| e.to_string())?,
        source_name: row.try_get("source_name").map_err(|e| e.to_string())?,
        model: row.try_get("model").map_err(|e| e.to_string())?,
        has_tools: row.try_get("has_tools").map_err(|e| e.to_string())?,
        has_thinking: row.try_get("has_thinking").map_err(|e| e.to_string())?,
        stream: row.try_get("stream").map_err(|e| e.to_string())?,
        success: row.try_get("success").map_err(|e| e.to_string())?,
        status_code: status_code as u16,
        latency_ms: row.try_get("latency_ms").map_err(|e| e.to_string())?,
        prompt_tokens: prompt_tokens as u32,
        completion_tokens: completion_tokens as u32,
        total_tokens: total_tokens as u32,
        error: row.try_get("error").map_err(|e| e.to_string())?,
        failover_from: row.try_get("failover_from").map_err(|e| e.to_string())?,
        client_ip: row.try_get("client_ip").map_err(|e| e.to_string())?,
        client_tool: row.try_get("client_tool").map_err(|e| e.to_string())?,
        api_key_id: row.try_get("api_key_id").map_err(|e| e.to_string())?,
        fc_compat_used: row.try_get("fc_compat_used").map_err(|e| e.to_string())?,
    })
}

use crate::registry::SourceRegistry;
use crate::settings::RuntimeSettings;
use crate::source::{provider_capability, HealthState, Source, SourceType};
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const ERROR_BODY_LIMIT: usize = 1024;

/// Background prober maintaining per-source liveness and latency, plus
/// the model-to-provider view for auto-detecting aggregators. Probes run
/// on their own client, independent of any request context.
pub struct HealthMonitor {
    registry: Arc<SourceRegistry>,
    settings: Arc<RwLock<RuntimeSettings>>,
    client: reqwest::Client,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<SourceRegistry>,
        settings: Arc<RwLock<RuntimeSettings>>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            registry,
            settings,
            client,
        }
    }

    /// Pacing loop: wakes every second, snapshots settings, and runs a
    /// sweep when the configured interval has elapsed. Enable/interval
    /// changes apply within a second; other parameters at the next sweep.
    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut last_sweep: Option<Instant> = None;
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let settings = self.settings.read().await.clone();
                if !settings.health_enabled {
                    continue;
                }
                let interval = Duration::from_secs(settings.health_interval_seconds.max(1));
                let due = last_sweep
                    .map(|t| t.elapsed() >= interval)
                    .unwrap_or(true);
                if !due {
                    continue;
                }
                last_sweep = Some(Instant::now());
                self.check_all().await;
            }
        });
    }

    pub async fn check_all(&self) {
        let settings = self.settings.read().await.clone();
        let threshold = settings.health_failure_threshold.max(1);
        let timeout = Duration::from_secs(settings.health_timeout_seconds.max(1));

        let sources: Vec<Arc<Source>> = self
            .registry
            .list()
            .into_iter()
            .filter(|src| src.enabled)
            .collect();
        let probes = sources
            .iter()
            .map(|src| self.check_source(src, threshold, timeout));
        futures_util::future::join_all(probes).await;
    }

    /// Exactly one upstream request per source per sweep: auto-detecting
    /// aggregators parse the same `/v1/models` response they were probed
    /// with.
    pub async fn check_source(&self, src: &Arc<Source>, threshold: u32, timeout: Duration) {
        let start = Instant::now();
        let auto_detect = src.source_type == SourceType::Cpa
            && src
                .aggregator
                .as_ref()
                .map(|a| a.auto_detect)
                .unwrap_or(false);

        let result = if auto_detect {
            self.probe_and_detect(src, timeout).await
        } else {
            probe_source(&self.client, src, timeout).await.map(|_| None)
        };
        let latency_ms = start.elapsed().as_millis() as i64;

        let mut status = src.status();
        status.last_check = Some(Utc::now());
        status.latency_ms = latency_ms;

        match result {
            Err(err) => {
                status.consecutive_fail += 1;
                status.error_count += 1;
                status.last_error = err.clone();
                tracing::warn!(
                    source = %src.name,
                    consecutive = status.consecutive_fail,
                    error = %err,
                    "health probe failed"
                );
                if status.consecutive_fail >= threshold {
                    status.state = HealthState::Unhealthy;
                }
            }
            Ok(detected) => {
                status.consecutive_fail = 0;
                status.state = HealthState::Healthy;
                status.last_error.clear();
                if let Some(model_providers) = detected {
                    status.model_providers = model_providers;
                }
            }
        }

        src.set_status(status);
    }

    async fn probe_and_detect(
        &self,
        src: &Source,
        timeout: Duration,
    ) -> Result<Option<HashMap<String, String>>, String> {
        let resp = send_probe(&self.client, src, timeout).await?;

        // The source is reachable; an unparseable body only skips model
        // detection, it is not a health failure.
        let body: Value = match resp.json().await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(source = %src.name, error = %err, "model list decode failed");
                return Ok(None);
            }
        };

        let enabled: HashSet<String> = src.effective_providers().into_iter().collect();
        let mut model_providers = HashMap::new();
        let mut detected_models = Vec::new();
        let mut detected_provider_set = HashSet::new();

        if let Some(items) = body.get("data").and_then(Value::as_array) {
            for item in items {
                let Some(id) = item.get("id").and_then(Value::as_str) else {
                    continue;
                };
                let provider = item
                    .get("provider")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if !enabled.is_empty() && !enabled.contains(provider) {
                    continue;
                }
                model_providers.insert(id.to_string(), provider.to_string());
                detected_models.push(id.to_string());
                detected_provider_set.insert(provider.to_string());
            }
        }

        let mut caps = src.capabilities();
        caps.extended_thinking = false;
        if !detected_models.is_empty() {
            caps.models = detected_models;
        }
        if !detected_provider_set.is_empty() {
            caps.function_calling = detected_provider_set
                .iter()
                .any(|p| provider_capability(p).map(|c| c.function_calling).unwrap_or(false));
            caps.vision = detected_provider_set
                .iter()
                .any(|p| provider_capability(p).map(|c| c.vision).unwrap_or(false));
        }
        src.set_capabilities(caps);

        if !model_providers.is_empty() {
            tracing::info!(
                source = %src.name,
                models = model_providers.len(),
                providers = detected_provider_set.len(),
                "aggregator model detection updated"
            );
        }

        Ok(Some(model_providers))
    }

    /// Admin-triggered connectivity test. Runs on a fresh bounded client
    /// so stopping the monitor never interferes with user-initiated tests.
    pub async fn test_connection(&self, src: &Source) -> Result<(), String> {
        let settings = self.settings.read().await.clone();
        let timeout = Duration::from_secs(settings.health_timeout_seconds.max(1));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        probe_source(&client, src, timeout).await
    }

    /// Balance lookup, only meaningful for `newapi` sources.
    pub async fn check_balance(&self, src: &Arc<Source>) -> Result<f64, String> {
        if src.source_type != SourceType::Newapi {
            return Err(format!(
                "balance check not supported for type: {}",
                src.source_type.as_str()
            ));
        }

        let settings = self.settings.read().await.clone();
        let timeout = Duration::from_secs(settings.health_timeout_seconds.max(1));
        let url = format!("{}/api/user/self", src.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .bearer_auth(&src.api_key)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(format!("status {}", resp.status().as_u16()));
        }
        let body: Value = resp.json().await.map_err(|e| e.to_string())?;
        let quota = body
            .get("data")
            .and_then(|d| d.get("quota"))
            .and_then(Value::as_f64)
            .ok_or_else(|| "missing quota field".to_string())?;

        let balance = quota / 500_000.0;
        let mut status = src.status();
        status.balance = balance;
        src.set_status(status);
        Ok(balance)
    }
}

/// GET `{base_url}/v1/models` with source-type-appropriate auth.
pub async fn probe_source(
    client: &reqwest::Client,
    src: &Source,
    timeout: Duration,
) -> Result<(), String> {
    send_probe(client, src, timeout).await.map(|_| ())
}

async fn send_probe(
    client: &reqwest::Client,
    src: &Source,
    timeout: Duration,
) -> Result<reqwest::Response, String> {
    let url = format!("{}/v1/models", src.base_url.trim_end_matches('/'));
    let builder = crate::proxy::upstream_auth(client.get(url).timeout(timeout), src);
    let resp = builder.send().await.map_err(|e| e.to_string())?;
    if resp.status() != reqwest::StatusCode::OK {
        let status = resp.status();
        let body = read_limited(resp, ERROR_BODY_LIMIT).await;
        return Err(format!("status {}: {}", status.as_u16(), body));
    }
    Ok(resp)
}

/// Reads at most `limit` bytes of a response body; upstream error pages
/// must never balloon memory or log rows.
pub async fn read_limited(resp: reqwest::Response, limit: usize) -> String {
    let mut out: Vec<u8> = Vec::with_capacity(limit.min(1024));
    let mut stream = resp.bytes_stream();
    while let Some(Ok(chunk)) = stream.next().await {
        let remaining = limit.saturating_sub(out.len());
        if remaining == 0 {
            break;
        }
        let take = chunk.len().min(remaining);
        out.extend_from_slice(&chunk[..take]);
        if out.len() >= limit {
            break;
        }
    }
    String::from_utf8_lossy(&out).trim().to_string()
}

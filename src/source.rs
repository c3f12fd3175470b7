use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Newapi,
    Cpa,
    Openai,
    Anthropic,
    Custom,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Newapi => "newapi",
            Self::Cpa => "cpa",
            Self::Openai => "openai",
            Self::Anthropic => "anthropic",
            Self::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "newapi" => Some(Self::Newapi),
            "cpa" => Some(Self::Cpa),
            "openai" => Some(Self::Openai),
            "anthropic" => Some(Self::Anthropic),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    /// Terminal value reserved for admin-initiated retirement.
    Removed,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Removed => "removed",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub function_calling: bool,
    #[serde(default)]
    pub extended_thinking: bool,
    #[serde(default)]
    pub vision: bool,
    /// Empty means every model is accepted.
    #[serde(default)]
    pub models: Vec<String>,
}

/// Aggregator-specific configuration for `cpa` sources whose capabilities
/// depend on a per-model sub-provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Enabled sub-providers: gemini, claude, codex, qwen.
    #[serde(default)]
    pub providers: Vec<String>,
    /// "single" restricts to the first provider, "multi" allows all.
    #[serde(default)]
    pub account_mode: String,
    #[serde(default)]
    pub auto_detect: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ProviderCap {
    pub function_calling: bool,
    pub vision: bool,
}

/// Fixed capability matrix for aggregator sub-providers. Extended thinking
/// is never available through an aggregator.
pub fn provider_capability(provider: &str) -> Option<ProviderCap> {
    match provider {
        "gemini" | "claude" | "codex" => Some(ProviderCap {
            function_calling: true,
            vision: true,
        }),
        "qwen" => Some(ProviderCap {
            function_calling: false,
            vision: true,
        }),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub state: HealthState,
    pub latency_ms: i64,
    pub balance: f64,
    pub last_check: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error: String,
    #[serde(skip_serializing)]
    pub consecutive_fail: u32,
    /// model id -> sub-provider, populated by the health monitor for
    /// auto-detecting aggregators.
    #[serde(skip_serializing)]
    pub model_providers: HashMap<String, String>,
}

impl Default for SourceStatus {
    fn default() -> Self {
        Self {
            state: HealthState::Healthy,
            latency_ms: 0,
            balance: 0.0,
            last_check: None,
            error_count: 0,
            last_error: String::new(),
            consecutive_fail: 0,
            model_providers: HashMap::new(),
        }
    }
}

/// Persisted / admin-facing shape of a source. Runtime state lives on
/// [`Source`], never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_weight")]
    pub weight: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregator: Option<AggregatorConfig>,
}

fn default_priority() -> i32 {
    1
}

fn default_weight() -> i32 {
    100
}

fn default_enabled() -> bool {
    true
}

/// One upstream provider endpoint. Identity and connection fields are
/// immutable after construction; status and capabilities sit behind their
/// own lock and every read returns a deep copy, so no caller can retain a
/// reference into live maps.
#[derive(Debug)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub source_type: SourceType,
    pub base_url: String,
    pub api_key: String,
    pub priority: i32,
    pub weight: i32,
    pub enabled: bool,
    pub aggregator: Option<AggregatorConfig>,
    capabilities: RwLock<Capabilities>,
    status: RwLock<SourceStatus>,
}

impl Source {
    pub fn from_config(cfg: SourceConfig) -> Self {
        Self {
            id: cfg.id,
            name: cfg.name,
            source_type: cfg.source_type,
            base_url: cfg.base_url,
            api_key: cfg.api_key,
            priority: cfg.priority,
            weight: cfg.weight,
            enabled: cfg.enabled,
            aggregator: cfg.aggregator,
            capabilities: RwLock::new(cfg.capabilities),
            status: RwLock::new(SourceStatus::default()),
        }
    }

    pub fn to_config(&self) -> SourceConfig {
        SourceConfig {
            id: self.id.clone(),
            name: self.name.clone(),
            source_type: self.source_type,
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            priority: self.priority,
            weight: self.weight,
            enabled: self.enabled,
            capabilities: self.capabilities(),
            aggregator: self.aggregator.clone(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities.read().expect("capabilities lock").clone()
    }

    pub fn set_capabilities(&self, caps: Capabilities) {
        *self.capabilities.write().expect("capabilities lock") = caps;
    }

    pub fn status(&self) -> SourceStatus {
        self.status.read().expect("status lock").clone()
    }

    pub fn set_status(&self, status: SourceStatus) {
        *self.status.write().expect("status lock") = status;
    }

    pub fn is_healthy(&self) -> bool {
        self.status.read().expect("status lock").state == HealthState::Healthy
    }

    pub fn supports_model(&self, model: &str) -> bool {
        let caps = self.capabilities.read().expect("capabilities lock");
        caps.models.is_empty() || caps.models.iter().any(|m| m == model)
    }

    /// Sub-provider detected for a model on an aggregator, if any.
    pub fn provider_for_model(&self, model: &str) -> Option<String> {
        self.status
            .read()
            .expect("status lock")
            .model_providers
            .get(model)
            .cloned()
    }

    /// Providers effectively enabled on an aggregator: single-account mode
    /// restricts to the first configured entry.
    pub fn effective_providers(&self) -> Vec<String> {
        let Some(agg) = &self.aggregator else {
            return Vec::new();
        };
        if agg.providers.is_empty() {
            return Vec::new();
        }
        if agg.account_mode == "single" && agg.providers.len() > 1 {
            return agg.providers[..1].to_vec();
        }
        agg.providers.clone()
    }

    pub fn is_provider_enabled(&self, provider: &str) -> bool {
        if provider.is_empty() {
            return false;
        }
        let effective = self.effective_providers();
        effective.is_empty() || effective.iter().any(|p| p == provider)
    }

    /// Whether this source can natively call tools for the given model.
    /// Aggregators resolve through the detected sub-provider; when the
    /// provider is unknown, falls back to the capability of any enabled
    /// provider, then to the declared bit.
    pub fn supports_fc_for_model(&self, model: &str) -> bool {
        if self.source_type != SourceType::Cpa {
            return self.capabilities().function_calling;
        }
        match self.provider_for_model(model) {
            Some(provider) => {
                if !self.is_provider_enabled(&provider) {
                    return false;
                }
                provider_capability(&provider)
                    .map(|cap| cap.function_calling)
                    .unwrap_or(false)
            }
            None => {
                if self
                    .aggregator
                    .as_ref()
                    .map(|a| !a.providers.is_empty())
                    .unwrap_or(false)
                {
                    return self.effective_providers().iter().any(|p| {
                        provider_capability(p)
                            .map(|cap| cap.function_calling)
                            .unwrap_or(false)
                    });
                }
                self.capabilities().function_calling
            }
        }
    }

    /// Admin-facing view: secret elided, status flattened.
    pub fn to_view(&self) -> SourceView {
        SourceView {
            id: self.id.clone(),
            name: self.name.clone(),
            source_type: self.source_type,
            base_url: self.base_url.clone(),
            priority: self.priority,
            weight: self.weight,
            enabled: self.enabled,
            capabilities: self.capabilities(),
            aggregator: self.aggregator.clone(),
            status: self.status(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceView {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub base_url: String,
    pub priority: i32,
    pub weight: i32,
    pub enabled: bool,
    pub capabilities: Capabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregator: Option<AggregatorConfig>,
    pub status: SourceStatus,
}

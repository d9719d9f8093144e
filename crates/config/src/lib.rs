use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible endpoint, e.g. `http://localhost:8080`.
    /// Overridden at runtime by `MAESTRO_LLM_ENDPOINT` when set.
    pub endpoint: String,
    /// Bearer token sent with every request. Overridden by `MAESTRO_API_KEY`.
    pub api_key: String,
    pub timeout_ms: u64,
    pub cache_ttl_ms: u64,
    pub cache_capacity: usize,
    pub batch_max_size: usize,
    pub batch_debounce_ms: u64,
    /// Model used when no per-kind preference matches.
    pub default_model: String,
    /// Tried in order when the preferred model is saturated or the endpoint
    /// fails with 5xx.
    pub fallback_models: Vec<String>,
    /// Per-request-kind preferred model, e.g. `tool_planning = "small-planner"`.
    /// Kept last: TOML wants plain values before tables.
    pub preferred_models: HashMap<String, String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            api_key: String::new(),
            timeout_ms: 30_000,
            cache_ttl_ms: 60_000,
            cache_capacity: 100,
            batch_max_size: 5,
            batch_debounce_ms: 100,
            default_model: "gpt-4o-mini".to_string(),
            fallback_models: vec![],
            preferred_models: HashMap::new(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn batch_debounce(&self) -> Duration {
        Duration::from_millis(self.batch_debounce_ms)
    }

    /// Preferred model for a request kind, falling back to the default model.
    pub fn model_for_kind(&self, kind: &str) -> &str {
        self.preferred_models
            .get(kind)
            .map(String::as_str)
            .unwrap_or(&self.default_model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub max_concurrent: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Above this queue depth, non-critical enqueues are rejected immediately.
    pub queue_soft_limit: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            queue_soft_limit: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_ms: u64,
    pub half_open_admit_max: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_ms: 30_000,
            half_open_admit_max: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery(&self) -> Duration {
        Duration::from_millis(self.recovery_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityConfig {
    /// TTL of the cached `/v1/models` list.
    pub model_list_ttl_ms: u64,
    /// TTL of each per-model availability verdict.
    pub per_model_ttl_ms: u64,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            model_list_ttl_ms: 30_000,
            per_model_ttl_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub initialize_timeout_ms: u64,
    pub tool_call_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    /// When true, a handshake timeout marks the provider failed instead of
    /// forcing it ready.
    pub strict_handshake: bool,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            initialize_timeout_ms: 20_000,
            tool_call_timeout_ms: 60_000,
            shutdown_grace_ms: 3_000,
            strict_handshake: false,
        }
    }
}

impl McpConfig {
    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_millis(self.initialize_timeout_ms)
    }

    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_call_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectionConfig {
    /// `chat`, `task`, or `auto`. Governs which tools the mode inspector allows.
    pub mode: String,
    pub max_repetitions: usize,
    pub history_window: usize,
    /// Capacity of the call-history ring.
    pub history_capacity: usize,
    /// When true, repetition findings deny instead of requiring approval.
    pub strict_repetition: bool,
    /// Attach the LLM-based validator to the inspector chain.
    pub llm_validator: bool,
    /// Behaviour when the LLM validator itself fails: `allow` or `deny`.
    pub llm_fallback: String,
    /// Deny any write or delete tool regardless of mode.
    pub readonly_mode: bool,
}

impl Default for InspectionConfig {
    fn default() -> Self {
        Self {
            mode: "task".to_string(),
            max_repetitions: 3,
            history_window: 20,
            history_capacity: 1_000,
            strict_repetition: false,
            llm_validator: false,
            llm_fallback: "deny".to_string(),
            readonly_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub max_attempts_per_item: u32,
    pub parallel_items: usize,
    pub self_analysis_cooldown_ms: u64,
    /// Count `skipped` dependencies as satisfied when resolving eligibility.
    pub treat_skipped_as_done: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_item: 3,
            parallel_items: 10,
            self_analysis_cooldown_ms: 300_000,
            treat_skipped_as_done: false,
        }
    }
}

impl WorkflowConfig {
    pub fn self_analysis_cooldown(&self) -> Duration {
        Duration::from_millis(self.self_analysis_cooldown_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle TTL after which a session is evicted; the sweep runs every ttl/2.
    pub ttl_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_ms: 1_800_000 }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Launch description for one MCP tool-provider subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub command: String,
    pub args: Vec<String>,
    pub enabled: bool,
    /// Rewrite `/tmp`-prefixed path parameters to `/private/tmp` before
    /// dispatch (macOS filesystem servers resolve symlinked paths).
    pub filesystem_tmp_rewrite: bool,
    pub env: HashMap<String, String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: vec![],
            enabled: true,
            filesystem_tmp_rewrite: false,
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub rate_limiter: RateLimiterConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub availability: AvailabilityConfig,
    pub mcp: McpConfig,
    pub inspection: InspectionConfig,
    pub workflow: WorkflowConfig,
    pub sessions: SessionConfig,
    pub telemetry: TelemetryConfig,
    pub providers: HashMap<String, ProviderConfig>,
}

impl AppConfig {
    /// Load from a TOML file, falling back to defaults when the file is
    /// missing, then apply environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("MAESTRO_LLM_ENDPOINT") {
            if !value.is_empty() {
                config.llm.endpoint = value;
            }
        }
        if let Ok(value) = env::var("MAESTRO_API_KEY") {
            if !value.is_empty() {
                config.llm.api_key = value;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Startup sanity checks. Violations are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.llm.endpoint.trim().is_empty() {
            bail!("llm.endpoint must not be empty");
        }
        if self.llm.cache_capacity == 0 {
            bail!("llm.cache_capacity must be at least 1");
        }
        if self.llm.batch_max_size == 0 {
            bail!("llm.batch_max_size must be at least 1");
        }
        if self.rate_limiter.max_concurrent == 0 {
            bail!("rate_limiter.max_concurrent must be at least 1");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            bail!("circuit_breaker.failure_threshold must be at least 1");
        }
        if self.workflow.max_attempts_per_item == 0 {
            bail!("workflow.max_attempts_per_item must be at least 1");
        }
        if self.workflow.parallel_items == 0 {
            bail!("workflow.parallel_items must be at least 1");
        }
        if !matches!(self.inspection.mode.as_str(), "chat" | "task" | "auto") {
            bail!(
                "inspection.mode must be one of chat/task/auto, got {:?}",
                self.inspection.mode
            );
        }
        if !matches!(self.inspection.llm_fallback.as_str(), "allow" | "deny") {
            bail!(
                "inspection.llm_fallback must be allow or deny, got {:?}",
                self.inspection.llm_fallback
            );
        }
        for (name, provider) in &self.providers {
            if provider.enabled && provider.command.trim().is_empty() {
                bail!("providers.{name}.command must not be empty");
            }
        }
        Ok(())
    }

    /// Enabled providers only, in name order for deterministic startup logs.
    pub fn enabled_providers(&self) -> Vec<(&str, &ProviderConfig)> {
        let mut providers: Vec<_> = self
            .providers
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(name, p)| (name.as_str(), p))
            .collect();
        providers.sort_by_key(|(name, _)| *name);
        providers
    }

    /// Preferred model for a request kind, falling back to the default model.
    pub fn model_for_kind(&self, kind: &str) -> &str {
        self.llm
            .preferred_models
            .get(kind)
            .map(String::as_str)
            .unwrap_or(&self.llm.default_model)
    }
}

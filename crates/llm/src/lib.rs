//! Everything outbound-HTTP: the OpenAI-compatible endpoint client, the
//! adaptive rate limiter and circuit breaker in front of it, the model
//! availability checker, and the optimizer facade every LLM call flows
//! through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use maestro_core::Result;

pub mod availability;
pub mod breaker;
pub mod client;
pub mod fingerprint;
pub mod limiter;
pub mod optimizer;

pub use availability::{Availability, AvailabilitySource, ModelAvailability};
pub use breaker::{BreakerState, CircuitBreaker};
pub use client::EndpointClient;
pub use limiter::{Priority, RateLimiter};
pub use optimizer::{LlmOptimizer, SystemSelection};

// ── Chat types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// What a caller wants from the endpoint; the optimizer picks the model when
/// `model` is unset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatRequest {
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Ask for a JSON object response (`response_format`).
    pub json_response: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatOutcome {
    pub model: String,
    pub content: String,
    pub finish_reason: String,
    /// True when a fallback model answered instead of the selected one.
    pub fallback: bool,
}

// ── Request kinds ────────────────────────────────────────────────────────────

/// Why an LLM call is being made. Drives model preference, batching
/// eligibility, and fingerprinting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    ModeSelection,
    ServerSelection,
    ToolPlanning,
    SystemSelection,
    TodoBuilding,
    ChatCompletion,
    Verification,
    Replanning,
    Summary,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::ModeSelection => "mode_selection",
            RequestKind::ServerSelection => "server_selection",
            RequestKind::ToolPlanning => "tool_planning",
            RequestKind::SystemSelection => "system_selection",
            RequestKind::TodoBuilding => "todo_building",
            RequestKind::ChatCompletion => "chat_completion",
            RequestKind::Verification => "verification",
            RequestKind::Replanning => "replanning",
            RequestKind::Summary => "summary",
        }
    }

    /// Only the small classification-style kinds are worth batching.
    pub fn is_batchable(self) -> bool {
        matches!(
            self,
            RequestKind::ModeSelection
                | RequestKind::ServerSelection
                | RequestKind::ToolPlanning
                | RequestKind::SystemSelection
        )
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Model records ────────────────────────────────────────────────────────────

/// Rate-limit hints the endpoint attaches to a model entry.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct RateLimitInfo {
    #[serde(default)]
    pub per_minute: Option<u32>,
    #[serde(default)]
    pub adaptive_hard_cap: Option<bool>,
    #[serde(default)]
    pub adaptive_guess: Option<f64>,
    /// Unix seconds of the most recent observed 429.
    #[serde(default)]
    pub adaptive_last429_at: Option<f64>,
    #[serde(default)]
    pub window_seconds: Option<u64>,
}

/// One entry from `GET /v1/models`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ModelRecord {
    pub id: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default, rename = "rate_limit")]
    pub rate_limit_info: Option<RateLimitInfo>,
}

// ── Transport seam ───────────────────────────────────────────────────────────

/// The raw HTTP surface. [`EndpointClient`] is the production implementation;
/// tests substitute in-process fakes.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    /// One `POST /v1/chat/completions`. Failure kinds: `LlmRateLimited` for
    /// 429, `LlmUnavailable` for 5xx/connect errors, `LlmParse` for a body
    /// that is not the expected shape.
    async fn chat_completion(&self, model: &str, request: &ChatRequest) -> Result<ChatOutcome>;

    /// `GET /v1/models`.
    async fn list_models(&self) -> Result<Vec<ModelRecord>>;
}

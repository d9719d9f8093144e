//! Shared primitives for the Maestro orchestrator: the error taxonomy used by
//! every layer, the id-correlated awaiter table, and a TTL+capacity cache.

use serde::{Deserialize, Serialize};

pub mod awaiter;
pub mod cache;

pub use awaiter::{Awaiter, AwaiterTable};
pub use cache::TtlCache;

// ── Error taxonomy ───────────────────────────────────────────────────────────

/// Every failure in the orchestrator maps to exactly one of these kinds.
/// Retry policies switch on the kind, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad startup configuration. Fatal; halts initialization.
    Config,
    /// Provider subprocess failed to spawn, exited, or its stdio broke.
    ProviderUnreachable,
    /// Provider is spawning or draining; transient.
    ProviderNotReady,
    /// No tool descriptor matches after normalization. Soft failure.
    ToolNotFound,
    /// Required parameter missing or type mismatch, no autocorrection possible.
    ToolSchemaViolation,
    /// Tool-call awaiter deadline elapsed; retriable at the workflow layer.
    ToolTimeout,
    /// Provider returned a JSON-RPC error object.
    ToolError,
    /// Policy inspection denied the call.
    InspectionDenied,
    /// The validation pipeline rejected the batch.
    ValidationFailed,
    /// 429 or open circuit; retriable with backoff.
    LlmRateLimited,
    /// All LLM fallbacks exhausted.
    LlmUnavailable,
    /// LLM response failed to parse into the expected shape.
    LlmParse,
    /// A workflow item exceeded its attempt budget.
    WorkflowGiveup,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::ProviderUnreachable => "provider_unreachable",
            ErrorKind::ProviderNotReady => "provider_not_ready",
            ErrorKind::ToolNotFound => "tool_not_found",
            ErrorKind::ToolSchemaViolation => "tool_schema_violation",
            ErrorKind::ToolTimeout => "tool_timeout",
            ErrorKind::ToolError => "tool_error",
            ErrorKind::InspectionDenied => "inspection_denied",
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::LlmRateLimited => "llm_rate_limited",
            ErrorKind::LlmUnavailable => "llm_unavailable",
            ErrorKind::LlmParse => "llm_parse",
            ErrorKind::WorkflowGiveup => "workflow_giveup",
        }
    }

    /// Transient kinds may be retried by the layer whose policy owns them.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::ProviderNotReady | ErrorKind::ToolTimeout | ErrorKind::LlmRateLimited
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The orchestrator-wide error type: a taxonomy kind, a human-readable reason,
/// and an optional suggestion surfaced to the user (e.g. a near-miss tool name).
///
/// `Clone` is required so deduplicated in-flight LLM requests can hand the same
/// failure to every waiter.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<String>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn suggestion(&self) -> Option<&str> {
        self.suggestion.as_deref()
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolTimeout, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrips_through_display() {
        assert_eq!(ErrorKind::ProviderUnreachable.to_string(), "provider_unreachable");
        assert_eq!(ErrorKind::LlmRateLimited.to_string(), "llm_rate_limited");
    }

    #[test]
    fn transient_kinds() {
        assert!(ErrorKind::ProviderNotReady.is_transient());
        assert!(ErrorKind::ToolTimeout.is_transient());
        assert!(ErrorKind::LlmRateLimited.is_transient());
        assert!(!ErrorKind::ToolNotFound.is_transient());
        assert!(!ErrorKind::Config.is_transient());
    }

    #[test]
    fn error_carries_suggestion() {
        let err = Error::new(ErrorKind::ToolNotFound, "no tool named read_fil")
            .with_suggestion("filesystem__read_file");
        assert_eq!(err.kind(), ErrorKind::ToolNotFound);
        assert_eq!(err.suggestion(), Some("filesystem__read_file"));
        assert_eq!(err.to_string(), "tool_not_found: no tool named read_fil");
    }
}

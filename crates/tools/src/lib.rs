//! Tool catalog, validation, inspection, and dispatch.
//!
//! Everything between "the LLM planned some tool calls" and "the supervisor
//! wrote `tools/call` frames": a flat qualified-name catalog over all
//! providers, one normalization pass at the boundary, a multi-stage
//! validation pipeline, a policy inspector chain, and an order-preserving
//! batch dispatcher backed by the call history.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use maestro_core::{Awaiter, Result};
use maestro_mcp::{ProviderSupervisor, ToolInfo};

pub mod catalog;
pub mod dispatch;
pub mod history;
pub mod inspectors;
pub mod similarity;
pub mod validators;

pub use catalog::{CatalogSnapshot, NormalizedCall, ToolCatalog, ToolDescriptor};
pub use dispatch::{
    approval_channel, ApprovalDecision, ApprovalReceiver, ApprovalRequest, ApprovalSender,
    BatchResult, Dispatcher, ExecutionContext,
};
pub use history::{CallHistory, CallHistoryEntry, ToolStats};
pub use inspectors::{
    CallAssessment, Finding, InspectionContext, InspectionVerdict, InspectorChain, RiskAssessor,
};
pub use validators::{CallDiagnostic, ValidationContext, ValidationOutcome, ValidationPipeline};

// ── Core call types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOrigin {
    Planner,
    User,
    Retry,
}

/// A planned tool invocation as it arrives from the planner or user, before
/// normalization. `tool` may be raw, qualified, or legacy-prefixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub provider: String,
    pub tool: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default = "default_origin")]
    pub origin: CallOrigin,
}

fn default_origin() -> CallOrigin {
    CallOrigin::Planner
}

impl ToolCall {
    pub fn new(provider: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            tool: tool.into(),
            parameters: Map::new(),
            origin: CallOrigin::Planner,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Parse one planned call from loose planner JSON, stripping unknown
    /// top-level fields. Accepts `tool` or `name` for the tool field and
    /// `parameters` or `arguments` for the parameter object.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let tool = object
            .get("tool")
            .or_else(|| object.get("name"))
            .and_then(Value::as_str)?
            .to_string();
        let provider = object
            .get("provider")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let parameters = object
            .get("parameters")
            .or_else(|| object.get("arguments"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Some(Self {
            provider,
            tool,
            parameters,
            origin: CallOrigin::Planner,
        })
    }
}

/// Outcome of one dispatched tool call. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub request_id: u64,
    pub success: bool,
    /// Concatenated text blocks from the provider reply (or stringified
    /// result when the reply carried no text blocks).
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<maestro_core::Error>,
    pub duration_ms: u64,
    pub provider: String,
    pub raw_name: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

// ── Provider seam ────────────────────────────────────────────────────────────

/// What the catalog and dispatcher need from the provider layer. The
/// production implementation is the MCP supervisor; tests use in-process
/// fakes.
#[async_trait]
pub trait ProviderPort: Send + Sync {
    fn ready_providers(&self) -> Vec<String>;
    fn tools_snapshot(&self) -> Vec<(String, Arc<Vec<ToolInfo>>)>;
    async fn call(&self, provider: &str, raw_tool: &str, arguments: &Value)
        -> Result<Awaiter<Value>>;
}

#[async_trait]
impl ProviderPort for ProviderSupervisor {
    fn ready_providers(&self) -> Vec<String> {
        ProviderSupervisor::ready_providers(self)
    }

    fn tools_snapshot(&self) -> Vec<(String, Arc<Vec<ToolInfo>>)> {
        ProviderSupervisor::tools_snapshot(self)
    }

    async fn call(
        &self,
        provider: &str,
        raw_tool: &str,
        arguments: &Value,
    ) -> Result<Awaiter<Value>> {
        ProviderSupervisor::call(self, provider, raw_tool, arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_strips_unknown_fields_and_accepts_aliases() {
        let call = ToolCall::from_value(&json!({
            "provider": "filesystem",
            "name": "read_file",
            "arguments": { "path": "/x" },
            "confidence": 0.93,
            "rationale": "because"
        }))
        .unwrap();
        assert_eq!(call.provider, "filesystem");
        assert_eq!(call.tool, "read_file");
        assert_eq!(call.parameters["path"], "/x");
    }

    #[test]
    fn from_value_requires_a_tool_name() {
        assert!(ToolCall::from_value(&json!({ "provider": "filesystem" })).is_none());
        assert!(ToolCall::from_value(&json!("just a string")).is_none());
    }
}

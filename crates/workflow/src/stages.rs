//! Stage processors and the two seams they run against: the planning LLM and
//! the tool execution pipeline. The engine composes these per item; the
//! runtime wires the traits to the optimizer and dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use maestro_core::Result;
use maestro_tools::{BatchResult, ToolCall};

use crate::todo::{TodoItem, Verification};
use crate::Mode;

/// One planned TODO entry as produced by the planning stage.
#[derive(Debug, Clone)]
pub struct PlannedItem {
    pub id: String,
    pub action: String,
    pub dependencies: Vec<String>,
}

/// Everything the engine asks of the LLM, one method per stage. Prompting
/// lives behind this seam; the engine only sees parsed results.
#[async_trait]
pub trait PlannerLlm: Send + Sync {
    async fn select_mode(&self, user_message: &str) -> Result<Mode>;
    async fn chat(&self, user_message: &str) -> Result<String>;
    async fn build_todo(&self, user_message: &str) -> Result<Vec<PlannedItem>>;
    async fn select_providers(
        &self,
        user_message: &str,
        available: Vec<String>,
    ) -> Result<Vec<String>>;
    async fn plan_tools(&self, item: &TodoItem, tools_summary: &str) -> Result<Vec<ToolCall>>;
    async fn verify(&self, item: &TodoItem, batch: &BatchResult) -> Result<Verification>;
    async fn replan(
        &self,
        item: &TodoItem,
        failure: &str,
        tools_summary: &str,
    ) -> Result<Vec<ToolCall>>;
    async fn summarize(&self, user_message: &str, item_reports: &str) -> Result<String>;
}

/// The validated-and-inspected execution path (pipeline → inspectors →
/// dispatcher) plus the catalog views the planner needs.
#[async_trait]
pub trait ToolExecutorPort: Send + Sync {
    /// `intent` is the declared purpose of the batch (the item's action),
    /// forwarded to the policy inspectors.
    async fn execute(
        &self,
        session_id: &str,
        mode: Mode,
        auto_approve: bool,
        intent: &str,
        calls: Vec<ToolCall>,
    ) -> Result<BatchResult>;

    fn tools_summary(&self, providers: &[String]) -> String;
    fn ready_providers(&self) -> Vec<String>;
}

/// Per-item stage processors. Stateless; all context rides in arguments.
pub struct ItemStages {
    llm: Arc<dyn PlannerLlm>,
    tools: Arc<dyn ToolExecutorPort>,
}

impl ItemStages {
    pub fn new(llm: Arc<dyn PlannerLlm>, tools: Arc<dyn ToolExecutorPort>) -> Self {
        Self { llm, tools }
    }

    /// Plan the item's tool calls against the (possibly narrowed) catalog.
    pub async fn plan(&self, item: &TodoItem, tools_summary: &str) -> Result<Vec<ToolCall>> {
        let calls = self.llm.plan_tools(item, tools_summary).await?;
        debug!(item = %item.id, calls = calls.len(), "planned tool calls");
        Ok(calls)
    }

    pub async fn execute(
        &self,
        session_id: &str,
        mode: Mode,
        auto_approve: bool,
        intent: &str,
        calls: Vec<ToolCall>,
    ) -> Result<BatchResult> {
        self.tools
            .execute(session_id, mode, auto_approve, intent, calls)
            .await
    }

    /// LLM-based verification with a tool-based fallback: when the verifier
    /// itself fails, the item passes iff every call in the batch succeeded.
    pub async fn verify(&self, item: &TodoItem, batch: &BatchResult) -> Verification {
        match self.llm.verify(item, batch).await {
            Ok(verification) => verification,
            Err(err) => {
                warn!(item = %item.id, %err, "verifier unavailable, falling back to tool outcomes");
                Verification {
                    passed: batch.failed == 0 && !batch.results.is_empty(),
                    reasoning: "verifier unavailable; judged by tool outcomes".to_string(),
                }
            }
        }
    }

    /// Ask for a revised plan after a failed or unverified attempt.
    pub async fn replan(
        &self,
        item: &TodoItem,
        failure: &str,
        tools_summary: &str,
    ) -> Result<Vec<ToolCall>> {
        let calls = self.llm.replan(item, failure, tools_summary).await?;
        debug!(item = %item.id, calls = calls.len(), "replanned tool calls");
        Ok(calls)
    }

    pub fn llm(&self) -> &Arc<dyn PlannerLlm> {
        &self.llm
    }

    pub fn tools(&self) -> &Arc<dyn ToolExecutorPort> {
        &self.tools
    }
}

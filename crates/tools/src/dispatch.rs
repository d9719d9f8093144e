//! Batch dispatcher: executes categorized calls against the provider layer.
//!
//! Approved calls run; denied calls become synthetic failures; calls needing
//! approval are auto-approved, routed through the approval gate, or failed.
//! Results come back in input order and every outcome lands in the call
//! history. Retries are a workflow concern, never attempted here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use maestro_core::{Error, ErrorKind};

use crate::catalog::NormalizedCall;
use crate::history::CallHistory;
use crate::inspectors::{CallAssessment, InspectionVerdict};
use crate::{ProviderPort, ToolResult};

// ── Approval gate ────────────────────────────────────────────────────────────

/// A request surfaced to the user for approval.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub qualified_name: String,
    pub parameters: Map<String, Value>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

/// Channel-based approval gate: the dispatcher sends the request, the surface
/// answers through the oneshot. A dropped oneshot counts as denial.
pub type ApprovalSender = mpsc::Sender<(ApprovalRequest, oneshot::Sender<ApprovalDecision>)>;
pub type ApprovalReceiver = mpsc::Receiver<(ApprovalRequest, oneshot::Sender<ApprovalDecision>)>;

pub fn approval_channel() -> (ApprovalSender, ApprovalReceiver) {
    mpsc::channel(16)
}

// ── Batch result ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub session_id: String,
    pub auto_approve: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    /// One result per input call, in input order.
    pub results: Vec<ToolResult>,
    pub approved: usize,
    pub needs_approval: usize,
    pub denied: usize,
    pub successful: usize,
    pub failed: usize,
    /// `tool_result` blocks ready to feed back to the LLM.
    pub formatted_for_llm: Vec<Value>,
}

// ── Dispatcher ───────────────────────────────────────────────────────────────

pub struct Dispatcher {
    port: Arc<dyn ProviderPort>,
    history: Arc<CallHistory>,
    approval_tx: Option<ApprovalSender>,
    next_request_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(port: Arc<dyn ProviderPort>, history: Arc<CallHistory>) -> Self {
        Self {
            port,
            history,
            approval_tx: None,
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Attach the interactive approval gate.
    pub fn with_approval(mut self, tx: ApprovalSender) -> Self {
        self.approval_tx = Some(tx);
        self
    }

    /// Execute one categorized batch. Calls run in declared order; the result
    /// vector matches the input order.
    pub async fn dispatch_batch(
        &self,
        batch: Vec<(NormalizedCall, CallAssessment)>,
        ctx: &ExecutionContext,
    ) -> BatchResult {
        let mut out = BatchResult::default();

        for (call, assessment) in batch {
            let result = match assessment.verdict {
                InspectionVerdict::Denied => {
                    out.denied += 1;
                    let reason = assessment
                        .deny_reason()
                        .unwrap_or("denied by policy")
                        .to_string();
                    info!(tool = %call.qualified_name, reason, "call denied");
                    self.synthetic_failure(
                        &call,
                        Error::new(ErrorKind::InspectionDenied, reason),
                    )
                }
                InspectionVerdict::RequiresApproval => {
                    out.needs_approval += 1;
                    let reason = assessment
                        .deny_reason()
                        .unwrap_or("flagged for approval")
                        .to_string();
                    if ctx.auto_approve {
                        debug!(tool = %call.qualified_name, "auto-approved");
                        self.execute(&call).await
                    } else {
                        match self.request_approval(&call, &reason).await {
                            ApprovalDecision::Approve => self.execute(&call).await,
                            ApprovalDecision::Deny => self.synthetic_failure(
                                &call,
                                Error::new(
                                    ErrorKind::InspectionDenied,
                                    format!("not approved: {reason}"),
                                ),
                            ),
                        }
                    }
                }
                InspectionVerdict::Approved => {
                    out.approved += 1;
                    self.execute(&call).await
                }
            };

            if result.success {
                out.successful += 1;
            } else {
                out.failed += 1;
            }
            self.history.record(&result, &call.parameters);
            out.formatted_for_llm.push(format_for_llm(&result));
            out.results.push(result);
        }

        out
    }

    async fn request_approval(&self, call: &NormalizedCall, reason: &str) -> ApprovalDecision {
        let Some(tx) = &self.approval_tx else {
            return ApprovalDecision::Deny;
        };
        let (decision_tx, decision_rx) = oneshot::channel();
        let request = ApprovalRequest {
            qualified_name: call.qualified_name.clone(),
            parameters: call.parameters.clone(),
            reason: reason.to_string(),
        };
        if tx.send((request, decision_tx)).await.is_err() {
            warn!(tool = %call.qualified_name, "approval gate closed");
            return ApprovalDecision::Deny;
        }
        decision_rx.await.unwrap_or(ApprovalDecision::Deny)
    }

    /// One provider round-trip; the supervisor owns the per-call deadline.
    async fn execute(&self, call: &NormalizedCall) -> ToolResult {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let arguments = Value::Object(call.parameters.clone());
        let started = Instant::now();

        let outcome = match self
            .port
            .call(&call.provider, &call.raw_name, &arguments)
            .await
        {
            Ok(awaiter) => awaiter.recv().await,
            Err(err) => Err(err),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(reply) => {
                let is_error = reply
                    .get("isError")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let content = extract_text(&reply);
                if is_error {
                    debug!(tool = %call.qualified_name, duration_ms, "provider reported tool error");
                }
                ToolResult {
                    request_id,
                    success: !is_error,
                    content,
                    error: is_error
                        .then(|| Error::new(ErrorKind::ToolError, "provider reported an error")),
                    duration_ms,
                    provider: call.provider.clone(),
                    raw_name: call.raw_name.clone(),
                    timestamp: chrono::Utc::now(),
                }
            }
            Err(error) => {
                warn!(tool = %call.qualified_name, %error, duration_ms, "call failed");
                ToolResult {
                    request_id,
                    success: false,
                    content: String::new(),
                    error: Some(error),
                    duration_ms,
                    provider: call.provider.clone(),
                    raw_name: call.raw_name.clone(),
                    timestamp: chrono::Utc::now(),
                }
            }
        }
    }

    fn synthetic_failure(&self, call: &NormalizedCall, error: Error) -> ToolResult {
        ToolResult {
            request_id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            success: false,
            content: String::new(),
            error: Some(error),
            duration_ms: 0,
            provider: call.provider.clone(),
            raw_name: call.raw_name.clone(),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Concatenated `content[].text` entries, or the stringified result when the
/// reply carries no text blocks.
fn extract_text(reply: &Value) -> String {
    let blocks: Vec<&str> = reply
        .get("content")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter(|entry| {
                    entry.get("type").and_then(Value::as_str).unwrap_or("text") == "text"
                })
                .filter_map(|entry| entry.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    if blocks.is_empty() {
        reply.to_string()
    } else {
        blocks.join("\n")
    }
}

fn format_for_llm(result: &ToolResult) -> Value {
    let content = if result.success {
        result.content.clone()
    } else {
        result
            .error
            .as_ref()
            .map(|error| error.to_string())
            .unwrap_or_else(|| "tool call failed".to_string())
    };
    json!({
        "type": "tool_result",
        "request_id": result.request_id,
        "success": result.success,
        "content": content,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspectors::{Finding, InspectionVerdict};
    use crate::CallOrigin;
    use async_trait::async_trait;
    use maestro_core::{Awaiter, AwaiterTable, Result};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Provider fake that records wire calls and replies with a canned value.
    struct RecordingPort {
        calls: Mutex<Vec<(String, String, Value)>>,
        reply: Value,
        table: Arc<AwaiterTable<u64, Value>>,
        next: AtomicU64,
    }

    impl RecordingPort {
        fn new(reply: Value) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                reply,
                table: Arc::new(AwaiterTable::new()),
                next: AtomicU64::new(1),
            }
        }
    }

    #[async_trait]
    impl ProviderPort for RecordingPort {
        fn ready_providers(&self) -> Vec<String> {
            vec!["filesystem".to_string()]
        }

        fn tools_snapshot(&self) -> Vec<(String, Arc<Vec<maestro_mcp::ToolInfo>>)> {
            vec![]
        }

        async fn call(
            &self,
            provider: &str,
            raw_tool: &str,
            arguments: &Value,
        ) -> Result<Awaiter<Value>> {
            self.calls.lock().unwrap().push((
                provider.to_string(),
                raw_tool.to_string(),
                arguments.clone(),
            ));
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            let awaiter = self.table.register(
                id,
                Duration::from_secs(5),
                Error::timeout("test deadline"),
            );
            self.table.resolve(&id, self.reply.clone());
            Ok(awaiter)
        }
    }

    fn normalized(provider: &str, raw: &str, params: &[(&str, Value)]) -> NormalizedCall {
        NormalizedCall {
            provider: provider.to_string(),
            raw_name: raw.to_string(),
            qualified_name: format!("{provider}__{raw}"),
            parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            origin: CallOrigin::Planner,
        }
    }

    fn approved() -> CallAssessment {
        CallAssessment {
            verdict: InspectionVerdict::Approved,
            findings: vec![],
        }
    }

    fn needs_approval(reason: &str) -> CallAssessment {
        CallAssessment {
            verdict: InspectionVerdict::RequiresApproval,
            findings: vec![Finding {
                inspector: "repetition",
                verdict: InspectionVerdict::RequiresApproval,
                reason: reason.to_string(),
            }],
        }
    }

    fn ctx(auto_approve: bool) -> ExecutionContext {
        ExecutionContext {
            session_id: "s1".to_string(),
            auto_approve,
        }
    }

    #[tokio::test]
    async fn dispatch_sends_raw_name_and_arguments() {
        let reply = json!({"content": [{"type": "text", "text": "file contents"}]});
        let port = Arc::new(RecordingPort::new(reply));
        let dispatcher = Dispatcher::new(port.clone(), Arc::new(CallHistory::default()));

        let call = normalized(
            "filesystem",
            "read_file",
            &[("path", json!("/private/tmp/a.txt"))],
        );
        let batch = dispatcher
            .dispatch_batch(vec![(call, approved())], &ctx(false))
            .await;

        let wire = port.calls.lock().unwrap();
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].0, "filesystem");
        assert_eq!(wire[0].1, "read_file");
        assert_eq!(wire[0].2["path"], "/private/tmp/a.txt");

        assert_eq!(batch.successful, 1);
        assert_eq!(batch.results[0].content, "file contents");
        assert_eq!(batch.formatted_for_llm[0]["type"], "tool_result");
    }

    #[tokio::test]
    async fn denied_call_becomes_synthetic_failure_without_dispatch() {
        let port = Arc::new(RecordingPort::new(json!({})));
        let history = Arc::new(CallHistory::default());
        let dispatcher = Dispatcher::new(port.clone(), history.clone());

        let call = normalized("filesystem", "delete_file", &[("path", json!("/a"))]);
        let assessment = CallAssessment {
            verdict: InspectionVerdict::Denied,
            findings: vec![Finding {
                inspector: "mode",
                verdict: InspectionVerdict::Denied,
                reason: "write in chat mode".to_string(),
            }],
        };
        let batch = dispatcher
            .dispatch_batch(vec![(call, assessment)], &ctx(true))
            .await;

        assert!(port.calls.lock().unwrap().is_empty());
        assert_eq!(batch.denied, 1);
        assert_eq!(batch.failed, 1);
        let error = batch.results[0].error.as_ref().unwrap();
        assert_eq!(error.kind(), ErrorKind::InspectionDenied);
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn approval_required_without_gate_is_not_dispatched() {
        let port = Arc::new(RecordingPort::new(json!({})));
        let dispatcher = Dispatcher::new(port.clone(), Arc::new(CallHistory::default()));

        let call = normalized("playwright", "click", &[("selector", json!("#a"))]);
        let batch = dispatcher
            .dispatch_batch(
                vec![(call, needs_approval("exact repetition within window"))],
                &ctx(false),
            )
            .await;

        assert!(port.calls.lock().unwrap().is_empty());
        assert_eq!(batch.needs_approval, 1);
        let error = batch.results[0].error.as_ref().unwrap();
        assert!(error.message().contains("exact repetition within window"));
    }

    #[tokio::test]
    async fn auto_approve_executes_flagged_calls() {
        let reply = json!({"content": [{"type": "text", "text": "clicked"}]});
        let port = Arc::new(RecordingPort::new(reply));
        let dispatcher = Dispatcher::new(port.clone(), Arc::new(CallHistory::default()));

        let call = normalized("playwright", "click", &[("selector", json!("#a"))]);
        let batch = dispatcher
            .dispatch_batch(vec![(call, needs_approval("repeated"))], &ctx(true))
            .await;

        assert_eq!(port.calls.lock().unwrap().len(), 1);
        assert_eq!(batch.successful, 1);
    }

    #[tokio::test]
    async fn interactive_gate_can_approve() {
        let reply = json!({"content": [{"type": "text", "text": "done"}]});
        let port = Arc::new(RecordingPort::new(reply));
        let (tx, mut rx) = approval_channel();
        let dispatcher =
            Dispatcher::new(port.clone(), Arc::new(CallHistory::default())).with_approval(tx);

        tokio::spawn(async move {
            while let Some((request, decision_tx)) = rx.recv().await {
                assert!(!request.reason.is_empty());
                let _ = decision_tx.send(ApprovalDecision::Approve);
            }
        });

        let call = normalized("playwright", "click", &[("selector", json!("#a"))]);
        let batch = dispatcher
            .dispatch_batch(vec![(call, needs_approval("repeated"))], &ctx(false))
            .await;
        assert_eq!(batch.successful, 1);
    }

    #[tokio::test]
    async fn provider_is_error_reply_maps_to_tool_error() {
        let reply = json!({
            "isError": true,
            "content": [{"type": "text", "text": "no such file"}]
        });
        let port = Arc::new(RecordingPort::new(reply));
        let dispatcher = Dispatcher::new(port.clone(), Arc::new(CallHistory::default()));

        let call = normalized("filesystem", "read_file", &[("path", json!("/missing"))]);
        let batch = dispatcher
            .dispatch_batch(vec![(call, approved())], &ctx(false))
            .await;

        assert_eq!(batch.failed, 1);
        assert_eq!(batch.results[0].content, "no such file");
        assert_eq!(
            batch.results[0].error.as_ref().unwrap().kind(),
            ErrorKind::ToolError
        );
    }

    #[tokio::test]
    async fn batch_preserves_input_order_and_counts() {
        let reply = json!({"content": [{"type": "text", "text": "ok"}]});
        let port = Arc::new(RecordingPort::new(reply));
        let dispatcher = Dispatcher::new(port.clone(), Arc::new(CallHistory::default()));

        let batch = dispatcher
            .dispatch_batch(
                vec![
                    (normalized("filesystem", "read_file", &[("path", json!("/1"))]), approved()),
                    (
                        normalized("filesystem", "delete_file", &[("path", json!("/2"))]),
                        CallAssessment {
                            verdict: InspectionVerdict::Denied,
                            findings: vec![],
                        },
                    ),
                    (normalized("filesystem", "read_file", &[("path", json!("/3"))]), approved()),
                ],
                &ctx(false),
            )
            .await;

        assert_eq!(batch.results.len(), 3);
        assert_eq!(batch.results[0].raw_name, "read_file");
        assert_eq!(batch.results[1].raw_name, "delete_file");
        assert!(!batch.results[1].success);
        assert_eq!(batch.results[2].raw_name, "read_file");
        assert_eq!(batch.approved, 2);
        assert_eq!(batch.denied, 1);
        assert_eq!(batch.successful, 2);
        assert_eq!(batch.failed, 1);
    }

    #[test]
    fn extract_text_falls_back_to_stringified_reply() {
        assert_eq!(
            extract_text(&json!({"content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]})),
            "a\nb"
        );
        assert_eq!(extract_text(&json!({"value": 3})), r#"{"value":3}"#);
    }
}

//! The workflow engine: one entry point per user request.
//!
//! `chat` short-circuits to a single LLM response; `dev` goes through the
//! self-analysis throttle; `task` builds the TODO DAG and drives items
//! through plan → execute → verify → replan with a bounded worker pool.
//! Items with no path between them may run in parallel; DAG order is always
//! observed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use maestro_config::WorkflowConfig;
use maestro_core::{Error, ErrorKind, Result};
use maestro_tools::{ToolCall, ToolResult};

use crate::events::{EventBus, SessionEvent};
use crate::sessions::SessionStore;
use crate::stages::{ItemStages, PlannerLlm, ToolExecutorPort};
use crate::todo::{ItemStatus, TodoItem, TodoList, Verification};
use crate::Mode;

// ── Outcome types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ItemReport {
    pub id: String,
    pub status: ItemStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: String,
    pub mode: Mode,
    pub summary: String,
    pub items: Vec<ItemReport>,
}

/// What one item run produced, applied to the TODO under the scheduler lock.
struct ItemFinish {
    status: ItemStatus,
    reason: Option<String>,
    attempts: u32,
    planned: Vec<ToolCall>,
    results: Vec<ToolResult>,
    verification: Option<Verification>,
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct WorkflowEngine {
    config: WorkflowConfig,
    stages: Arc<ItemStages>,
    events: Arc<EventBus>,
    sessions: Arc<SessionStore>,
    last_self_analysis: Mutex<Option<Instant>>,
}

impl WorkflowEngine {
    pub fn new(
        config: WorkflowConfig,
        llm: Arc<dyn PlannerLlm>,
        tools: Arc<dyn ToolExecutorPort>,
        events: Arc<EventBus>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            config,
            stages: Arc::new(ItemStages::new(llm, tools)),
            events,
            sessions,
            last_self_analysis: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Drive one user request to completion.
    pub async fn run_session(
        self: &Arc<Self>,
        session_id: &str,
        user_message: &str,
        mode_override: Option<Mode>,
        auto_approve: bool,
    ) -> Result<SessionOutcome> {
        let cancelled = self.sessions.touch(session_id);

        let mode = match mode_override {
            Some(mode) => mode,
            None => self.stages.llm().select_mode(user_message).await.unwrap_or(Mode::Chat),
        };
        info!(session_id, %mode, "mode selected");
        self.events.emit(
            session_id,
            SessionEvent::ModeSelected { mode: mode.to_string() },
        );

        let outcome = match mode {
            Mode::Chat => self.run_chat(session_id, user_message).await,
            Mode::Dev => self.run_self_analysis(session_id, user_message).await,
            Mode::Task => {
                self.run_task(session_id, user_message, auto_approve, cancelled)
                    .await
            }
        };

        if let Ok(outcome) = &outcome {
            self.events.emit(
                session_id,
                SessionEvent::SessionSummary { text: outcome.summary.clone() },
            );
        }
        outcome
    }

    async fn run_chat(&self, session_id: &str, user_message: &str) -> Result<SessionOutcome> {
        let reply = self.stages.llm().chat(user_message).await?;
        Ok(SessionOutcome {
            session_id: session_id.to_string(),
            mode: Mode::Chat,
            summary: reply,
            items: vec![],
        })
    }

    /// Self-analysis is gated by a cooldown so the orchestrator cannot feed
    /// back into itself in a tight loop. A throttled request returns a
    /// deterministic result including the remaining cooldown.
    async fn run_self_analysis(
        &self,
        session_id: &str,
        user_message: &str,
    ) -> Result<SessionOutcome> {
        let cooldown = self.config.self_analysis_cooldown();
        let remaining = {
            let mut last = self.last_self_analysis.lock().unwrap();
            match *last {
                Some(at) if at.elapsed() < cooldown => Some(cooldown - at.elapsed()),
                _ => {
                    *last = Some(Instant::now());
                    None
                }
            }
        };

        if let Some(remaining) = remaining {
            info!(session_id, remaining_s = remaining.as_secs(), "self-analysis throttled");
            return Ok(SessionOutcome {
                session_id: session_id.to_string(),
                mode: Mode::Dev,
                summary: format!(
                    "self-analysis throttled; retry in {}s",
                    remaining.as_secs().max(1)
                ),
                items: vec![],
            });
        }

        let analysis = self.stages.llm().chat(user_message).await?;
        Ok(SessionOutcome {
            session_id: session_id.to_string(),
            mode: Mode::Dev,
            summary: analysis,
            items: vec![],
        })
    }

    async fn run_task(
        self: &Arc<Self>,
        session_id: &str,
        user_message: &str,
        auto_approve: bool,
        cancelled: Arc<AtomicBool>,
    ) -> Result<SessionOutcome> {
        // Build the todo list; planner output feeds straight into DAG validation.
        let planned = self.stages.llm().build_todo(user_message).await?;
        let items: Vec<TodoItem> = planned
            .into_iter()
            .map(|item| TodoItem::new(item.id, item.action, item.dependencies))
            .collect();
        let todo = TodoList::build(items)?;
        self.events.emit(
            session_id,
            SessionEvent::TodoBuilt {
                item_ids: todo.items().iter().map(|item| item.id.clone()).collect(),
            },
        );

        // Provider selection narrows the catalog shown to the tool planner.
        let available = self.stages.tools().ready_providers();
        let selected = self
            .stages
            .llm()
            .select_providers(user_message, available.clone())
            .await
            .unwrap_or(available);
        let tools_summary = self.stages.tools().tools_summary(&selected);
        debug!(session_id, providers = ?selected, "providers selected");

        let todo = Arc::new(Mutex::new(todo));
        self.drive_items(session_id, auto_approve, &cancelled, &tools_summary, &todo)
            .await;

        // Summary.
        let reports: Vec<ItemReport> = todo
            .lock()
            .unwrap()
            .items()
            .iter()
            .map(|item| ItemReport {
                id: item.id.clone(),
                status: item.status,
                reason: item.status_reason.clone(),
            })
            .collect();
        let report_text = reports
            .iter()
            .map(|report| match &report.reason {
                Some(reason) => format!("- {}: {:?} ({reason})", report.id, report.status),
                None => format!("- {}: {:?}", report.id, report.status),
            })
            .collect::<Vec<_>>()
            .join("\n");
        let summary = match self.stages.llm().summarize(user_message, &report_text).await {
            Ok(summary) => summary,
            Err(err) => {
                warn!(session_id, %err, "summarizer unavailable, using item report");
                report_text
            }
        };

        Ok(SessionOutcome {
            session_id: session_id.to_string(),
            mode: Mode::Task,
            summary,
            items: reports,
        })
    }

    /// Scheduler: claim eligible items, run them on the worker pool, apply
    /// outcomes, block unreachable work, repeat until every item is terminal.
    async fn drive_items(
        self: &Arc<Self>,
        session_id: &str,
        auto_approve: bool,
        cancelled: &Arc<AtomicBool>,
        tools_summary: &str,
        todo: &Arc<Mutex<TodoList>>,
    ) {
        let pool = Arc::new(Semaphore::new(self.config.parallel_items));
        let mut running: JoinSet<(String, ItemFinish)> = JoinSet::new();

        loop {
            if cancelled.load(Ordering::Relaxed) {
                warn!(session_id, "session cancelled, skipping remaining items");
                {
                    let mut todo = todo.lock().unwrap();
                    let pending: Vec<String> = todo
                        .items()
                        .iter()
                        .filter(|item| item.status == ItemStatus::Pending)
                        .map(|item| item.id.clone())
                        .collect();
                    for id in pending {
                        let _ = todo.transition(&id, ItemStatus::Skipped);
                        if let Some(item) = todo.get_mut(&id) {
                            item.status_reason = Some("session cancelled".to_string());
                        }
                        self.events
                            .emit(session_id, SessionEvent::ItemSkipped { item_id: id });
                    }
                }
                // Running items finish on their own deadlines.
                while let Some(finished) = running.join_next().await {
                    if let Ok((id, finish)) = finished {
                        self.apply_finish(session_id, todo, &id, finish);
                    }
                }
                break;
            }

            // Claim everything currently eligible.
            let claimed: Vec<TodoItem> = {
                let mut todo = todo.lock().unwrap();
                let ids = todo.eligible(self.config.treat_skipped_as_done);
                ids.into_iter()
                    .filter_map(|id| {
                        todo.transition(&id, ItemStatus::InProgress).ok()?;
                        todo.get(&id).cloned()
                    })
                    .collect()
            };

            for item in claimed {
                self.events.emit(
                    session_id,
                    SessionEvent::ItemStarted { item_id: item.id.clone() },
                );
                let permit = pool
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("worker pool closed");
                let stages = self.stages.clone();
                let events = self.events.clone();
                let cancelled = cancelled.clone();
                let session_id = session_id.to_string();
                let tools_summary = tools_summary.to_string();
                let max_attempts = self.config.max_attempts_per_item;
                running.spawn(async move {
                    let _permit = permit;
                    let id = item.id.clone();
                    let finish = process_item(
                        stages,
                        events,
                        cancelled,
                        &session_id,
                        auto_approve,
                        &tools_summary,
                        max_attempts,
                        item,
                    )
                    .await;
                    (id, finish)
                });
            }

            if running.is_empty() {
                // Nothing running and nothing became eligible: done (or the
                // rest is unreachable and was blocked below).
                let all_terminal = todo.lock().unwrap().all_terminal();
                if all_terminal {
                    break;
                }
                // Defensive: pending items whose dependencies can never
                // complete are blocked so the loop terminates.
                let blocked = todo
                    .lock()
                    .unwrap()
                    .block_unreachable(self.config.treat_skipped_as_done);
                if blocked.is_empty() {
                    error!(session_id, "scheduler stalled with non-terminal items");
                    break;
                }
                continue;
            }

            match running.join_next().await {
                Some(Ok((id, finish))) => self.apply_finish(session_id, todo, &id, finish),
                Some(Err(join_error)) => {
                    error!(session_id, %join_error, "item task panicked");
                }
                None => {}
            }
        }
    }

    fn apply_finish(
        &self,
        session_id: &str,
        todo: &Arc<Mutex<TodoList>>,
        id: &str,
        finish: ItemFinish,
    ) {
        let mut todo = todo.lock().unwrap();
        if let Some(item) = todo.get_mut(id) {
            item.attempts = finish.attempts;
            item.planned_tool_calls = finish.planned;
            item.results = finish.results;
            item.verification = finish.verification;
            item.status_reason = finish.reason.clone();
        }
        let _ = todo.transition(id, finish.status);

        let event = match finish.status {
            ItemStatus::Done => SessionEvent::ItemDone { item_id: id.to_string() },
            ItemStatus::Skipped => SessionEvent::ItemSkipped { item_id: id.to_string() },
            _ => SessionEvent::ItemFailed {
                item_id: id.to_string(),
                reason: finish.reason.unwrap_or_else(|| "failed".to_string()),
            },
        };
        self.events.emit(session_id, event);

        if matches!(finish.status, ItemStatus::Failed | ItemStatus::Skipped | ItemStatus::Blocked) {
            for blocked in todo.block_unreachable(self.config.treat_skipped_as_done) {
                self.events.emit(
                    session_id,
                    SessionEvent::ItemFailed {
                        item_id: blocked,
                        reason: "blocked: dependency did not complete".to_string(),
                    },
                );
            }
        }
    }
}

// ── Per-item loop ────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn process_item(
    stages: Arc<ItemStages>,
    events: Arc<EventBus>,
    cancelled: Arc<AtomicBool>,
    session_id: &str,
    auto_approve: bool,
    tools_summary: &str,
    max_attempts: u32,
    mut item: TodoItem,
) -> ItemFinish {
    let mut attempts = 0u32;
    let mut last_failure = String::new();

    while attempts < max_attempts {
        if cancelled.load(Ordering::Relaxed) {
            return ItemFinish {
                status: ItemStatus::Skipped,
                reason: Some("session cancelled".to_string()),
                attempts,
                planned: item.planned_tool_calls,
                results: item.results,
                verification: item.verification,
            };
        }
        attempts += 1;

        // Plan (first attempt) or replan (carried over from the last round).
        if item.planned_tool_calls.is_empty() {
            match stages.plan(&item, tools_summary).await {
                Ok(calls) => item.planned_tool_calls = calls,
                Err(err) => {
                    last_failure = format!("planning failed: {err}");
                    warn!(item = %item.id, attempts, "{last_failure}");
                    continue;
                }
            }
        }

        // An item the planner considers free of tool work is simply done.
        if item.planned_tool_calls.is_empty() {
            item.verification = Some(Verification {
                passed: true,
                reasoning: "no tool calls required".to_string(),
            });
            return ItemFinish {
                status: ItemStatus::Done,
                reason: None,
                attempts,
                planned: vec![],
                results: item.results,
                verification: item.verification,
            };
        }

        for call in &item.planned_tool_calls {
            events.emit(
                session_id,
                SessionEvent::ToolDispatched {
                    item_id: item.id.clone(),
                    qualified_name: format!("{}__{}", call.provider, call.tool),
                },
            );
        }

        let batch = match stages
            .execute(
                session_id,
                Mode::Task,
                auto_approve,
                &item.action,
                item.planned_tool_calls.clone(),
            )
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                last_failure = format!("execution failed: {err}");
                warn!(item = %item.id, attempts, "{last_failure}");
                item.planned_tool_calls.clear();
                continue;
            }
        };

        for result in &batch.results {
            events.emit(
                session_id,
                SessionEvent::ToolResult {
                    item_id: item.id.clone(),
                    request_id: result.request_id,
                    success: result.success,
                },
            );
        }
        item.results.extend(batch.results.iter().cloned());

        let verification = stages.verify(&item, &batch).await;
        events.emit(
            session_id,
            SessionEvent::ItemVerified {
                item_id: item.id.clone(),
                passed: verification.passed,
            },
        );
        let passed = verification.passed;
        let reasoning = verification.reasoning.clone();
        item.verification = Some(verification);

        if passed {
            return ItemFinish {
                status: ItemStatus::Done,
                reason: None,
                attempts,
                planned: item.planned_tool_calls,
                results: item.results,
                verification: item.verification,
            };
        }

        last_failure = format!("verification failed: {reasoning}");
        debug!(item = %item.id, attempts, "{last_failure}");

        if attempts < max_attempts {
            match stages.replan(&item, &last_failure, tools_summary).await {
                Ok(calls) if !calls.is_empty() => item.planned_tool_calls = calls,
                Ok(_) | Err(_) => {
                    // Nothing better to try.
                    return ItemFinish {
                        status: ItemStatus::Failed,
                        reason: Some(format!("no viable replan: {last_failure}")),
                        attempts,
                        planned: item.planned_tool_calls,
                        results: item.results,
                        verification: item.verification,
                    };
                }
            }
        }
    }

    ItemFinish {
        status: ItemStatus::Failed,
        reason: Some(
            Error::new(
                ErrorKind::WorkflowGiveup,
                format!("gave up after {attempts} attempts: {last_failure}"),
            )
            .to_string(),
        ),
        attempts,
        planned: item.planned_tool_calls,
        results: item.results,
        verification: item.verification,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use maestro_tools::BatchResult;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use crate::stages::PlannedItem;

    /// Scripted planner: a fixed todo, one trivial call per item, optional
    /// per-item verification failures.
    struct ScriptedLlm {
        todo: Vec<PlannedItem>,
        failing_items: Vec<String>,
    }

    #[async_trait]
    impl PlannerLlm for ScriptedLlm {
        async fn select_mode(&self, _user_message: &str) -> Result<Mode> {
            Ok(Mode::Task)
        }

        async fn chat(&self, user_message: &str) -> Result<String> {
            Ok(format!("chat: {user_message}"))
        }

        async fn build_todo(&self, _user_message: &str) -> Result<Vec<PlannedItem>> {
            Ok(self.todo.clone())
        }

        async fn select_providers(
            &self,
            _user_message: &str,
            available: Vec<String>,
        ) -> Result<Vec<String>> {
            Ok(available)
        }

        async fn plan_tools(&self, item: &TodoItem, _tools_summary: &str) -> Result<Vec<ToolCall>> {
            Ok(vec![ToolCall::new("fake", "touch")
                .with_parameter("item", serde_json::json!(item.id))])
        }

        async fn verify(&self, item: &TodoItem, batch: &BatchResult) -> Result<Verification> {
            let passed = batch.failed == 0 && !self.failing_items.contains(&item.id);
            Ok(Verification {
                passed,
                reasoning: if passed { "looks right".into() } else { "wrong output".into() },
            })
        }

        async fn replan(
            &self,
            item: &TodoItem,
            _failure: &str,
            _tools_summary: &str,
        ) -> Result<Vec<ToolCall>> {
            Ok(vec![ToolCall::new("fake", "touch")
                .with_parameter("item", serde_json::json!(item.id))
                .with_parameter("retry", serde_json::json!(true))])
        }

        async fn summarize(&self, _user_message: &str, item_reports: &str) -> Result<String> {
            Ok(format!("summary:\n{item_reports}"))
        }
    }

    /// Executor fake recording start/finish order with a small latency.
    struct RecordingExecutor {
        log: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolExecutorPort for RecordingExecutor {
        async fn execute(
            &self,
            _session_id: &str,
            _mode: Mode,
            _auto_approve: bool,
            _intent: &str,
            calls: Vec<ToolCall>,
        ) -> Result<BatchResult> {
            let item = calls[0].parameters["item"].as_str().unwrap_or("?").to_string();
            self.log.lock().unwrap().push(format!("start:{item}"));
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.log.lock().unwrap().push(format!("end:{item}"));

            let results: Vec<ToolResult> = calls
                .iter()
                .enumerate()
                .map(|(index, call)| ToolResult {
                    request_id: index as u64,
                    success: true,
                    content: "ok".to_string(),
                    error: None,
                    duration_ms: 30,
                    provider: call.provider.clone(),
                    raw_name: call.tool.clone(),
                    timestamp: chrono::Utc::now(),
                })
                .collect();
            Ok(BatchResult {
                successful: results.len(),
                formatted_for_llm: vec![],
                results,
                ..Default::default()
            })
        }

        fn tools_summary(&self, _providers: &[String]) -> String {
            "fake__touch: marks an item".to_string()
        }

        fn ready_providers(&self) -> Vec<String> {
            vec!["fake".to_string()]
        }
    }

    fn diamond_plan() -> Vec<PlannedItem> {
        vec![
            PlannedItem { id: "a".into(), action: "first".into(), dependencies: vec![] },
            PlannedItem { id: "b".into(), action: "second".into(), dependencies: vec!["a".into()] },
            PlannedItem { id: "c".into(), action: "third".into(), dependencies: vec!["a".into()] },
            PlannedItem {
                id: "d".into(),
                action: "last".into(),
                dependencies: vec!["b".into(), "c".into()],
            },
        ]
    }

    fn engine(llm: ScriptedLlm, executor: Arc<RecordingExecutor>) -> Arc<WorkflowEngine> {
        let config = WorkflowConfig {
            parallel_items: 2,
            max_attempts_per_item: 3,
            ..Default::default()
        };
        Arc::new(WorkflowEngine::new(
            config,
            Arc::new(llm),
            executor,
            Arc::new(EventBus::default()),
            Arc::new(SessionStore::new(Duration::from_secs(60))),
        ))
    }

    #[tokio::test]
    async fn diamond_dag_respects_dependency_order() {
        let executor = Arc::new(RecordingExecutor { log: StdMutex::new(vec![]) });
        let engine = engine(
            ScriptedLlm { todo: diamond_plan(), failing_items: vec![] },
            executor.clone(),
        );

        let outcome = engine
            .run_session("s1", "do the diamond", Some(Mode::Task), true)
            .await
            .unwrap();

        let statuses: HashMap<&str, ItemStatus> = outcome
            .items
            .iter()
            .map(|report| (report.id.as_str(), report.status))
            .collect();
        assert!(statuses.values().all(|status| *status == ItemStatus::Done));

        let log = executor.log.lock().unwrap().clone();
        let position = |entry: &str| log.iter().position(|line| line == entry).unwrap();
        // A strictly precedes B and C; D starts only after both B and C end.
        assert!(position("end:a") < position("start:b"));
        assert!(position("end:a") < position("start:c"));
        assert!(position("start:d") > position("end:b"));
        assert!(position("start:d") > position("end:c"));
    }

    #[tokio::test]
    async fn failed_root_blocks_the_rest_of_the_dag() {
        let executor = Arc::new(RecordingExecutor { log: StdMutex::new(vec![]) });
        let engine = engine(
            ScriptedLlm {
                todo: diamond_plan(),
                failing_items: vec!["a".to_string()],
            },
            executor,
        );

        let outcome = engine
            .run_session("s1", "doomed diamond", Some(Mode::Task), true)
            .await
            .unwrap();

        let statuses: HashMap<&str, ItemStatus> = outcome
            .items
            .iter()
            .map(|report| (report.id.as_str(), report.status))
            .collect();
        assert_eq!(statuses["a"], ItemStatus::Failed);
        assert_eq!(statuses["b"], ItemStatus::Blocked);
        assert_eq!(statuses["c"], ItemStatus::Blocked);
        assert_eq!(statuses["d"], ItemStatus::Blocked);
    }

    #[tokio::test]
    async fn chat_mode_short_circuits() {
        let executor = Arc::new(RecordingExecutor { log: StdMutex::new(vec![]) });
        let engine = engine(
            ScriptedLlm { todo: vec![], failing_items: vec![] },
            executor.clone(),
        );

        let outcome = engine
            .run_session("s1", "hello", Some(Mode::Chat), false)
            .await
            .unwrap();
        assert_eq!(outcome.mode, Mode::Chat);
        assert_eq!(outcome.summary, "chat: hello");
        assert!(executor.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn self_analysis_is_throttled_within_cooldown() {
        let executor = Arc::new(RecordingExecutor { log: StdMutex::new(vec![]) });
        let engine = engine(
            ScriptedLlm { todo: vec![], failing_items: vec![] },
            executor,
        );

        let first = engine
            .run_session("s1", "analyze yourself", Some(Mode::Dev), false)
            .await
            .unwrap();
        assert_eq!(first.summary, "chat: analyze yourself");

        let second = engine
            .run_session("s1", "analyze yourself again", Some(Mode::Dev), false)
            .await
            .unwrap();
        assert!(second.summary.contains("throttled"));
    }

    #[tokio::test]
    async fn cancelled_session_skips_pending_items() {
        let executor = Arc::new(RecordingExecutor { log: StdMutex::new(vec![]) });
        let llm = ScriptedLlm { todo: diamond_plan(), failing_items: vec![] };
        let engine = engine(llm, executor);

        // Cancel before the run: everything pending is skipped.
        engine.sessions().touch("s1");
        engine.sessions().cancel("s1");
        let outcome = engine
            .run_session("s1", "never mind", Some(Mode::Task), true)
            .await
            .unwrap();
        assert!(outcome
            .items
            .iter()
            .all(|report| report.status == ItemStatus::Skipped));
    }

    #[tokio::test]
    async fn cycle_from_planner_is_rejected() {
        let executor = Arc::new(RecordingExecutor { log: StdMutex::new(vec![]) });
        let engine = engine(
            ScriptedLlm {
                todo: vec![
                    PlannedItem { id: "x".into(), action: "x".into(), dependencies: vec!["y".into()] },
                    PlannedItem { id: "y".into(), action: "y".into(), dependencies: vec!["x".into()] },
                ],
                failing_items: vec![],
            },
            executor,
        );

        let err = engine
            .run_session("s1", "circular", Some(Mode::Task), true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }
}

//! Wires every component into the service container and adapts the engine's
//! seam traits onto the real optimizer, catalog, and dispatcher.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{info, warn};

use maestro_config::AppConfig;
use maestro_core::{Error, ErrorKind};
use maestro_llm::{
    optimizer::strip_code_fences, ChatMessage, ChatRequest, CircuitBreaker, EndpointClient,
    LlmOptimizer, LlmTransport, ModelAvailability, RateLimiter, RequestKind,
};
use maestro_mcp::ProviderSupervisor;
use maestro_tools::{
    ApprovalSender, BatchResult, CallHistory, Dispatcher, ExecutionContext, InspectionContext,
    InspectorChain, NormalizedCall, ProviderPort, RiskAssessor, ToolCall, ToolCatalog,
    ValidationContext, ValidationPipeline,
};
use maestro_workflow::{
    EventBus, EventEnvelope, Mode, PlannedItem, PlannerLlm, SessionOutcome, SessionStore,
    TodoItem, ToolExecutorPort, Verification, WorkflowEngine,
};

use crate::container::{ServiceContainer, ServiceSpec};

// ── Orchestrator ─────────────────────────────────────────────────────────────

pub struct Orchestrator {
    config: AppConfig,
    container: Arc<ServiceContainer>,
    engine: Arc<WorkflowEngine>,
}

impl Orchestrator {
    /// Build the full component graph. Nothing talks to the network yet;
    /// `start` runs the lifecycle.
    pub async fn build(config: AppConfig, approval: Option<ApprovalSender>) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let container = ServiceContainer::new();

        let cfg = config.clone();
        container.register(
            "transport",
            ServiceSpec::singleton(move |_| {
                let cfg = cfg.clone();
                async move {
                    let client = EndpointClient::new(&cfg.llm)
                        .map_err(|err| anyhow::anyhow!("{err}"))?;
                    Ok(Arc::new(client))
                }
            }),
        )?;

        let cfg = config.clone();
        container.register(
            "breaker",
            ServiceSpec::singleton(move |_| {
                let cfg = cfg.clone();
                async move { Ok(Arc::new(CircuitBreaker::new(cfg.circuit_breaker.clone()))) }
            }),
        )?;

        let cfg = config.clone();
        container.register(
            "limiter",
            ServiceSpec::singleton(move |c: Arc<ServiceContainer>| {
                let cfg = cfg.clone();
                async move {
                    let breaker = c.get::<CircuitBreaker>("breaker")?;
                    Ok(Arc::new(RateLimiter::new(cfg.rate_limiter.clone(), breaker)))
                }
            })
            .depends_on(&["breaker"])
            .on_start::<RateLimiter, _, _>(|limiter| async move {
                let _ = limiter.start();
                Ok(())
            })
            .on_stop::<RateLimiter, _, _>(|limiter| async move {
                limiter.stop();
                Ok(())
            }),
        )?;

        let cfg = config.clone();
        container.register(
            "availability",
            ServiceSpec::singleton(move |c: Arc<ServiceContainer>| {
                let cfg = cfg.clone();
                async move {
                    let transport = c.get::<EndpointClient>("transport")?;
                    Ok(Arc::new(ModelAvailability::new(
                        transport as Arc<dyn LlmTransport>,
                        cfg.availability.clone(),
                    )))
                }
            })
            .depends_on(&["transport"]),
        )?;

        let cfg = config.clone();
        container.register(
            "optimizer",
            ServiceSpec::singleton(move |c: Arc<ServiceContainer>| {
                let cfg = cfg.clone();
                async move {
                    let transport = c.get::<EndpointClient>("transport")?;
                    let limiter = c.get::<RateLimiter>("limiter")?;
                    let availability = c.get::<ModelAvailability>("availability")?;
                    Ok(Arc::new(LlmOptimizer::new(
                        cfg.llm.clone(),
                        transport as Arc<dyn LlmTransport>,
                        limiter,
                        availability,
                    )))
                }
            })
            .depends_on(&["transport", "limiter", "availability"]),
        )?;

        let cfg = config.clone();
        container.register(
            "supervisor",
            ServiceSpec::singleton(move |_| {
                let cfg = cfg.clone();
                async move {
                    Ok(Arc::new(ProviderSupervisor::new(
                        cfg.mcp.clone(),
                        cfg.providers.clone(),
                    )))
                }
            })
            .on_start::<ProviderSupervisor, _, _>(|supervisor| async move {
                supervisor
                    .start_all()
                    .await
                    .map_err(|err| anyhow::anyhow!("{err}"))
            })
            .on_stop::<ProviderSupervisor, _, _>(|supervisor| async move {
                supervisor.shutdown().await;
                Ok(())
            }),
        )?;

        let cfg = config.clone();
        container.register(
            "history",
            ServiceSpec::singleton(move |_| {
                let cfg = cfg.clone();
                async move { Ok(Arc::new(CallHistory::new(cfg.inspection.history_capacity))) }
            }),
        )?;

        let cfg = config.clone();
        container.register(
            "catalog",
            ServiceSpec::singleton(move |c: Arc<ServiceContainer>| {
                let cfg = cfg.clone();
                async move {
                    let supervisor = c.get::<ProviderSupervisor>("supervisor")?;
                    let rewrite: HashSet<String> = cfg
                        .providers
                        .iter()
                        .filter(|(_, provider)| provider.filesystem_tmp_rewrite)
                        .map(|(name, _)| name.clone())
                        .collect();
                    Ok(Arc::new(ToolCatalog::new(
                        supervisor as Arc<dyn ProviderPort>,
                        rewrite,
                    )))
                }
            })
            .depends_on(&["supervisor"]),
        )?;

        container.register(
            "dispatcher",
            ServiceSpec::singleton(move |c: Arc<ServiceContainer>| {
                let approval = approval.clone();
                async move {
                    let supervisor = c.get::<ProviderSupervisor>("supervisor")?;
                    let history = c.get::<CallHistory>("history")?;
                    let mut dispatcher =
                        Dispatcher::new(supervisor as Arc<dyn ProviderPort>, history);
                    if let Some(approval) = approval {
                        dispatcher = dispatcher.with_approval(approval);
                    }
                    Ok(Arc::new(dispatcher))
                }
            })
            .depends_on(&["supervisor", "history"]),
        )?;

        let cfg = config.clone();
        container.register(
            "executor",
            ServiceSpec::singleton(move |c: Arc<ServiceContainer>| {
                let cfg = cfg.clone();
                async move {
                    let catalog = c.get::<ToolCatalog>("catalog")?;
                    let history = c.get::<CallHistory>("history")?;
                    let dispatcher = c.get::<Dispatcher>("dispatcher")?;
                    let supervisor = c.get::<ProviderSupervisor>("supervisor")?;
                    let mut inspectors = InspectorChain::standard();
                    if cfg.inspection.llm_validator {
                        let optimizer = c.get::<LlmOptimizer>("optimizer")?;
                        inspectors = inspectors.with_llm_validator(
                            Arc::new(OptimizerRiskAssessor { optimizer }),
                            cfg.inspection.llm_fallback == "allow",
                        );
                    }
                    Ok(Arc::new(ToolExecutorImpl {
                        catalog,
                        history,
                        dispatcher,
                        supervisor,
                        pipeline: ValidationPipeline::standard(),
                        inspectors,
                        config: cfg,
                    }))
                }
            })
            .depends_on(&["catalog", "history", "dispatcher", "supervisor", "optimizer"]),
        )?;

        container.register(
            "planner",
            ServiceSpec::singleton(move |c: Arc<ServiceContainer>| async move {
                let optimizer = c.get::<LlmOptimizer>("optimizer")?;
                Ok(Arc::new(PlannerLlmImpl { optimizer }))
            })
            .depends_on(&["optimizer"]),
        )?;

        let cfg = config.clone();
        container.register(
            "sessions",
            ServiceSpec::singleton(move |_| {
                let cfg = cfg.clone();
                async move { Ok(Arc::new(SessionStore::new(cfg.sessions.ttl()))) }
            })
            .on_start::<SessionStore, _, _>(|sessions| async move {
                let _ = sessions.start_sweeper();
                Ok(())
            }),
        )?;

        container.register(
            "events",
            ServiceSpec::singleton(|_| async { Ok(Arc::new(EventBus::default())) }),
        )?;

        let cfg = config.clone();
        container.register(
            "engine",
            ServiceSpec::singleton(move |c: Arc<ServiceContainer>| {
                let cfg = cfg.clone();
                async move {
                    let planner = c.get::<PlannerLlmImpl>("planner")?;
                    let executor = c.get::<ToolExecutorImpl>("executor")?;
                    let events = c.get::<EventBus>("events")?;
                    let sessions = c.get::<SessionStore>("sessions")?;
                    Ok(Arc::new(WorkflowEngine::new(
                        cfg.workflow.clone(),
                        planner as Arc<dyn PlannerLlm>,
                        executor as Arc<dyn ToolExecutorPort>,
                        events,
                        sessions,
                    )))
                }
            })
            .depends_on(&["planner", "executor", "events", "sessions"]),
        )?;

        container.initialize().await?;
        let engine = container.get::<WorkflowEngine>("engine")?;

        Ok(Self {
            config,
            container,
            engine,
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.container.start().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.container.stop().await
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.engine.events().subscribe()
    }

    /// One inbound request from the session surface.
    pub async fn handle_request(
        &self,
        session_id: &str,
        user_message: &str,
        mode: Option<&str>,
        auto_approve: bool,
    ) -> maestro_core::Result<SessionOutcome> {
        let mode_override = mode.map(Mode::parse);
        self.engine
            .run_session(session_id, user_message, mode_override, auto_approve)
            .await
    }

    /// Connectivity report for the `doctor` command.
    pub async fn doctor(&self) -> String {
        let mut lines = Vec::new();

        match self.container.get::<EndpointClient>("transport") {
            Ok(transport) => match transport.list_models().await {
                Ok(models) => {
                    lines.push(format!(
                        "llm endpoint: ok ({} models at {})",
                        models.len(),
                        self.config.llm.endpoint
                    ));
                }
                Err(err) => lines.push(format!("llm endpoint: UNREACHABLE ({err})")),
            },
            Err(err) => lines.push(format!("llm endpoint: not wired ({err})")),
        }

        if let Ok(breaker) = self.container.get::<CircuitBreaker>("breaker") {
            lines.push(format!("circuit breaker: {:?}", breaker.state()));
        }

        match self.container.get::<ProviderSupervisor>("supervisor") {
            Ok(supervisor) => {
                let ready = supervisor.ready_providers();
                let configured = self.config.enabled_providers().len();
                lines.push(format!("providers: {}/{} ready", ready.len(), configured));
                for name in ready {
                    if let Some(handle) = supervisor.get(&name) {
                        lines.push(format!("  {name}: {} tools", handle.tools().len()));
                    }
                }
            }
            Err(err) => lines.push(format!("providers: not wired ({err})")),
        }

        if let Ok(history) = self.container.get::<CallHistory>("history") {
            for stat in history.stats().into_iter().take(5) {
                lines.push(format!(
                    "  {}: {} calls, {} failed, avg {}ms",
                    stat.qualified_name, stat.total, stat.failures, stat.mean_duration_ms
                ));
            }
        }

        lines.join("\n")
    }
}

// ── Seam implementations ─────────────────────────────────────────────────────

/// `PlannerLlm` over the optimizer: one small prompt per stage, parsing kept
/// lenient because planner output is model-dependent.
pub struct PlannerLlmImpl {
    optimizer: Arc<LlmOptimizer>,
}

impl PlannerLlmImpl {
    async fn request(
        &self,
        kind: RequestKind,
        system: &str,
        user: String,
        json: bool,
    ) -> maestro_core::Result<String> {
        let request = ChatRequest {
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            json_response: json,
            ..Default::default()
        };
        let outcome = self.optimizer.optimized_request(kind, request).await?;
        Ok(outcome.content)
    }
}

#[async_trait]
impl PlannerLlm for PlannerLlmImpl {
    async fn select_mode(&self, user_message: &str) -> maestro_core::Result<Mode> {
        // One combined call yields mode, provider subset, and a provisional
        // plan; only the mode is consumed here, the rest stays cached.
        let selection = self.optimizer.batch_system_selection(user_message, "").await;
        Ok(Mode::parse(&selection.mode))
    }

    async fn chat(&self, user_message: &str) -> maestro_core::Result<String> {
        let request = ChatRequest {
            messages: vec![ChatMessage::user(user_message)],
            ..Default::default()
        };
        let outcome = self
            .optimizer
            .optimized_request(RequestKind::ChatCompletion, request)
            .await?;
        Ok(outcome.content)
    }

    async fn build_todo(&self, user_message: &str) -> maestro_core::Result<Vec<PlannedItem>> {
        let content = self
            .request(
                RequestKind::TodoBuilding,
                "Break the request into ordered TODO items. Reply with JSON: \
                 {\"items\": [{\"id\": \"1\", \"action\": \"...\", \"dependencies\": []}]}. \
                 Dependencies reference item ids and must form a DAG.",
                user_message.to_string(),
                true,
            )
            .await?;
        Ok(parse_todo_items(&content).unwrap_or_else(|| {
            warn!("todo parse failed, falling back to a single item");
            vec![PlannedItem {
                id: "1".to_string(),
                action: user_message.to_string(),
                dependencies: vec![],
            }]
        }))
    }

    async fn select_providers(
        &self,
        user_message: &str,
        available: Vec<String>,
    ) -> maestro_core::Result<Vec<String>> {
        if available.is_empty() {
            return Ok(available);
        }
        let content = self
            .request(
                RequestKind::ServerSelection,
                "Select the providers relevant to the request. \
                 Reply with a JSON array of provider names.",
                format!("available providers: {}\n\nrequest: {user_message}", available.join(", ")),
                true,
            )
            .await?;
        let selected = parse_provider_list(&content)
            .map(|names| {
                names
                    .into_iter()
                    .filter(|name| available.contains(name))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(if selected.is_empty() { available } else { selected })
    }

    async fn plan_tools(
        &self,
        item: &TodoItem,
        tools_summary: &str,
    ) -> maestro_core::Result<Vec<ToolCall>> {
        let content = self
            .request(
                RequestKind::ToolPlanning,
                "Plan the tool calls for the task. Reply with JSON: \
                 {\"tool_calls\": [{\"provider\": \"...\", \"tool\": \"...\", \"parameters\": {}}]}. \
                 Use the qualified provider__tool names. An empty list means no tools are needed.",
                format!("available tools:\n{tools_summary}\n\ntask: {}", item.action),
                true,
            )
            .await?;
        parse_tool_calls(&content).ok_or_else(|| {
            Error::new(ErrorKind::LlmParse, "tool plan was not parseable JSON")
        })
    }

    async fn verify(
        &self,
        item: &TodoItem,
        batch: &BatchResult,
    ) -> maestro_core::Result<Verification> {
        let results: Vec<String> = batch
            .formatted_for_llm
            .iter()
            .map(|block| block.to_string())
            .collect();
        let content = self
            .request(
                RequestKind::Verification,
                "Did the tool results accomplish the task? Reply with JSON: \
                 {\"passed\": true|false, \"reasoning\": \"...\"}.",
                format!("task: {}\n\nresults:\n{}", item.action, results.join("\n")),
                true,
            )
            .await?;
        parse_verification(&content)
            .ok_or_else(|| Error::new(ErrorKind::LlmParse, "verification was not parseable JSON"))
    }

    async fn replan(
        &self,
        item: &TodoItem,
        failure: &str,
        tools_summary: &str,
    ) -> maestro_core::Result<Vec<ToolCall>> {
        let content = self
            .request(
                RequestKind::Replanning,
                "The previous attempt failed. Plan a different sequence of tool calls. \
                 Reply with JSON: {\"tool_calls\": [...]}. \
                 An empty list means the task cannot be completed with the available tools.",
                format!(
                    "task: {}\n\nfailure: {failure}\n\navailable tools:\n{tools_summary}",
                    item.action
                ),
                true,
            )
            .await?;
        parse_tool_calls(&content)
            .ok_or_else(|| Error::new(ErrorKind::LlmParse, "replan was not parseable JSON"))
    }

    async fn summarize(
        &self,
        user_message: &str,
        item_reports: &str,
    ) -> maestro_core::Result<String> {
        self.request(
            RequestKind::Summary,
            "Summarize the session outcome for the user in a short paragraph. \
             Mention items that did not complete and why.",
            format!("request: {user_message}\n\nitems:\n{item_reports}"),
            false,
        )
        .await
    }
}

/// `ToolExecutorPort` over the real pipeline: validate → inspect → dispatch.
pub struct ToolExecutorImpl {
    catalog: Arc<ToolCatalog>,
    history: Arc<CallHistory>,
    dispatcher: Arc<Dispatcher>,
    supervisor: Arc<ProviderSupervisor>,
    pipeline: ValidationPipeline,
    inspectors: InspectorChain,
    config: AppConfig,
}

#[async_trait]
impl ToolExecutorPort for ToolExecutorImpl {
    async fn execute(
        &self,
        session_id: &str,
        mode: Mode,
        auto_approve: bool,
        intent: &str,
        calls: Vec<ToolCall>,
    ) -> maestro_core::Result<BatchResult> {
        let snapshot = self.catalog.snapshot();

        let validation = self.pipeline.run(
            calls,
            &ValidationContext {
                snapshot: &snapshot,
                history: &self.history,
                config: &self.config.inspection,
                autocorrect: true,
            },
        );
        if !validation.valid {
            let detail = validation
                .errors
                .iter()
                .map(|diagnostic| format!("call {}: {}", diagnostic.index, diagnostic.error))
                .collect::<Vec<_>>()
                .join("; ");
            let mut error = Error::new(ErrorKind::ValidationFailed, detail);
            if let Some(suggestion) = validation
                .errors
                .iter()
                .find_map(|diagnostic| diagnostic.error.suggestion())
            {
                error = error.with_suggestion(suggestion);
            }
            return Err(error);
        }
        for warning in &validation.warnings {
            warn!(session_id, warning = warning.as_str(), "validation warning");
        }

        let corrected = validation.corrected_calls.unwrap_or_default();
        let normalized: Vec<NormalizedCall> = corrected
            .iter()
            .map(|call| self.catalog.normalize(call, &snapshot))
            .collect::<maestro_core::Result<_>>()?;

        // inspection.mode = "chat" pins the chat-grade restrictions no matter
        // what mode the session negotiated.
        let effective_mode = if self.config.inspection.mode == "chat" {
            "chat"
        } else {
            mode.as_str()
        };
        let assessments = self
            .inspectors
            .inspect(
                &normalized,
                &InspectionContext {
                    mode: effective_mode,
                    readonly: self.config.inspection.readonly_mode,
                    strict_repetition: self.config.inspection.strict_repetition,
                    history: &self.history,
                    window: self.config.inspection.history_window,
                    max_consecutive: self.config.inspection.max_repetitions,
                    intent,
                },
            )
            .await;

        let batch = self
            .dispatcher
            .dispatch_batch(
                normalized.into_iter().zip(assessments).collect(),
                &ExecutionContext {
                    session_id: session_id.to_string(),
                    auto_approve,
                },
            )
            .await;

        info!(
            session_id,
            successful = batch.successful,
            failed = batch.failed,
            denied = batch.denied,
            "batch dispatched"
        );
        Ok(batch)
    }

    fn tools_summary(&self, providers: &[String]) -> String {
        self.catalog.detailed(providers)
    }

    fn ready_providers(&self) -> Vec<String> {
        self.supervisor.ready_providers()
    }
}

/// The LLM validator's transport: one JSON-mode request through the optimizer.
struct OptimizerRiskAssessor {
    optimizer: Arc<LlmOptimizer>,
}

#[async_trait]
impl RiskAssessor for OptimizerRiskAssessor {
    async fn assess(
        &self,
        calls: &[NormalizedCall],
        intent: &str,
    ) -> maestro_core::Result<String> {
        let listing: Vec<String> = calls
            .iter()
            .map(|call| {
                format!(
                    "{} {}",
                    call.qualified_name,
                    Value::Object(call.parameters.clone())
                )
            })
            .collect();
        let request = ChatRequest {
            messages: vec![
                ChatMessage::system(
                    "Assess each planned tool call against the stated intent. Reply with JSON: \
                     {\"validations\": [{\"valid\": true|false, \
                     \"risk\": \"none|low|medium|high|critical\", \"reasoning\": \"...\"}]}.",
                ),
                ChatMessage::user(format!("intent: {intent}\n\ncalls:\n{}", listing.join("\n"))),
            ],
            json_response: true,
            ..Default::default()
        };
        let outcome = self
            .optimizer
            .optimized_request(RequestKind::Verification, request)
            .await?;
        Ok(outcome.content)
    }
}

// ── Parsing helpers ──────────────────────────────────────────────────────────

fn parse_todo_items(content: &str) -> Option<Vec<PlannedItem>> {
    let value: Value = serde_json::from_str(strip_code_fences(content)).ok()?;
    let entries = value
        .get("items")
        .and_then(Value::as_array)
        .or_else(|| value.as_array())?;
    let items: Vec<PlannedItem> = entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let action = entry
                .get("action")
                .or_else(|| entry.get("description"))
                .and_then(Value::as_str)?
                .to_string();
            let id = entry
                .get("id")
                .map(|id| match id {
                    Value::String(id) => id.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| (index + 1).to_string());
            let dependencies = entry
                .get("dependencies")
                .and_then(Value::as_array)
                .map(|deps| {
                    deps.iter()
                        .map(|dep| match dep {
                            Value::String(dep) => dep.clone(),
                            other => other.to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(PlannedItem {
                id,
                action,
                dependencies,
            })
        })
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn parse_tool_calls(content: &str) -> Option<Vec<ToolCall>> {
    let value: Value = serde_json::from_str(strip_code_fences(content)).ok()?;
    let entries = value
        .get("tool_calls")
        .and_then(Value::as_array)
        .or_else(|| value.as_array())?;
    Some(entries.iter().filter_map(ToolCall::from_value).collect())
}

fn parse_provider_list(content: &str) -> Option<Vec<String>> {
    let value: Value = serde_json::from_str(strip_code_fences(content)).ok()?;
    let entries = value
        .get("providers")
        .and_then(Value::as_array)
        .or_else(|| value.as_array())?;
    Some(
        entries
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    )
}

fn parse_verification(content: &str) -> Option<Verification> {
    let value: Value = serde_json::from_str(strip_code_fences(content)).ok()?;
    let passed = value
        .get("passed")
        .or_else(|| value.get("valid"))
        .or_else(|| value.get("success"))
        .and_then(Value::as_bool)?;
    let reasoning = value
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some(Verification { passed, reasoning })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_wires_the_full_graph() {
        let orchestrator = Orchestrator::build(AppConfig::default(), None).await.unwrap();
        // No providers configured: start succeeds without any subprocesses.
        orchestrator.start().await.unwrap();
        assert!(orchestrator.engine().sessions().is_empty());
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_config_halts_build() {
        let mut config = AppConfig::default();
        config.llm.endpoint = String::new();
        assert!(Orchestrator::build(config, None).await.is_err());
    }

    #[test]
    fn todo_parse_accepts_wrapped_and_bare_shapes() {
        let wrapped = r#"{"items": [
            {"id": "a", "action": "first", "dependencies": []},
            {"id": "b", "action": "second", "dependencies": ["a"]}
        ]}"#;
        let items = parse_todo_items(wrapped).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].dependencies, vec!["a".to_string()]);

        let bare = r#"[{"action": "only"}]"#;
        let items = parse_todo_items(bare).unwrap();
        assert_eq!(items[0].id, "1");

        assert!(parse_todo_items("not json").is_none());
        assert!(parse_todo_items(r#"{"items": []}"#).is_none());
    }

    #[test]
    fn tool_call_parse_accepts_fenced_output() {
        let fenced = "```json\n{\"tool_calls\": [{\"provider\": \"filesystem\", \
                      \"tool\": \"read_file\", \"parameters\": {\"path\": \"/a\"}}]}\n```";
        let calls = parse_tool_calls(fenced).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool, "read_file");

        let empty = parse_tool_calls(r#"{"tool_calls": []}"#).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn verification_parse_tolerates_aliases() {
        let passed = parse_verification(r#"{"passed": true, "reasoning": "done"}"#).unwrap();
        assert!(passed.passed);

        let valid = parse_verification(r#"{"valid": false}"#).unwrap();
        assert!(!valid.passed);

        assert!(parse_verification(r#"{"no_flag": 1}"#).is_none());
    }

    #[test]
    fn provider_list_parse() {
        let names = parse_provider_list(r#"["filesystem", "web"]"#).unwrap();
        assert_eq!(names, vec!["filesystem".to_string(), "web".to_string()]);
        let wrapped = parse_provider_list(r#"{"providers": ["filesystem"]}"#).unwrap();
        assert_eq!(wrapped, vec!["filesystem".to_string()]);
    }
}

//! The single facade every LLM call flows through: fingerprint cache,
//! in-flight deduplication, per-kind batching, model selection with
//! availability-aware fallback, all on top of the rate limiter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use maestro_config::LlmConfig;
use maestro_core::{Error, ErrorKind, Result, TtlCache};

use crate::availability::ModelAvailability;
use crate::fingerprint::fingerprint;
use crate::limiter::{Priority, RateLimiter, RequestTask};
use crate::{ChatMessage, ChatOutcome, ChatRequest, LlmTransport, RequestKind};

const FALLBACK_ATTEMPTS: usize = 3;
const FALLBACK_MAX_TOKENS: u32 = 512;

type SharedOutcome = Shared<BoxFuture<'static, Result<ChatOutcome>>>;

// ── Metrics ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Metrics {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    duplicates_avoided: AtomicU64,
    batches_flushed: AtomicU64,
    fallbacks_engaged: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub duplicates_avoided: u64,
    pub batches_flushed: u64,
    pub fallbacks_engaged: u64,
}

// ── Batch selection result ───────────────────────────────────────────────────

/// Parsed outcome of the combined system-selection call.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemSelection {
    pub mode: String,
    pub selected_providers: Vec<String>,
    pub planned_tool_calls: Vec<Value>,
    pub optimization_meta: Value,
    pub fallback: bool,
}

impl Default for SystemSelection {
    fn default() -> Self {
        Self {
            mode: "chat".to_string(),
            selected_providers: vec![],
            planned_tool_calls: vec![],
            optimization_meta: Value::Object(Default::default()),
            fallback: false,
        }
    }
}

struct BatchItem {
    model: String,
    request: ChatRequest,
    tx: oneshot::Sender<Result<ChatOutcome>>,
}

#[derive(Default)]
struct BatchQueue {
    items: Vec<BatchItem>,
    flush_scheduled: bool,
}

// ── Optimizer ────────────────────────────────────────────────────────────────

pub struct LlmOptimizer {
    config: LlmConfig,
    transport: Arc<dyn LlmTransport>,
    limiter: Arc<RateLimiter>,
    availability: Arc<ModelAvailability>,
    cache: Mutex<TtlCache<String, ChatOutcome>>,
    in_flight: Mutex<HashMap<String, SharedOutcome>>,
    batches: Mutex<HashMap<RequestKind, BatchQueue>>,
    metrics: Metrics,
}

impl LlmOptimizer {
    pub fn new(
        config: LlmConfig,
        transport: Arc<dyn LlmTransport>,
        limiter: Arc<RateLimiter>,
        availability: Arc<ModelAvailability>,
    ) -> Self {
        let cache = TtlCache::new(config.cache_capacity, config.cache_ttl());
        Self {
            config,
            transport,
            limiter,
            availability,
            cache: Mutex::new(cache),
            in_flight: Mutex::new(HashMap::new()),
            batches: Mutex::new(HashMap::new()),
            metrics: Metrics::default(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.metrics.requests.load(Ordering::Relaxed),
            cache_hits: self.metrics.cache_hits.load(Ordering::Relaxed),
            duplicates_avoided: self.metrics.duplicates_avoided.load(Ordering::Relaxed),
            batches_flushed: self.metrics.batches_flushed.load(Ordering::Relaxed),
            fallbacks_engaged: self.metrics.fallbacks_engaged.load(Ordering::Relaxed),
        }
    }

    /// The one entry point. Checks the short-TTL cache, joins an identical
    /// in-flight request when one exists, and otherwise routes through
    /// batching (for batchable kinds) or a single dispatch.
    pub async fn optimized_request(
        self: &Arc<Self>,
        kind: RequestKind,
        request: ChatRequest,
    ) -> Result<ChatOutcome> {
        self.metrics.requests.fetch_add(1, Ordering::Relaxed);

        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.model_for_kind(kind.as_str()).to_string());
        let key = fingerprint(kind, &model, &request);

        if let Some(hit) = self.cache.lock().unwrap().get(&key) {
            self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(kind = %kind, "llm cache hit");
            return Ok(hit.clone());
        }

        let shared = {
            let mut in_flight = self.in_flight.lock().unwrap();
            if let Some(existing) = in_flight.get(&key) {
                self.metrics.duplicates_avoided.fetch_add(1, Ordering::Relaxed);
                debug!(kind = %kind, "joining identical in-flight request");
                existing.clone()
            } else {
                let optimizer = self.clone();
                let cleanup_key = key.clone();
                let future: SharedOutcome = async move {
                    let result = optimizer.dispatch(kind, model, request).await;
                    optimizer.in_flight.lock().unwrap().remove(&cleanup_key);
                    if let Ok(outcome) = &result {
                        optimizer
                            .cache
                            .lock()
                            .unwrap()
                            .put(cleanup_key, outcome.clone());
                    }
                    result
                }
                .boxed()
                .shared();
                in_flight.insert(key, future.clone());
                future
            }
        };

        shared.await
    }

    async fn dispatch(
        self: &Arc<Self>,
        kind: RequestKind,
        model: String,
        request: ChatRequest,
    ) -> Result<ChatOutcome> {
        if kind.is_batchable() {
            self.enqueue_batch(kind, model, request).await
        } else {
            self.execute_single(kind, model, request).await
        }
    }

    // ── Batching ────────────────────────────────────────────────────────────

    async fn enqueue_batch(
        self: &Arc<Self>,
        kind: RequestKind,
        model: String,
        request: ChatRequest,
    ) -> Result<ChatOutcome> {
        let (tx, rx) = oneshot::channel();
        let flush_now = {
            let mut batches = self.batches.lock().unwrap();
            let queue = batches.entry(kind).or_default();
            queue.items.push(BatchItem { model, request, tx });
            if queue.items.len() >= self.config.batch_max_size {
                true
            } else if !queue.flush_scheduled {
                queue.flush_scheduled = true;
                let optimizer = self.clone();
                let debounce = self.config.batch_debounce();
                tokio::spawn(async move {
                    tokio::time::sleep(debounce).await;
                    optimizer.flush_batch(kind).await;
                });
                false
            } else {
                false
            }
        };

        if flush_now {
            self.flush_batch(kind).await;
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorKind::LlmUnavailable, "batch dropped")),
        }
    }

    /// Run one kind's queued requests as parallel single calls; the limiter
    /// supplies the concurrency cap. The interface leaves room for a true
    /// multi-turn batch call later.
    async fn flush_batch(self: &Arc<Self>, kind: RequestKind) {
        let items: Vec<BatchItem> = {
            let mut batches = self.batches.lock().unwrap();
            let Some(queue) = batches.get_mut(&kind) else { return };
            queue.flush_scheduled = false;
            std::mem::take(&mut queue.items)
        };
        if items.is_empty() {
            return;
        }

        self.metrics.batches_flushed.fetch_add(1, Ordering::Relaxed);
        debug!(kind = %kind, size = items.len(), "flushing batch");

        let work = items.into_iter().map(|item| {
            let optimizer = self.clone();
            async move {
                let result = optimizer
                    .execute_single(kind, item.model, item.request)
                    .await;
                let _ = item.tx.send(result);
            }
        });
        futures::future::join_all(work).await;
    }

    // ── Single dispatch with fallback ───────────────────────────────────────

    async fn execute_single(
        self: &Arc<Self>,
        kind: RequestKind,
        model: String,
        request: ChatRequest,
    ) -> Result<ChatOutcome> {
        let fallback = self.config.fallback_models.first().map(String::as_str);
        let resolved = self.availability.get_available(&model, fallback).await;
        let Some(selected) = resolved.model.clone() else {
            return Err(Error::new(
                ErrorKind::LlmUnavailable,
                format!("no available model for {model}"),
            ));
        };

        let result = self
            .run_through_limiter(&selected, &request, self.priority_for(kind))
            .await;

        match result {
            Ok(mut outcome) => {
                outcome.fallback = selected != model;
                Ok(outcome)
            }
            Err(err) if err.kind() == ErrorKind::LlmRateLimited => {
                self.availability.note_rate_limited(&selected, None);
                Err(err)
            }
            Err(err) if err.kind() == ErrorKind::LlmUnavailable => {
                warn!(model = %selected, %err, "primary dispatch failed, trying fallbacks");
                self.try_fallbacks(&selected, &request, kind).await.map_err(|_| err)
            }
            Err(err) => Err(err),
        }
    }

    /// Bounded ladder of smaller fallback models with a reduced token budget.
    async fn try_fallbacks(
        self: &Arc<Self>,
        failed: &str,
        request: &ChatRequest,
        kind: RequestKind,
    ) -> Result<ChatOutcome> {
        let mut reduced = request.clone();
        reduced.max_tokens = Some(
            reduced
                .max_tokens
                .map(|t| t.min(FALLBACK_MAX_TOKENS))
                .unwrap_or(FALLBACK_MAX_TOKENS),
        );

        for candidate in self
            .config
            .fallback_models
            .iter()
            .filter(|candidate| candidate.as_str() != failed)
            .take(FALLBACK_ATTEMPTS)
        {
            match self
                .run_through_limiter(candidate, &reduced, self.priority_for(kind))
                .await
            {
                Ok(mut outcome) => {
                    info!(model = %candidate, "fallback model answered");
                    self.metrics.fallbacks_engaged.fetch_add(1, Ordering::Relaxed);
                    outcome.fallback = true;
                    return Ok(outcome);
                }
                Err(err) => {
                    debug!(model = %candidate, %err, "fallback attempt failed");
                }
            }
        }
        Err(Error::new(ErrorKind::LlmUnavailable, "all fallbacks exhausted"))
    }

    async fn run_through_limiter(
        &self,
        model: &str,
        request: &ChatRequest,
        priority: Priority,
    ) -> Result<ChatOutcome> {
        let transport = self.transport.clone();
        let model = model.to_string();
        let request = request.clone();
        let task: RequestTask = Arc::new(move || {
            let transport = transport.clone();
            let model = model.clone();
            let request = request.clone();
            async move { transport.chat_completion(&model, &request).await }.boxed()
        });
        self.limiter
            .submit(priority, self.config.timeout() * 2, 1, task)
            .await
    }

    fn priority_for(&self, kind: RequestKind) -> Priority {
        match kind {
            RequestKind::ModeSelection | RequestKind::SystemSelection => Priority::High,
            RequestKind::Summary => Priority::Low,
            _ => Priority::Normal,
        }
    }

    // ── Combined system selection ───────────────────────────────────────────

    /// One call that yields mode, provider subset, and a provisional tool
    /// plan. On any parse trouble this degrades to a sequential mode
    /// selection and returns a chat-mode stub flagged `fallback`.
    pub async fn batch_system_selection(
        self: &Arc<Self>,
        user_message: &str,
        context: &str,
    ) -> SystemSelection {
        let request = ChatRequest {
            messages: vec![
                ChatMessage::system(
                    "Classify the request and plan. Reply with one JSON object with keys \
                     mode_selection, server_selection, tool_planning, optimization_metadata.",
                ),
                ChatMessage::user(format!("{context}\n\n{user_message}")),
            ],
            json_response: true,
            ..Default::default()
        };

        match self
            .optimized_request(RequestKind::SystemSelection, request)
            .await
        {
            Ok(outcome) => match parse_system_selection(&outcome.content) {
                Some(selection) => selection,
                None => {
                    warn!("system selection parse failed, degrading to sequential mode selection");
                    self.sequential_mode_fallback(user_message).await
                }
            },
            Err(err) => {
                warn!(%err, "system selection call failed");
                self.sequential_mode_fallback(user_message).await
            }
        }
    }

    async fn sequential_mode_fallback(self: &Arc<Self>, user_message: &str) -> SystemSelection {
        let request = ChatRequest {
            messages: vec![
                ChatMessage::system("Answer with exactly one word: chat, task, or dev."),
                ChatMessage::user(user_message.to_string()),
            ],
            max_tokens: Some(4),
            ..Default::default()
        };
        let mode = match self.optimized_request(RequestKind::ModeSelection, request).await {
            Ok(outcome) => parse_mode_word(&outcome.content),
            Err(_) => "chat".to_string(),
        };
        SystemSelection {
            mode,
            fallback: true,
            ..Default::default()
        }
    }
}

// ── Parsing helpers ──────────────────────────────────────────────────────────

/// Drop a surrounding ```-fence (with or without a language tag).
pub fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn parse_mode_word(content: &str) -> String {
    let lowered = content.trim().to_lowercase();
    for mode in ["task", "dev", "chat"] {
        if lowered.contains(mode) {
            return mode.to_string();
        }
    }
    "chat".to_string()
}

fn parse_system_selection(content: &str) -> Option<SystemSelection> {
    let value: Value = serde_json::from_str(strip_code_fences(content)).ok()?;
    let object = value.as_object()?;

    let mode = object
        .get("mode_selection")
        .and_then(|selection| {
            selection
                .get("mode")
                .or(Some(selection))
                .and_then(Value::as_str)
        })
        .unwrap_or("chat")
        .to_string();

    let selected_providers = object
        .get("server_selection")
        .and_then(|selection| {
            selection
                .get("selected_providers")
                .or_else(|| selection.get("providers"))
                .or(Some(selection))
        })
        .and_then(Value::as_array)
        .map(|providers| {
            providers
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let planned_tool_calls = object
        .get("tool_planning")
        .and_then(|planning| {
            planning
                .get("tool_calls")
                .or_else(|| planning.get("planned_tool_calls"))
                .or(Some(planning))
        })
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let optimization_meta = object
        .get("optimization_metadata")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));

    Some(SystemSelection {
        mode,
        selected_providers,
        planned_tool_calls,
        optimization_meta,
        fallback: false,
    })
}

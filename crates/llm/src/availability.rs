//! Model availability: which ids the endpoint exposes and whether each is
//! currently usable.
//!
//! The model list is cached globally (~30 s) and each per-model verdict for
//! ~60 s. Probes are capped at two in flight with a 500 ms spacing so the
//! checker never causes the burst it is trying to detect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use maestro_config::AvailabilityConfig;
use maestro_core::{Error, ErrorKind, Result, TtlCache};

use crate::{ChatMessage, ChatRequest, LlmTransport, ModelRecord};

const PROBE_CONCURRENCY: usize = 2;
const PROBE_SPACING: Duration = Duration::from_millis(500);
const ALTERNATIVE_SCAN_LIMIT: usize = 5;
const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilitySource {
    Preferred,
    Fallback,
    Alternative,
    None,
}

#[derive(Debug, Clone)]
pub struct Availability {
    pub model: Option<String>,
    pub available: bool,
    pub source: AvailabilitySource,
}

#[derive(Debug, Clone, Copy)]
struct Verdict {
    available: bool,
}

pub struct ModelAvailability {
    transport: Arc<dyn LlmTransport>,
    config: AvailabilityConfig,
    model_list: Mutex<Option<(Instant, Arc<Vec<ModelRecord>>)>>,
    verdicts: Mutex<TtlCache<String, Verdict>>,
    /// Locally observed 429s: model → end of its rate-limit window.
    rate_limited_until: Mutex<HashMap<String, Instant>>,
    probe_permits: Semaphore,
    last_probe_at: Mutex<Option<Instant>>,
}

impl ModelAvailability {
    pub fn new(transport: Arc<dyn LlmTransport>, config: AvailabilityConfig) -> Self {
        let per_model_ttl = Duration::from_millis(config.per_model_ttl_ms);
        Self {
            transport,
            config,
            model_list: Mutex::new(None),
            verdicts: Mutex::new(TtlCache::new(256, per_model_ttl)),
            rate_limited_until: Mutex::new(HashMap::new()),
            probe_permits: Semaphore::new(PROBE_CONCURRENCY),
            last_probe_at: Mutex::new(None),
        }
    }

    /// Resolve a usable model: the preferred one if it is not rate-limited
    /// and answers, otherwise the fallback, otherwise the first usable entry
    /// among the first few cached models.
    pub async fn get_available(
        &self,
        preferred: &str,
        fallback: Option<&str>,
    ) -> Availability {
        if !self.is_rate_limited(preferred).await {
            if self.probe(preferred).await {
                return Availability {
                    model: Some(preferred.to_string()),
                    available: true,
                    source: AvailabilitySource::Preferred,
                };
            }
        } else {
            debug!(model = %preferred, "preferred model is rate-limited");
        }

        if let Some(fallback) = fallback {
            if !self.is_rate_limited(fallback).await && self.probe(fallback).await {
                return Availability {
                    model: Some(fallback.to_string()),
                    available: true,
                    source: AvailabilitySource::Fallback,
                };
            }
        }

        // Bounded scan so an outage never fans out into a probe storm.
        let records = self.models().await.unwrap_or_default();
        for record in records.iter().take(ALTERNATIVE_SCAN_LIMIT) {
            if record.id == preferred || Some(record.id.as_str()) == fallback {
                continue;
            }
            if self.is_rate_limited(&record.id).await {
                continue;
            }
            if self.probe(&record.id).await {
                info!(model = %record.id, "selected alternative model");
                return Availability {
                    model: Some(record.id.clone()),
                    available: true,
                    source: AvailabilitySource::Alternative,
                };
            }
        }

        Availability {
            model: None,
            available: false,
            source: AvailabilitySource::None,
        }
    }

    /// The endpoint's model list, served from cache within its TTL.
    pub async fn models(&self) -> Result<Vec<ModelRecord>> {
        let ttl = Duration::from_millis(self.config.model_list_ttl_ms);
        if let Some((fetched_at, records)) = self.model_list.lock().unwrap().as_ref() {
            if fetched_at.elapsed() < ttl {
                return Ok(records.as_ref().clone());
            }
        }

        let records = self.transport.list_models().await?;
        *self.model_list.lock().unwrap() = Some((Instant::now(), Arc::new(records.clone())));
        Ok(records)
    }

    /// A model is rate-limited when its record carries a hard cap, when its
    /// last observed 429 is inside the advertised window, or when we saw a
    /// 429 ourselves recently.
    pub async fn is_rate_limited(&self, model: &str) -> bool {
        if let Some(until) = self.rate_limited_until.lock().unwrap().get(model) {
            if Instant::now() < *until {
                return true;
            }
        }

        let records = match self.models().await {
            Ok(records) => records,
            Err(_) => return false,
        };
        let Some(info) = records
            .iter()
            .find(|record| record.id == model)
            .and_then(|record| record.rate_limit_info.as_ref())
        else {
            return false;
        };

        if info.adaptive_hard_cap == Some(true) {
            return true;
        }
        if let Some(last429) = info.adaptive_last429_at {
            let window = info
                .window_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW);
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64();
            if now - last429 < window.as_secs_f64() {
                return true;
            }
        }
        false
    }

    /// Record a locally observed 429 so the optimizer skips this model for
    /// the rest of its window.
    pub fn note_rate_limited(&self, model: &str, window: Option<Duration>) {
        let window = window.unwrap_or(DEFAULT_RATE_LIMIT_WINDOW);
        warn!(model = %model, window_s = window.as_secs(), "model saturated");
        self.rate_limited_until
            .lock()
            .unwrap()
            .insert(model.to_string(), Instant::now() + window);
    }

    /// Probe one model with a minimal completion. 200 → available; 429 →
    /// available but saturated (and marked); anything else → unavailable.
    async fn probe(&self, model: &str) -> bool {
        if let Some(verdict) = self.verdicts.lock().unwrap().get(&model.to_string()) {
            return verdict.available;
        }

        let _permit = self.probe_permits.acquire().await.expect("semaphore open");
        self.space_probes().await;

        let request = ChatRequest {
            messages: vec![ChatMessage::user("ping")],
            max_tokens: Some(1),
            ..Default::default()
        };
        let available = match self.transport.chat_completion(model, &request).await {
            Ok(_) => true,
            Err(err) if err.kind() == ErrorKind::LlmRateLimited => {
                self.note_rate_limited(model, None);
                true
            }
            Err(err) => {
                debug!(model = %model, %err, "probe failed");
                false
            }
        };

        self.verdicts
            .lock()
            .unwrap()
            .put(model.to_string(), Verdict { available });
        available
    }

    /// Enforce the inter-probe spacing under the permit.
    async fn space_probes(&self) {
        let wait = {
            let mut last = self.last_probe_at.lock().unwrap();
            let wait = match *last {
                Some(at) if at.elapsed() < PROBE_SPACING => PROBE_SPACING - at.elapsed(),
                _ => Duration::ZERO,
            };
            *last = Some(Instant::now() + wait);
            wait
        };
        if wait > Duration::ZERO {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::ChatOutcome;

    struct FakeTransport {
        models: Vec<ModelRecord>,
        /// model id → status behaviour: "ok", "busy", "down"
        behaviour: HashMap<String, &'static str>,
        probes: AtomicUsize,
        list_calls: AtomicUsize,
    }

    impl FakeTransport {
        fn new(entries: &[(&str, &'static str)]) -> Self {
            Self {
                models: entries
                    .iter()
                    .map(|(id, _)| ModelRecord {
                        id: id.to_string(),
                        provider: None,
                        rate_limit_info: None,
                    })
                    .collect(),
                behaviour: entries
                    .iter()
                    .map(|(id, b)| (id.to_string(), *b))
                    .collect(),
                probes: AtomicUsize::new(0),
                list_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmTransport for FakeTransport {
        async fn chat_completion(&self, model: &str, _request: &ChatRequest) -> Result<ChatOutcome> {
            self.probes.fetch_add(1, Ordering::Relaxed);
            match self.behaviour.get(model).copied().unwrap_or("down") {
                "ok" => Ok(ChatOutcome {
                    model: model.to_string(),
                    content: "pong".to_string(),
                    finish_reason: "stop".to_string(),
                    fallback: false,
                }),
                "busy" => Err(Error::new(ErrorKind::LlmRateLimited, "429")),
                _ => Err(Error::new(ErrorKind::LlmUnavailable, "500")),
            }
        }

        async fn list_models(&self) -> Result<Vec<ModelRecord>> {
            self.list_calls.fetch_add(1, Ordering::Relaxed);
            Ok(self.models.clone())
        }
    }

    fn checker(transport: Arc<FakeTransport>) -> ModelAvailability {
        ModelAvailability::new(transport, AvailabilityConfig::default())
    }

    #[tokio::test]
    async fn preferred_model_wins_when_healthy() {
        let transport = Arc::new(FakeTransport::new(&[("alpha", "ok"), ("beta", "ok")]));
        let availability = checker(transport.clone());
        let result = availability.get_available("alpha", Some("beta")).await;
        assert_eq!(result.model.as_deref(), Some("alpha"));
        assert_eq!(result.source, AvailabilitySource::Preferred);
    }

    #[tokio::test]
    async fn falls_back_when_preferred_is_down() {
        let transport = Arc::new(FakeTransport::new(&[("alpha", "down"), ("beta", "ok")]));
        let availability = checker(transport.clone());
        let result = availability.get_available("alpha", Some("beta")).await;
        assert_eq!(result.model.as_deref(), Some("beta"));
        assert_eq!(result.source, AvailabilitySource::Fallback);
    }

    #[tokio::test]
    async fn scans_alternatives_when_both_fail() {
        let transport = Arc::new(FakeTransport::new(&[
            ("alpha", "down"),
            ("beta", "down"),
            ("gamma", "ok"),
        ]));
        let availability = checker(transport.clone());
        let result = availability.get_available("alpha", Some("beta")).await;
        assert_eq!(result.model.as_deref(), Some("gamma"));
        assert_eq!(result.source, AvailabilitySource::Alternative);
    }

    #[tokio::test]
    async fn saturated_model_counts_as_available_but_marked() {
        let transport = Arc::new(FakeTransport::new(&[("alpha", "busy")]));
        let availability = checker(transport.clone());
        let result = availability.get_available("alpha", None).await;
        assert!(result.available);
        assert_eq!(result.source, AvailabilitySource::Preferred);
        // The observed 429 marks the model for its window.
        assert!(availability.is_rate_limited("alpha").await);
    }

    #[tokio::test]
    async fn verdicts_are_cached_within_ttl() {
        let transport = Arc::new(FakeTransport::new(&[("alpha", "ok")]));
        let availability = checker(transport.clone());
        let first = availability.get_available("alpha", None).await;
        let probes_after_first = transport.probes.load(Ordering::Relaxed);
        let second = availability.get_available("alpha", None).await;
        assert_eq!(first.model, second.model);
        assert_eq!(transport.probes.load(Ordering::Relaxed), probes_after_first);
    }

    #[tokio::test]
    async fn model_list_is_cached_within_ttl() {
        let transport = Arc::new(FakeTransport::new(&[("alpha", "ok")]));
        let availability = checker(transport.clone());
        availability.models().await.unwrap();
        availability.models().await.unwrap();
        assert_eq!(transport.list_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn hard_capped_model_is_rate_limited() {
        let transport = Arc::new(FakeTransport {
            models: vec![ModelRecord {
                id: "alpha".to_string(),
                provider: None,
                rate_limit_info: Some(crate::RateLimitInfo {
                    adaptive_hard_cap: Some(true),
                    ..Default::default()
                }),
            }],
            behaviour: HashMap::from([("alpha".to_string(), "ok")]),
            probes: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
        });
        let availability = checker(transport.clone());
        assert!(availability.is_rate_limited("alpha").await);
        // get_available skips it entirely: no probe issued.
        let result = availability.get_available("alpha", None).await;
        assert!(result.model.is_none());
        assert_eq!(result.source, AvailabilitySource::None);
    }
}

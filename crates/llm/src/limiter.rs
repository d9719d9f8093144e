//! Adaptive rate limiter in front of the LLM endpoint.
//!
//! A priority queue feeds a serialized dispatch step: work is admitted while
//! `active < max_concurrent` (tighter while the breaker is half-open), an
//! adaptive delay is applied before each request, and a rolling 60 s window
//! of outcomes drives both the delay and periodic concurrency adjustment.
//! Higher priority preempts queued work, never running work.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use maestro_config::RateLimiterConfig;
use maestro_core::{Error, ErrorKind, Result};

use crate::breaker::{Admission, CircuitBreaker};
use crate::ChatOutcome;

/// A queued unit of work. `Fn` rather than `FnOnce` so the limiter can retry.
pub type RequestTask = Arc<dyn Fn() -> BoxFuture<'static, Result<ChatOutcome>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

struct Queued {
    seq: u64,
    priority: Priority,
    enqueued_at: Instant,
    deadline: Duration,
    retries_left: u32,
    task: RequestTask,
    tx: oneshot::Sender<Result<ChatOutcome>>,
}

struct LimiterState {
    /// Sorted by (priority, seq): FIFO within a priority band.
    queue: VecDeque<Queued>,
    active: usize,
    max_concurrent: usize,
    next_seq: u64,
}

struct Sample {
    at: Instant,
    duration: Duration,
    success: bool,
}

const STATS_WINDOW: Duration = Duration::from_secs(60);
const ADJUST_INTERVAL: Duration = Duration::from_secs(10);
const MAX_CONCURRENT_CEILING: usize = 5;

pub struct RateLimiter {
    config: RateLimiterConfig,
    breaker: Arc<CircuitBreaker>,
    state: Mutex<LimiterState>,
    samples: Mutex<VecDeque<Sample>>,
    stopped: AtomicBool,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig, breaker: Arc<CircuitBreaker>) -> Self {
        let max_concurrent = config.max_concurrent;
        Self {
            config,
            breaker,
            state: Mutex::new(LimiterState {
                queue: VecDeque::new(),
                active: 0,
                max_concurrent,
                next_seq: 0,
            }),
            samples: Mutex::new(VecDeque::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Start the periodic concurrency-adjustment task.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ADJUST_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if limiter.stopped.load(Ordering::Relaxed) {
                    break;
                }
                limiter.adjust_concurrency();
            }
        })
    }

    /// Stop accepting work and fail everything still queued.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        let drained: Vec<Queued> = self.state.lock().unwrap().queue.drain(..).collect();
        for queued in drained {
            let _ = queued
                .tx
                .send(Err(Error::new(ErrorKind::LlmUnavailable, "rate limiter stopped")));
        }
    }

    /// Submit one unit of work and wait for its outcome.
    ///
    /// Rejections that never reach the queue: limiter stopped, circuit open
    /// inside its recovery window, or queue backpressure for non-critical
    /// priorities.
    pub async fn submit(
        self: &Arc<Self>,
        priority: Priority,
        deadline: Duration,
        retries: u32,
        task: RequestTask,
    ) -> Result<ChatOutcome> {
        if self.stopped.load(Ordering::Relaxed) {
            return Err(Error::new(ErrorKind::LlmUnavailable, "rate limiter stopped"));
        }
        if self.breaker.would_reject() {
            return Err(Error::new(
                ErrorKind::LlmRateLimited,
                "circuit open, request rejected",
            ));
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            if state.queue.len() >= self.config.queue_soft_limit && priority != Priority::Critical {
                return Err(Error::new(
                    ErrorKind::LlmRateLimited,
                    "degraded: rate limiter queue full",
                ));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            let queued = Queued {
                seq,
                priority,
                enqueued_at: Instant::now(),
                deadline,
                retries_left: retries,
                task,
                tx,
            };
            let position = state
                .queue
                .iter()
                .position(|other| other.priority > priority)
                .unwrap_or(state.queue.len());
            state.queue.insert(position, queued);
        }

        // Arm a timer so a request stuck behind saturated slots is still
        // rejected once its deadline passes.
        let limiter = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            limiter.try_dispatch();
        });

        self.try_dispatch();

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::new(ErrorKind::LlmUnavailable, "rate limiter dropped request")),
        }
    }

    /// Admit as much queued work as the caps allow. Serialized by the state
    /// mutex so priority ordering holds.
    fn try_dispatch(self: &Arc<Self>) {
        let mut expired: Vec<Queued> = Vec::new();
        loop {
            let next = {
                let mut state = self.state.lock().unwrap();

                // Expire before admitting so a stale request never runs.
                let mut index = 0;
                while index < state.queue.len() {
                    if state.queue[index].enqueued_at.elapsed() >= state.queue[index].deadline {
                        expired.push(state.queue.remove(index).unwrap());
                    } else {
                        index += 1;
                    }
                }

                let cap = if self.breaker.is_half_open() {
                    state.max_concurrent.min(self.breaker.half_open_cap())
                } else {
                    state.max_concurrent
                };
                if state.active >= cap || state.queue.is_empty() {
                    None
                } else {
                    match self.breaker.try_admit() {
                        Admission::Rejected => None,
                        Admission::Admitted | Admission::Probe => {
                            state.active += 1;
                            state.queue.pop_front()
                        }
                    }
                }
            };

            match next {
                Some(queued) => {
                    let limiter = self.clone();
                    tokio::spawn(async move {
                        limiter.run_one(queued).await;
                    });
                }
                None => break,
            }
        }

        for queued in expired {
            warn!(priority = ?queued.priority, "queued request exceeded its deadline");
            let _ = queued
                .tx
                .send(Err(Error::new(
                    ErrorKind::LlmRateLimited,
                    "queued past deadline, rejected before execution",
                )));
        }
    }

    async fn run_one(self: Arc<Self>, queued: Queued) {
        let delay = self.compute_delay();
        if delay > Duration::ZERO {
            debug!(delay_ms = delay.as_millis() as u64, "adaptive pre-dispatch delay");
            tokio::time::sleep(delay).await;
        }

        let started = Instant::now();
        let result = (queued.task)().await;
        let duration = started.elapsed();

        self.record_sample(duration, result.is_ok());
        match &result {
            Ok(_) => self.breaker.on_success(),
            // 429 is "service busy": it does not move the breaker.
            Err(err) if err.kind() == ErrorKind::LlmRateLimited => {}
            Err(_) => self.breaker.on_failure(),
        }

        let retriable = matches!(
            result.as_ref().err().map(Error::kind),
            Some(ErrorKind::LlmRateLimited) | Some(ErrorKind::LlmUnavailable)
        );
        if retriable
            && queued.retries_left > 0
            && queued.enqueued_at.elapsed() < queued.deadline
            && !self.breaker.would_reject()
        {
            debug!(retries_left = queued.retries_left - 1, "re-enqueueing failed request");
            let mut state = self.state.lock().unwrap();
            state.active -= 1;
            let seq = state.next_seq;
            state.next_seq += 1;
            let requeued = Queued {
                seq,
                retries_left: queued.retries_left - 1,
                ..queued
            };
            let position = state
                .queue
                .iter()
                .position(|other| other.priority > requeued.priority)
                .unwrap_or(state.queue.len());
            state.queue.insert(position, requeued);
            drop(state);
            self.try_dispatch();
            return;
        }

        let _ = queued.tx.send(result);
        self.state.lock().unwrap().active -= 1;
        self.try_dispatch();
    }

    // ── Rolling statistics ───────────────────────────────────────────────────

    fn record_sample(&self, duration: Duration, success: bool) {
        let mut samples = self.samples.lock().unwrap();
        samples.push_back(Sample {
            at: Instant::now(),
            duration,
            success,
        });
        while let Some(front) = samples.front() {
            if front.at.elapsed() > STATS_WINDOW {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn window_stats(&self) -> (f64, f64, f64) {
        let samples = self.samples.lock().unwrap();
        let live: Vec<&Sample> = samples
            .iter()
            .filter(|sample| sample.at.elapsed() <= STATS_WINDOW)
            .collect();
        if live.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        let failures = live.iter().filter(|sample| !sample.success).count();
        let error_rate = failures as f64 / live.len() as f64;
        let avg_ms = live
            .iter()
            .map(|sample| sample.duration.as_millis() as f64)
            .sum::<f64>()
            / live.len() as f64;
        let throughput = live.len() as f64 / STATS_WINDOW.as_secs_f64();
        (error_rate, avg_ms, throughput)
    }

    /// `base × (1 + 2·error_rate)`, scaled up when the endpoint is slow,
    /// halved when traffic is light, doubled while half-open.
    fn compute_delay(&self) -> Duration {
        let (error_rate, avg_ms, throughput) = self.window_stats();
        let mut delay = self.config.base_delay_ms as f64 * (1.0 + 2.0 * error_rate);
        if avg_ms > 2_000.0 {
            delay *= avg_ms / 1_000.0;
        }
        if throughput < 0.5 {
            delay /= 2.0;
        }
        if self.breaker.is_half_open() {
            delay *= 2.0;
        }
        Duration::from_millis(delay.clamp(0.0, self.config.max_delay_ms as f64) as u64)
    }

    /// Every 10 s: back off one slot under sustained errors, grow one slot
    /// when healthy and fast, within [1, 5].
    fn adjust_concurrency(&self) {
        let (error_rate, avg_ms, _) = self.window_stats();
        let mut state = self.state.lock().unwrap();
        if error_rate > 0.2 && state.max_concurrent > 1 {
            state.max_concurrent -= 1;
            info!(max_concurrent = state.max_concurrent, "reduced concurrency");
        } else if error_rate < 0.05
            && avg_ms < 1_500.0
            && state.max_concurrent < MAX_CONCURRENT_CEILING
        {
            state.max_concurrent += 1;
            info!(max_concurrent = state.max_concurrent, "raised concurrency");
        }
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn active(&self) -> usize {
        self.state.lock().unwrap().active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use futures::FutureExt;
    use maestro_config::CircuitBreakerConfig;
    use std::sync::atomic::AtomicUsize;

    fn outcome(tag: &str) -> ChatOutcome {
        ChatOutcome {
            model: "test".to_string(),
            content: tag.to_string(),
            finish_reason: "stop".to_string(),
            fallback: false,
        }
    }

    fn limiter(max_concurrent: usize, threshold: u32, recovery_ms: u64) -> Arc<RateLimiter> {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_ms,
            half_open_admit_max: 3,
        }));
        Arc::new(RateLimiter::new(
            RateLimiterConfig {
                max_concurrent,
                base_delay_ms: 0,
                max_delay_ms: 0,
                queue_soft_limit: 64,
            },
            breaker,
        ))
    }

    fn ok_task(log: Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> RequestTask {
        Arc::new(move || {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(tag);
                Ok(outcome(tag))
            }
            .boxed()
        })
    }

    fn failing_task() -> RequestTask {
        Arc::new(|| {
            async { Err(Error::new(ErrorKind::LlmUnavailable, "endpoint 500")) }.boxed()
        })
    }

    #[tokio::test]
    async fn single_slot_is_fifo_and_priority_preempts_queued_work() {
        let limiter = limiter(1, 100, 60_000);
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        // Occupy the only slot so later submissions queue up.
        let blocker: RequestTask = {
            let log = log.clone();
            Arc::new(move || {
                let log = log.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    log.lock().unwrap().push("blocker");
                    Ok(outcome("blocker"))
                }
                .boxed()
            })
        };

        let l = limiter.clone();
        let first = tokio::spawn(async move {
            l.submit(Priority::Normal, Duration::from_secs(5), 0, blocker).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let l = limiter.clone();
        let low_task = ok_task(log.clone(), "low");
        let low = tokio::spawn(async move {
            l.submit(Priority::Low, Duration::from_secs(5), 0, low_task).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let l = limiter.clone();
        let critical_task = ok_task(log.clone(), "critical");
        let critical = tokio::spawn(async move {
            l.submit(Priority::Critical, Duration::from_secs(5), 0, critical_task).await
        });

        first.await.unwrap().unwrap();
        critical.await.unwrap().unwrap();
        low.await.unwrap().unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["blocker", "critical", "low"]);
    }

    #[tokio::test]
    async fn breaker_trips_then_recovers_through_half_open() {
        let limiter = limiter(1, 3, 200);

        for _ in 0..3 {
            let err = limiter
                .submit(Priority::Normal, Duration::from_secs(5), 0, failing_task())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::LlmUnavailable);
        }
        assert_eq!(limiter.breaker().state(), BreakerState::Open);

        // 4th submission: rejected without executing anything.
        let err = limiter
            .submit(Priority::Normal, Duration::from_secs(5), 0, failing_task())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LlmRateLimited);

        tokio::time::sleep(Duration::from_millis(250)).await;

        // Admitted in half-open; three consecutive successes close it.
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            limiter
                .submit(
                    Priority::Normal,
                    Duration::from_secs(5),
                    0,
                    ok_task(log.clone(), "ok"),
                )
                .await
                .unwrap();
        }
        assert_eq!(limiter.breaker().state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn rate_limited_responses_do_not_move_the_breaker() {
        let limiter = limiter(1, 1, 60_000);
        let busy: RequestTask = Arc::new(|| {
            async { Err(Error::new(ErrorKind::LlmRateLimited, "429")) }.boxed()
        });
        let err = limiter
            .submit(Priority::Normal, Duration::from_secs(5), 0, busy)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LlmRateLimited);
        assert_eq!(limiter.breaker().state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn queued_request_expires_before_execution() {
        let limiter = limiter(1, 100, 60_000);

        let blocker: RequestTask = Arc::new(|| {
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(outcome("blocker"))
            }
            .boxed()
        });
        let l = limiter.clone();
        let first = tokio::spawn(async move {
            l.submit(Priority::Normal, Duration::from_secs(5), 0, blocker).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let executed = Arc::new(AtomicUsize::new(0));
        let counter = executed.clone();
        let stale: RequestTask = Arc::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(outcome("stale"))
            }
            .boxed()
        });
        let err = limiter
            .submit(Priority::Normal, Duration::from_millis(50), 0, stale)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LlmRateLimited);
        assert_eq!(executed.load(Ordering::Relaxed), 0);

        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn backpressure_rejects_non_critical_when_queue_is_full() {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
        let limiter = Arc::new(RateLimiter::new(
            RateLimiterConfig {
                max_concurrent: 1,
                base_delay_ms: 0,
                max_delay_ms: 0,
                queue_soft_limit: 1,
            },
            breaker,
        ));

        let blocker: RequestTask = Arc::new(|| {
            async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(outcome("blocker"))
            }
            .boxed()
        });
        let l = limiter.clone();
        let first = tokio::spawn(async move {
            l.submit(Priority::Normal, Duration::from_secs(5), 0, blocker).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Fills the queue to the soft limit.
        let sleeper: RequestTask = Arc::new(|| async { Ok(outcome("q")) }.boxed());
        let l = limiter.clone();
        let queued_task = sleeper.clone();
        let queued = tokio::spawn(async move {
            l.submit(Priority::Normal, Duration::from_secs(5), 0, queued_task).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = limiter
            .submit(Priority::Normal, Duration::from_secs(5), 0, sleeper.clone())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LlmRateLimited);
        assert!(err.message().contains("degraded"));

        // Critical work is still admitted to the queue.
        let l = limiter.clone();
        let critical = tokio::spawn(async move {
            l.submit(Priority::Critical, Duration::from_secs(5), 0, sleeper).await
        });

        first.await.unwrap().unwrap();
        queued.await.unwrap().unwrap();
        critical.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn retries_rerun_the_task() {
        let limiter = limiter(1, 100, 60_000);
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let flaky: RequestTask = Arc::new(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::Relaxed) == 0 {
                    Err(Error::new(ErrorKind::LlmUnavailable, "first attempt fails"))
                } else {
                    Ok(outcome("second"))
                }
            }
            .boxed()
        });

        let result = limiter
            .submit(Priority::Normal, Duration::from_secs(5), 2, flaky)
            .await
            .unwrap();
        assert_eq!(result.content, "second");
        assert_eq!(attempts.load(Ordering::Relaxed), 2);
    }
}

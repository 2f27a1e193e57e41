//! Adaptive rate control for LLM and embedding traffic.
//!
//! Two mechanisms, used at different layers:
//!
//! - [`AdaptiveRateController`] — a concurrency semaphore whose capacity is
//!   adjusted from observed latency and rate-limit feedback. Every LLM
//!   caller holds one permit per in-flight call.
//! - [`FlowController`] — a token bucket whose refill rate is scaled by a
//!   queue-utilization feedback loop. The orchestrator paces embedding
//!   batches through it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

#[derive(Debug, Clone)]
pub struct RateControllerConfig {
    pub initial_concurrency: usize,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    /// Rate-limit hits before an aggressive backoff.
    pub rate_limit_threshold: usize,
    /// Latency samples required before a latency-based adjustment.
    pub latency_window: usize,
    /// Mean latency below this grows concurrency.
    pub latency_lower: f64,
    /// Mean latency above this shrinks concurrency.
    pub latency_upper: f64,
    /// Base unit for exponential backoff (`unit * min(2^attempt, 32)`).
    pub backoff_unit: Duration,
}

impl Default for RateControllerConfig {
    fn default() -> Self {
        Self {
            initial_concurrency: 4,
            min_concurrency: 1,
            max_concurrency: 8,
            rate_limit_threshold: 3,
            latency_window: 20,
            latency_lower: 0.6,
            latency_upper: 1.2,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default)]
struct ControllerState {
    concurrency: usize,
    successes: usize,
    rate_limit_hits: usize,
    latencies: VecDeque<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateControllerStatus {
    pub concurrency: usize,
    pub successes: usize,
    pub rate_limit_hits: usize,
    pub avg_latency: f64,
    pub latency_window: usize,
}

/// Dynamically adjusts LLM-call concurrency based on service feedback.
pub struct AdaptiveRateController {
    config: RateControllerConfig,
    state: Mutex<ControllerState>,
    // Swapped wholesale on adjustment; in-flight permits belong to the old
    // semaphore and drain naturally when dropped.
    semaphore: RwLock<Arc<Semaphore>>,
}

impl AdaptiveRateController {
    pub fn new(config: RateControllerConfig) -> Self {
        let concurrency = config
            .initial_concurrency
            .clamp(config.min_concurrency, config.max_concurrency);
        Self {
            semaphore: RwLock::new(Arc::new(Semaphore::new(concurrency))),
            state: Mutex::new(ControllerState {
                concurrency,
                ..Default::default()
            }),
            config,
        }
    }

    /// Acquire a call slot. Held permits throttle all LLM traffic.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        let semaphore = Arc::clone(&self.semaphore.read().expect("semaphore lock"));
        semaphore
            .acquire_owned()
            .await
            .expect("controller semaphore never closed")
    }

    pub fn record_success(&self, latency_secs: f64) {
        let mut state = self.state.lock().expect("controller state lock");
        state.successes += 1;
        state.latencies.push_back(latency_secs);
    }

    pub fn record_rate_limit(&self) {
        let mut state = self.state.lock().expect("controller state lock");
        state.rate_limit_hits += 1;
    }

    pub fn concurrency(&self) -> usize {
        self.state.lock().expect("controller state lock").concurrency
    }

    /// Evaluate feedback and adjust concurrency. Call periodically (the
    /// workers call it every few processed items).
    pub fn adjust(&self) {
        let mut state = self.state.lock().expect("controller state lock");

        if state.rate_limit_hits >= self.config.rate_limit_threshold {
            let old = state.concurrency;
            state.concurrency = ((state.concurrency as f64 * 0.7) as usize)
                .max(self.config.min_concurrency);
            info!(
                "rate limit pressure ({} hits): concurrency {} -> {}",
                state.rate_limit_hits, old, state.concurrency
            );
            state.rate_limit_hits = 0;
            state.latencies.clear();
            self.swap_semaphore(state.concurrency);
            return;
        }

        if state.latencies.len() >= self.config.latency_window {
            let mean: f64 =
                state.latencies.iter().sum::<f64>() / state.latencies.len() as f64;

            if mean < self.config.latency_lower {
                let old = state.concurrency;
                state.concurrency = (state.concurrency + 2).min(self.config.max_concurrency);
                if state.concurrency != old {
                    info!("low latency ({mean:.3}s): concurrency {} -> {}", old, state.concurrency);
                    self.swap_semaphore(state.concurrency);
                }
            } else if mean > self.config.latency_upper {
                let old = state.concurrency;
                state.concurrency = ((state.concurrency as f64 * 0.9) as usize)
                    .max(self.config.min_concurrency);
                if state.concurrency != old {
                    info!("high latency ({mean:.3}s): concurrency {} -> {}", old, state.concurrency);
                    self.swap_semaphore(state.concurrency);
                }
            }

            state.latencies.clear();
        }
    }

    fn swap_semaphore(&self, capacity: usize) {
        let mut guard = self.semaphore.write().expect("semaphore lock");
        *guard = Arc::new(Semaphore::new(capacity));
    }

    /// Exponential backoff for callers that have been rate-limited.
    pub async fn sleep_backoff(&self, attempt: u32) {
        let units = 2u32.saturating_pow(attempt).min(32);
        tokio::time::sleep(self.config.backoff_unit * units).await;
    }

    #[allow(dead_code)]
    pub fn status(&self) -> RateControllerStatus {
        let state = self.state.lock().expect("controller state lock");
        let avg = if state.latencies.is_empty() {
            0.0
        } else {
            state.latencies.iter().sum::<f64>() / state.latencies.len() as f64
        };
        RateControllerStatus {
            concurrency: state.concurrency,
            successes: state.successes,
            rate_limit_hits: state.rate_limit_hits,
            avg_latency: avg,
            latency_window: state.latencies.len(),
        }
    }
}

// ─── Token bucket variant ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub tokens_per_sec: f64,
    pub max_burst: f64,
    pub refill_interval: Duration,
    /// Wall-clock budget for one acquire before giving up.
    pub max_wait: Duration,
    /// Queue utilization above this multiplies the rate by
    /// `backpressure_factor`.
    pub congestion_threshold: f64,
    /// Queue utilization below this multiplies the rate by
    /// `recovery_factor`.
    pub recovery_threshold: f64,
    pub backpressure_factor: f64,
    pub recovery_factor: f64,
    pub max_rate_multiplier: f64,
    pub min_rate_multiplier: f64,
    /// Utilization samples kept for feedback evaluation.
    pub feedback_window: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            tokens_per_sec: 100.0,
            max_burst: 500.0,
            refill_interval: Duration::from_millis(100),
            max_wait: Duration::from_secs(60),
            congestion_threshold: 0.8,
            recovery_threshold: 0.3,
            backpressure_factor: 0.5,
            recovery_factor: 1.2,
            max_rate_multiplier: 2.0,
            min_rate_multiplier: 0.2,
            feedback_window: 100,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    rate_multiplier: f64,
    utilization: VecDeque<f64>,
}

/// Token bucket with a queue-utilization feedback loop.
pub struct FlowController {
    config: FlowConfig,
    state: Mutex<BucketState>,
}

impl FlowController {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: config.max_burst,
                last_refill: Instant::now(),
                rate_multiplier: 1.0,
                utilization: VecDeque::new(),
            }),
            config,
        }
    }

    fn refill(state: &mut BucketState, config: &FlowConfig) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens =
            (state.tokens + config.tokens_per_sec * state.rate_multiplier * elapsed)
                .min(config.max_burst);
        state.last_refill = now;
    }

    /// Acquire `n` tokens, waiting for refill as needed. Returns false when
    /// the wall-clock budget runs out first.
    pub async fn acquire(&self, tokens: f64) -> bool {
        let deadline = Instant::now() + self.config.max_wait;

        loop {
            let wait = {
                let mut state = self.state.lock().expect("bucket lock");
                Self::refill(&mut state, &self.config);
                if state.tokens >= tokens {
                    state.tokens -= tokens;
                    return true;
                }
                let missing = tokens - state.tokens;
                let rate = self.config.tokens_per_sec * state.rate_multiplier;
                if rate > 0.0 {
                    Duration::from_secs_f64(missing / rate).min(self.config.refill_interval)
                } else {
                    self.config.refill_interval
                }
            };

            if Instant::now() + wait > deadline {
                return false;
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Record one queue-utilization sample (depth / capacity).
    pub fn record_utilization(&self, depth: usize, capacity: usize) {
        let mut state = self.state.lock().expect("bucket lock");
        let sample = if capacity > 0 {
            depth as f64 / capacity as f64
        } else {
            0.0
        };
        state.utilization.push_back(sample);
        while state.utilization.len() > self.config.feedback_window {
            state.utilization.pop_front();
        }
    }

    /// Evaluate queue utilization and adjust the refill multiplier.
    pub fn evaluate_feedback(&self) {
        let mut state = self.state.lock().expect("bucket lock");
        if state.utilization.is_empty() {
            return;
        }
        let avg: f64 = state.utilization.iter().sum::<f64>() / state.utilization.len() as f64;

        let next = if avg >= self.config.congestion_threshold {
            state.rate_multiplier * self.config.backpressure_factor
        } else if avg <= self.config.recovery_threshold {
            state.rate_multiplier * self.config.recovery_factor
        } else {
            return;
        };

        state.rate_multiplier = next.clamp(
            self.config.min_rate_multiplier,
            self.config.max_rate_multiplier,
        );
    }

    pub fn rate_multiplier(&self) -> f64 {
        self.state.lock().expect("bucket lock").rate_multiplier
    }

    #[allow(dead_code)]
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock().expect("bucket lock");
        Self::refill(&mut state, &self.config);
        state.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(initial: usize) -> AdaptiveRateController {
        AdaptiveRateController::new(RateControllerConfig {
            initial_concurrency: initial,
            min_concurrency: 1,
            max_concurrency: 8,
            ..Default::default()
        })
    }

    #[test]
    fn test_rate_limit_hits_shrink_concurrency() {
        let c = controller(4);
        c.record_rate_limit();
        c.record_rate_limit();
        c.record_rate_limit();
        c.adjust();
        // 4 * 0.7 = 2.8 -> 2
        assert_eq!(c.concurrency(), 2);
        // counter reset: another adjust does nothing
        c.adjust();
        assert_eq!(c.concurrency(), 2);
    }

    #[test]
    fn test_rate_limit_respects_minimum() {
        let c = controller(1);
        for _ in 0..3 {
            c.record_rate_limit();
        }
        c.adjust();
        assert_eq!(c.concurrency(), 1);
    }

    #[test]
    fn test_fewer_hits_than_threshold_no_change() {
        let c = controller(4);
        c.record_rate_limit();
        c.record_rate_limit();
        c.adjust();
        assert_eq!(c.concurrency(), 4);
    }

    #[test]
    fn test_low_latency_grows_concurrency() {
        let c = controller(4);
        for _ in 0..20 {
            c.record_success(0.2);
        }
        c.adjust();
        assert_eq!(c.concurrency(), 6);
    }

    #[test]
    fn test_high_latency_shrinks_concurrency() {
        let c = controller(8);
        for _ in 0..20 {
            c.record_success(2.0);
        }
        c.adjust();
        // 8 * 0.9 = 7.2 -> 7
        assert_eq!(c.concurrency(), 7);
    }

    #[test]
    fn test_latency_window_required() {
        let c = controller(4);
        for _ in 0..5 {
            c.record_success(0.1);
        }
        c.adjust();
        assert_eq!(c.concurrency(), 4);
    }

    #[test]
    fn test_growth_capped_at_max() {
        let c = controller(8);
        for _ in 0..20 {
            c.record_success(0.1);
        }
        c.adjust();
        assert_eq!(c.concurrency(), 8);
    }

    #[tokio::test]
    async fn test_acquire_respects_capacity() {
        let c = controller(2);
        let p1 = c.acquire().await;
        let _p2 = c.acquire().await;
        // third acquire must block until a permit drops
        let third = tokio::time::timeout(Duration::from_millis(50), c.acquire()).await;
        assert!(third.is_err());

        drop(p1);
        let third = tokio::time::timeout(Duration::from_millis(50), c.acquire()).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let c = controller(4);
        c.record_success(0.5);
        c.record_success(1.5);
        let status = c.status();
        assert_eq!(status.successes, 2);
        assert!((status.avg_latency - 1.0).abs() < 1e-9);
    }

    // ── token bucket ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_bucket_burst_acquires_immediately() {
        let flow = FlowController::new(FlowConfig {
            max_burst: 10.0,
            ..Default::default()
        });
        assert!(flow.acquire(10.0).await);
    }

    #[tokio::test]
    async fn test_bucket_times_out_when_starved() {
        let flow = FlowController::new(FlowConfig {
            tokens_per_sec: 0.001,
            max_burst: 1.0,
            max_wait: Duration::from_millis(30),
            ..Default::default()
        });
        assert!(flow.acquire(1.0).await);
        assert!(!flow.acquire(5.0).await);
    }

    #[tokio::test]
    async fn test_bucket_refills_over_time() {
        let flow = FlowController::new(FlowConfig {
            tokens_per_sec: 200.0,
            max_burst: 10.0,
            max_wait: Duration::from_secs(1),
            ..Default::default()
        });
        assert!(flow.acquire(10.0).await);
        // refill at 200/s makes 4 tokens available well within the budget
        assert!(flow.acquire(4.0).await);
    }

    #[test]
    fn test_feedback_backpressure() {
        let flow = FlowController::new(FlowConfig::default());
        for _ in 0..10 {
            flow.record_utilization(90, 100);
        }
        flow.evaluate_feedback();
        assert!((flow.rate_multiplier() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_feedback_recovery_and_clamp() {
        let flow = FlowController::new(FlowConfig::default());
        for _ in 0..10 {
            flow.record_utilization(5, 100);
        }
        for _ in 0..10 {
            flow.evaluate_feedback();
        }
        // repeated recovery clamps at the max multiplier
        assert!((flow.rate_multiplier() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_feedback_mid_band_no_change() {
        let flow = FlowController::new(FlowConfig::default());
        flow.record_utilization(50, 100);
        flow.evaluate_feedback();
        assert!((flow.rate_multiplier() - 1.0).abs() < 1e-9);
    }
}

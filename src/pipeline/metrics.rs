//! Metrics collection for the ingestion pipeline.
//!
//! Counters are atomics so every worker can record without contention;
//! latency windows keep the most recent thousand samples per stage.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

const LATENCY_WINDOW: usize = 1_000;

#[derive(Debug)]
pub struct IngestMetrics {
    processed: AtomicUsize,
    dropped: AtomicUsize,
    rate_limit_hits: AtomicUsize,
    errors: AtomicUsize,
    embed_times: Mutex<VecDeque<f64>>,
    db_times: Mutex<VecDeque<f64>>,
    minister_times: Mutex<VecDeque<f64>>,
    start_time: Instant,
}

/// Snapshot report persisted into `03_embeddings.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub elapsed_seconds: f64,
    pub processed_chunks: usize,
    pub dropped_chunks: usize,
    pub rate_limit_hits: usize,
    pub errors: usize,
    pub throughput_chunks_per_sec: f64,
    pub avg_embed_latency_ms: f64,
    pub avg_db_latency_ms: f64,
    pub avg_minister_latency_ms: f64,
}

impl Default for IngestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self {
            processed: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            rate_limit_hits: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            embed_times: Mutex::new(VecDeque::new()),
            db_times: Mutex::new(VecDeque::new()),
            minister_times: Mutex::new(VecDeque::new()),
            start_time: Instant::now(),
        }
    }

    fn push_latency(window: &Mutex<VecDeque<f64>>, latency_secs: f64) {
        let mut window = window.lock().expect("metrics lock");
        window.push_back(latency_secs);
        while window.len() > LATENCY_WINDOW {
            window.pop_front();
        }
    }

    fn avg(window: &Mutex<VecDeque<f64>>) -> f64 {
        let window = window.lock().expect("metrics lock");
        if window.is_empty() {
            0.0
        } else {
            window.iter().sum::<f64>() / window.len() as f64
        }
    }

    pub fn record_embed(&self, latency_secs: f64) {
        Self::push_latency(&self.embed_times, latency_secs);
    }

    pub fn record_db(&self, latency_secs: f64) {
        Self::push_latency(&self.db_times, latency_secs);
    }

    pub fn record_minister(&self, latency_secs: f64) {
        Self::push_latency(&self.minister_times, latency_secs);
    }

    pub fn record_processed(&self, count: usize) {
        self.processed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: usize) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rate_limit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn rate_limit_hits(&self) -> usize {
        self.rate_limit_hits.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> MetricsReport {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let processed = self.processed();
        MetricsReport {
            elapsed_seconds: elapsed,
            processed_chunks: processed,
            dropped_chunks: self.dropped.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits(),
            errors: self.errors(),
            throughput_chunks_per_sec: processed as f64 / elapsed.max(1.0),
            avg_embed_latency_ms: Self::avg(&self.embed_times) * 1000.0,
            avg_db_latency_ms: Self::avg(&self.db_times) * 1000.0,
            avg_minister_latency_ms: Self::avg(&self.minister_times) * 1000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = IngestMetrics::new();
        m.record_processed(3);
        m.record_processed(2);
        m.record_dropped(1);
        m.record_rate_limit();
        m.record_error();

        let report = m.report();
        assert_eq!(report.processed_chunks, 5);
        assert_eq!(report.dropped_chunks, 1);
        assert_eq!(report.rate_limit_hits, 1);
        assert_eq!(report.errors, 1);
    }

    #[test]
    fn test_latency_averages() {
        let m = IngestMetrics::new();
        m.record_embed(0.1);
        m.record_embed(0.3);
        m.record_db(0.05);

        let report = m.report();
        assert!((report.avg_embed_latency_ms - 200.0).abs() < 1e-6);
        assert!((report.avg_db_latency_ms - 50.0).abs() < 1e-6);
        assert_eq!(report.avg_minister_latency_ms, 0.0);
    }

    #[test]
    fn test_latency_window_bounded() {
        let m = IngestMetrics::new();
        for _ in 0..(LATENCY_WINDOW + 100) {
            m.record_embed(1.0);
        }
        assert_eq!(m.embed_times.lock().unwrap().len(), LATENCY_WINDOW);
    }

    #[test]
    fn test_report_serializes() {
        let m = IngestMetrics::new();
        m.record_processed(1);
        let json = serde_json::to_value(m.report()).unwrap();
        assert_eq!(json["processed_chunks"], 1);
    }
}

//! Bounded multi-stage async dataflow for embedding ingestion.
//!
//! reader(s) → chunk_queue → embed workers → vector_queue → DB writer →
//! minister_queue → aggregator. Queues are bounded (backpressure is
//! implicit: producers block when full) and shut down with sentinels: one
//! `None` per embed worker after input exhaustion, one for the writer, one
//! forwarded to the aggregator. After the drain timeout the tail tasks are
//! aborted and their cancellation awaited.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::metrics::{IngestMetrics, MetricsReport};
use super::rate::{AdaptiveRateController, FlowController};
use crate::domain::Domain;
use crate::llm::{LlmError, LlmService};
use crate::minister::MinisterWriter;
use crate::store::{Category, NewRecord, VectorStore};

/// Fallback embedding width used for zero-vector sentinels before any real
/// vector has been observed.
const DEFAULT_EMBED_DIM: usize = 768;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub queue_capacity: usize,
    pub num_embed_workers: usize,
    pub embed_batch_size: usize,
    pub embed_flush_interval: Duration,
    pub embed_timeout: Duration,
    /// Transient-failure retries per batch (rate limits retry with backoff
    /// on top of this).
    pub max_batch_retries: u32,
    pub db_batch_size: usize,
    /// Aggregator flushes a domain buffer at this size.
    pub minister_flush_threshold: usize,
    /// Drain budget for the writer + aggregator after sentinels are sent.
    pub shutdown_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_000,
            num_embed_workers: 4,
            embed_batch_size: 64,
            embed_flush_interval: Duration::from_millis(200),
            embed_timeout: Duration::from_secs(60),
            max_batch_retries: 3,
            db_batch_size: 200,
            minister_flush_threshold: 100,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// The async-stage carrier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub text: String,
    pub domain: Domain,
    pub category: Category,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub source_book: String,
    pub source_chapter: usize,
}

/// On-disk chunk payload (`03_nodes_chunks.json`) as written by the driver
/// and parsed by the reader task.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub text: String,
    pub domain: String,
    pub category: String,
    pub source_book: String,
    pub source_chapter: usize,
    /// Carried through untouched (node ids, types) so downstream phases can
    /// reconnect embedded chunks to their nodes.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// What a completed run hands back to the driver.
#[derive(Debug)]
pub struct RunOutput {
    pub metrics: MetricsReport,
    /// Every chunk that reached the DB writer, embeddings populated.
    pub embedded: Vec<Chunk>,
}

/// Parse one chunk file. Runs on the blocking pool: file I/O and JSON
/// parsing stay off the event loop.
fn parse_chunk_file(path: &PathBuf) -> Vec<Chunk> {
    let Ok(content) = std::fs::read_to_string(path) else {
        warn!("unreadable chunk file: {}", path.display());
        return vec![];
    };
    let Ok(payloads) = serde_json::from_str::<Vec<ChunkPayload>>(&content) else {
        warn!("malformed chunk file: {}", path.display());
        return vec![];
    };

    payloads
        .into_iter()
        .filter_map(|p| {
            let domain = match Domain::parse(&p.domain) {
                Ok(d) => d,
                Err(_) => {
                    warn!("skipping chunk with non-whitelisted domain '{}'", p.domain);
                    return None;
                }
            };
            Some(Chunk {
                id: Uuid::new_v4(),
                text: p.text,
                domain,
                category: Category::parse(&p.category),
                embedding: None,
                metadata: p.metadata,
                source_book: p.source_book,
                source_chapter: p.source_chapter,
            })
        })
        .collect()
}

pub struct IngestOrchestrator {
    config: OrchestratorConfig,
    embed_client: Arc<dyn LlmService>,
    store: Arc<dyn VectorStore>,
    minister: Arc<MinisterWriter>,
    rate: Arc<AdaptiveRateController>,
    flow: Arc<FlowController>,
    pub metrics: Arc<IngestMetrics>,
}

impl IngestOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        embed_client: Arc<dyn LlmService>,
        store: Arc<dyn VectorStore>,
        minister: Arc<MinisterWriter>,
        rate: Arc<AdaptiveRateController>,
        flow: Arc<FlowController>,
    ) -> Self {
        Self {
            config,
            embed_client,
            store,
            minister,
            rate,
            flow,
            metrics: Arc::new(IngestMetrics::new()),
        }
    }

    /// Run the full dataflow over the given chunk files. Every accepted
    /// chunk is either aggregated or reflected in the error counters before
    /// this returns.
    pub async fn run(&self, chunk_files: Vec<PathBuf>) -> RunOutput {
        let cfg = &self.config;
        let embedded_sink: Arc<std::sync::Mutex<Vec<Chunk>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let (chunk_tx, chunk_rx) = mpsc::channel::<Option<Chunk>>(cfg.queue_capacity);
        let (vector_tx, vector_rx) = mpsc::channel::<Option<Chunk>>(cfg.queue_capacity);
        let (minister_tx, minister_rx) = mpsc::channel::<Option<Chunk>>(cfg.queue_capacity);

        let chunk_depth = Arc::new(AtomicUsize::new(0));
        let chunk_rx = Arc::new(AsyncMutex::new(chunk_rx));
        let embed_dim = Arc::new(AtomicUsize::new(0));

        // queue-utilization feedback for the token bucket
        let feedback = {
            let flow = Arc::clone(&self.flow);
            let depth = Arc::clone(&chunk_depth);
            let capacity = cfg.queue_capacity;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    flow.record_utilization(depth.load(Ordering::Relaxed), capacity);
                    flow.evaluate_feedback();
                }
            })
        };

        // readers: one per input file, parsing off the event loop
        let mut readers = Vec::new();
        for path in chunk_files {
            let tx = chunk_tx.clone();
            let depth = Arc::clone(&chunk_depth);
            let metrics = Arc::clone(&self.metrics);
            readers.push(tokio::spawn(async move {
                let chunks = match tokio::task::spawn_blocking(move || parse_chunk_file(&path)).await
                {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        warn!("reader task panicked: {e}");
                        metrics.record_error();
                        return;
                    }
                };
                for chunk in chunks {
                    depth.fetch_add(1, Ordering::Relaxed);
                    if tx.send(Some(chunk)).await.is_err() {
                        return;
                    }
                }
            }));
        }

        // embed workers
        let mut embed_workers = Vec::new();
        for worker_id in 0..cfg.num_embed_workers {
            embed_workers.push(self.spawn_embed_worker(
                worker_id,
                Arc::clone(&chunk_rx),
                vector_tx.clone(),
                Arc::clone(&chunk_depth),
                Arc::clone(&embed_dim),
            ));
        }

        let mut writer = self.spawn_db_writer(vector_rx, minister_tx, Arc::clone(&embedded_sink));
        let mut aggregator = self.spawn_aggregator(minister_rx);

        // ── deterministic shutdown ──────────────────────────────────────
        // (1) wait for the readers
        for reader in readers {
            let _ = reader.await;
        }
        info!("all readers finished");

        // (2)+(3) one sentinel per embed worker; FIFO ordering means every
        // accepted chunk precedes its sentinel, so the queue drains first
        for _ in 0..cfg.num_embed_workers {
            let _ = chunk_tx.send(None).await;
        }
        drop(chunk_tx);

        // (4) wait for the embed workers
        for worker in embed_workers {
            let _ = worker.await;
        }
        info!("all embed workers finished");

        // (5) single sentinel for the writer; it forwards one to the
        // aggregator after flushing
        let _ = vector_tx.send(None).await;
        drop(vector_tx);

        // (6)+(7) bounded drain, then cancel and await the cancellation
        let drained = tokio::time::timeout(cfg.shutdown_timeout, async {
            let _ = (&mut writer).await;
            let _ = (&mut aggregator).await;
        })
        .await;

        match drained {
            Ok(()) => info!("writer and aggregator drained"),
            Err(_) => {
                warn!("drain timeout; cancelling writer and aggregator");
                writer.abort();
                aggregator.abort();
                let _ = writer.await;
                let _ = aggregator.await;
            }
        }

        feedback.abort();
        let _ = feedback.await;

        let embedded = std::mem::take(&mut *embedded_sink.lock().expect("sink lock"));
        RunOutput {
            metrics: self.metrics.report(),
            embedded,
        }
    }

    fn spawn_embed_worker(
        &self,
        worker_id: usize,
        chunk_rx: Arc<AsyncMutex<mpsc::Receiver<Option<Chunk>>>>,
        vector_tx: mpsc::Sender<Option<Chunk>>,
        chunk_depth: Arc<AtomicUsize>,
        embed_dim: Arc<AtomicUsize>,
    ) -> tokio::task::JoinHandle<()> {
        let client = Arc::clone(&self.embed_client);
        let rate = Arc::clone(&self.rate);
        let flow = Arc::clone(&self.flow);
        let metrics = Arc::clone(&self.metrics);
        let cfg = self.config.clone();

        tokio::spawn(async move {
            'outer: loop {
                // block for the first chunk of a batch
                let first = { chunk_rx.lock().await.recv().await };
                let mut batch = match first {
                    None | Some(None) => break,
                    Some(Some(chunk)) => {
                        chunk_depth.fetch_sub(1, Ordering::Relaxed);
                        vec![chunk]
                    }
                };

                // fill the batch until full or the flush deadline passes
                let deadline = Instant::now() + cfg.embed_flush_interval;
                let mut saw_sentinel = false;
                while batch.len() < cfg.embed_batch_size {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    let next = {
                        let mut rx = chunk_rx.lock().await;
                        tokio::time::timeout(remaining, rx.recv()).await
                    };
                    match next {
                        Err(_) => break, // flush deadline
                        Ok(None) | Ok(Some(None)) => {
                            saw_sentinel = true;
                            break;
                        }
                        Ok(Some(Some(chunk))) => {
                            chunk_depth.fetch_sub(1, Ordering::Relaxed);
                            batch.push(chunk);
                        }
                    }
                }

                embed_batch(
                    worker_id, &mut batch, &client, &rate, &flow, &metrics, &embed_dim, &cfg,
                )
                .await;
                rate.adjust();

                for chunk in batch.drain(..) {
                    if vector_tx.send(Some(chunk)).await.is_err() {
                        break 'outer;
                    }
                }

                if saw_sentinel {
                    break;
                }
            }
        })
    }

    fn spawn_db_writer(
        &self,
        mut vector_rx: mpsc::Receiver<Option<Chunk>>,
        minister_tx: mpsc::Sender<Option<Chunk>>,
        embedded_sink: Arc<std::sync::Mutex<Vec<Chunk>>>,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let batch_size = self.config.db_batch_size;

        tokio::spawn(async move {
            let mut batch: Vec<Chunk> = Vec::with_capacity(batch_size);

            loop {
                let item = vector_rx.recv().await;
                let done = matches!(item, None | Some(None));
                if let Some(Some(chunk)) = item {
                    batch.push(chunk);
                }

                if batch.len() >= batch_size || (done && !batch.is_empty()) {
                    let started = Instant::now();
                    let records: Vec<NewRecord> = batch
                        .iter()
                        .map(|c| NewRecord {
                            domain: c.domain,
                            category: c.category,
                            text: c.text.clone(),
                            embedding: c.embedding.clone().unwrap_or_default(),
                            source_book: Some(c.source_book.clone()),
                            source_chapter: Some(c.source_chapter),
                            weight: 1.0,
                        })
                        .collect();

                    if let Err(e) = store.insert_combined_batch(records.clone()).await {
                        warn!("combined batch insert failed: {e}");
                        metrics.record_error();
                    }
                    if let Err(e) = store.insert_domain_batch(records).await {
                        warn!("domain batch insert failed: {e}");
                        metrics.record_error();
                    }
                    metrics.record_db(started.elapsed().as_secs_f64());

                    embedded_sink
                        .lock()
                        .expect("sink lock")
                        .extend(batch.iter().cloned());
                    for chunk in batch.drain(..) {
                        if minister_tx.send(Some(chunk)).await.is_err() {
                            return;
                        }
                    }
                }

                if done {
                    let _ = minister_tx.send(None).await;
                    return;
                }
            }
        })
    }

    fn spawn_aggregator(
        &self,
        mut minister_rx: mpsc::Receiver<Option<Chunk>>,
    ) -> tokio::task::JoinHandle<()> {
        let minister = Arc::clone(&self.minister);
        let metrics = Arc::clone(&self.metrics);
        let flush_threshold = self.config.minister_flush_threshold;

        tokio::spawn(async move {
            let mut buffers: BTreeMap<Domain, Vec<Chunk>> = BTreeMap::new();

            loop {
                let item = minister_rx.recv().await;
                match item {
                    Some(Some(chunk)) => {
                        let domain = chunk.domain;
                        let buffer = buffers.entry(domain).or_default();
                        buffer.push(chunk);
                        if buffer.len() >= flush_threshold {
                            let chunks = std::mem::take(buffer);
                            flush_domain(&minister, &metrics, domain, chunks);
                        }
                    }
                    None | Some(None) => {
                        for (domain, chunks) in std::mem::take(&mut buffers) {
                            if !chunks.is_empty() {
                                flush_domain(&minister, &metrics, domain, chunks);
                            }
                        }
                        return;
                    }
                }
            }
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn embed_batch(
    worker_id: usize,
    batch: &mut [Chunk],
    client: &Arc<dyn LlmService>,
    rate: &Arc<AdaptiveRateController>,
    flow: &Arc<FlowController>,
    metrics: &Arc<IngestMetrics>,
    embed_dim: &Arc<AtomicUsize>,
    cfg: &OrchestratorConfig,
) {
    if batch.is_empty() {
        return;
    }

    flow.acquire(batch.len() as f64).await;
    let permit = rate.acquire().await;

    let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
    let mut transient_attempts = 0u32;
    let mut backoff_attempt = 0u32;

    let vectors = loop {
        let started = Instant::now();
        match client.embed_batch(&texts, cfg.embed_timeout).await {
            Ok(vectors) => {
                let latency = started.elapsed().as_secs_f64();
                rate.record_success(latency);
                metrics.record_embed(latency);
                if let Some(v) = vectors.iter().find(|v| !v.is_empty()) {
                    embed_dim.store(v.len(), Ordering::Relaxed);
                }
                break Some(vectors);
            }
            Err(LlmError::RateLimited) => {
                metrics.record_rate_limit();
                rate.record_rate_limit();
                backoff_attempt += 1;
                warn!("worker {worker_id}: rate limited, backoff attempt {backoff_attempt}");
                if backoff_attempt > 10 {
                    break None;
                }
                rate.sleep_backoff(backoff_attempt).await;
            }
            Err(e) if e.is_transient() => {
                transient_attempts += 1;
                warn!(
                    "worker {worker_id}: transient embed failure ({e}), attempt {transient_attempts}"
                );
                if transient_attempts >= cfg.max_batch_retries {
                    break None;
                }
                rate.sleep_backoff(transient_attempts).await;
            }
            Err(e) => {
                warn!("worker {worker_id}: embed failed: {e}");
                break None;
            }
        }
    };

    drop(permit);

    match vectors {
        Some(vectors) => {
            for (chunk, vector) in batch.iter_mut().zip(vectors) {
                chunk.embedding = Some(vector);
            }
            metrics.record_processed(batch.len());
        }
        None => {
            // persistent failure: zero-vector sentinels, counted as errors
            let dim = match embed_dim.load(Ordering::Relaxed) {
                0 => DEFAULT_EMBED_DIM,
                d => d,
            };
            for chunk in batch.iter_mut() {
                chunk.embedding = Some(vec![0.0; dim]);
            }
            metrics.record_error();
            metrics.record_processed(batch.len());
        }
    }
}

fn flush_domain(
    minister: &Arc<MinisterWriter>,
    metrics: &Arc<IngestMetrics>,
    domain: Domain,
    chunks: Vec<Chunk>,
) {
    let started = Instant::now();
    let by_category: BTreeMap<Category, Vec<&Chunk>> =
        chunks.iter().fold(BTreeMap::new(), |mut acc, chunk| {
            acc.entry(chunk.category).or_default().push(chunk);
            acc
        });

    for (category, group) in by_category {
        let entries: Vec<(String, String, usize, f32)> = group
            .iter()
            .map(|c| (c.text.clone(), c.source_book.clone(), c.source_chapter, 1.0))
            .collect();
        if let Err(e) = minister.add_category_entries(domain, category, &entries) {
            warn!("minister flush failed for {domain}/{category}: {e}");
            metrics.record_error();
        }
    }
    metrics.record_minister(started.elapsed().as_secs_f64());
}

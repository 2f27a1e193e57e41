//! Per-chapter doctrine extraction.
//!
//! One LLM call per chunk of chapter text, with chunk-level checkpointing:
//! completed chunk parses are persisted before aggregation, so a chapter
//! that dies mid-extraction resumes where it stopped or is reconstructed
//! from whatever parsed. Chapters flow through a small worker pool under
//! the adaptive rate controller; results are reassembled in chapter order.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::normalize;
use super::Doctrine;
use crate::checkpoint::CheckpointStore;
use crate::error::IngestError;
use crate::llm::{generate_json, prompts, LlmService};
use crate::pipeline::metrics::IngestMetrics;
use crate::pipeline::rate::AdaptiveRateController;
use crate::segment::Chapter;
use crate::text::{chunk_text, MAX_CHUNK_CHARS};

/// Per-chunk LLM timeout.
const CHUNK_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of extracting one chapter. `failed` marks chapters whose doctrine
/// could not be produced at all (not even from checkpoints).
#[derive(Debug)]
pub struct ExtractionOutcome {
    pub doctrine: Doctrine,
    pub failed: bool,
}

pub struct DoctrineExtractor {
    client: Arc<dyn LlmService>,
    checkpoints: Arc<Mutex<CheckpointStore>>,
}

impl DoctrineExtractor {
    pub fn new(client: Arc<dyn LlmService>, checkpoints: Arc<Mutex<CheckpointStore>>) -> Self {
        Self { client, checkpoints }
    }

    /// Extract doctrine for one chapter.
    ///
    /// Individual chunk failures are logged and skipped; the chapter fails
    /// only when no chunk parses at all.
    pub async fn extract<F>(&self, chapter: &Chapter, mut on_chunk: F) -> Result<Doctrine, IngestError>
    where
        F: FnMut(usize, usize),
    {
        let chunks = chunk_text(&chapter.raw_text, MAX_CHUNK_CHARS);
        let total = chunks.len();
        let mut parsed: Vec<Value> = Vec::with_capacity(total);
        let mut failures = 0usize;

        for (index, chunk) in chunks.iter().enumerate() {
            on_chunk(index + 1, total);

            let cached = {
                let store = self.checkpoints.lock().expect("checkpoint lock");
                store.get(&chapter.chapter_id, index).cloned()
            };
            if let Some(value) = cached {
                parsed.push(value);
                continue;
            }

            let user_prompt = prompts::doctrine_user_prompt(chunk);
            match generate_json(
                self.client.as_ref(),
                prompts::DOCTRINE_SYSTEM_PROMPT,
                &user_prompt,
                CHUNK_TIMEOUT,
            )
            .await
            {
                Ok(value) => {
                    let mut store = self.checkpoints.lock().expect("checkpoint lock");
                    if let Err(e) = store.put(&chapter.chapter_id, index, value.clone()) {
                        warn!("checkpoint write failed for chapter {}: {e}", chapter.chapter_index);
                    }
                    parsed.push(value);
                }
                Err(e) => {
                    warn!(
                        "chunk {}/{} failed for chapter {}: {e}",
                        index + 1,
                        total,
                        chapter.chapter_index
                    );
                    failures += 1;
                }
            }
        }

        if !chunks.is_empty() && parsed.is_empty() {
            return Err(IngestError::ExtractionFailed {
                chapter_index: chapter.chapter_index,
                cause: format!("all {failures} chunks failed"),
            });
        }

        Ok(normalize::from_chunks(chapter, &parsed))
    }

    /// Rebuild a partial doctrine from checkpointed chunk parses after a
    /// chapter-level failure. Returns `None` when nothing was checkpointed.
    pub fn reconstruct_from_checkpoint(&self, chapter: &Chapter) -> Option<Doctrine> {
        let chunks = {
            let store = self.checkpoints.lock().expect("checkpoint lock");
            store.completed_chunks(&chapter.chapter_id)
        };
        if chunks.is_empty() {
            return None;
        }
        info!(
            "reconstructed chapter {} doctrine from {} checkpointed chunks",
            chapter.chapter_index,
            chunks.len()
        );
        Some(normalize::from_chunks(chapter, &chunks))
    }
}

/// Run doctrine extraction for all chapters through a worker pool.
///
/// Workers pull chapters from a queue (terminated with one sentinel per
/// worker), hold a rate-controller permit per chapter, and push indexed
/// results; the results are reassembled in chapter order so downstream
/// artifact writes are deterministic.
pub async fn run_extraction(
    chapters: &[Chapter],
    client: Arc<dyn LlmService>,
    checkpoints: Arc<Mutex<CheckpointStore>>,
    rate: Arc<AdaptiveRateController>,
    metrics: Arc<IngestMetrics>,
    num_workers: usize,
    on_progress: impl Fn(usize, usize, usize) + Send + Sync + 'static,
) -> Vec<ExtractionOutcome> {
    if chapters.is_empty() {
        return vec![];
    }

    let num_workers = num_workers.max(1);
    let (chapter_tx, chapter_rx) = mpsc::channel::<Option<Chapter>>(chapters.len() + num_workers);
    let (result_tx, mut result_rx) = mpsc::channel::<(usize, ExtractionOutcome)>(chapters.len());
    let chapter_rx = Arc::new(tokio::sync::Mutex::new(chapter_rx));
    let on_progress = Arc::new(on_progress);

    let mut workers = Vec::with_capacity(num_workers);
    for worker_id in 0..num_workers {
        let chapter_rx = Arc::clone(&chapter_rx);
        let result_tx = result_tx.clone();
        let client = Arc::clone(&client);
        let checkpoints = Arc::clone(&checkpoints);
        let rate = Arc::clone(&rate);
        let metrics = Arc::clone(&metrics);
        let on_progress = Arc::clone(&on_progress);

        workers.push(tokio::spawn(async move {
            loop {
                let next = { chapter_rx.lock().await.recv().await };
                let Some(Some(chapter)) = next else {
                    // channel closed or sentinel received
                    break;
                };

                let permit = rate.acquire().await;
                let started = Instant::now();
                let extractor = DoctrineExtractor::new(Arc::clone(&client), Arc::clone(&checkpoints));

                let chapter_index = chapter.chapter_index;
                let progress = Arc::clone(&on_progress);
                let outcome = match extractor
                    .extract(&chapter, move |chunk, total| {
                        (*progress)(chapter_index, chunk, total)
                    })
                    .await
                {
                    Ok(doctrine) => {
                        rate.record_success(started.elapsed().as_secs_f64());
                        metrics.record_processed(1);
                        ExtractionOutcome { doctrine, failed: false }
                    }
                    Err(e) => {
                        warn!("worker {worker_id}: {e}");
                        metrics.record_error();
                        match extractor.reconstruct_from_checkpoint(&chapter) {
                            Some(doctrine) => ExtractionOutcome { doctrine, failed: false },
                            None => ExtractionOutcome {
                                doctrine: Doctrine::empty(
                                    chapter.chapter_index,
                                    chapter.chapter_title.clone(),
                                ),
                                failed: true,
                            },
                        }
                    }
                };
                drop(permit);

                if metrics.processed() % 5 == 0 {
                    rate.adjust();
                }

                if result_tx.send((chapter_index, outcome)).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(result_tx);

    for chapter in chapters {
        let _ = chapter_tx.send(Some(chapter.clone())).await;
    }
    for _ in 0..num_workers {
        let _ = chapter_tx.send(None).await;
    }

    let mut results: Vec<Option<ExtractionOutcome>> = Vec::new();
    results.resize_with(chapters.len() + 1, || None);
    while let Some((index, outcome)) = result_rx.recv().await {
        if index < results.len() {
            results[index] = Some(outcome);
        }
    }

    for worker in workers {
        let _ = worker.await;
    }

    chapters
        .iter()
        .map(|chapter| {
            results[chapter.chapter_index].take().unwrap_or_else(|| {
                warn!("missing extraction result for chapter {}", chapter.chapter_index);
                ExtractionOutcome {
                    doctrine: Doctrine::empty(chapter.chapter_index, chapter.chapter_title.clone()),
                    failed: true,
                }
            })
        })
        .collect()
}

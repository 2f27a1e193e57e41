//! Pipeline driver: phase sequencing, resume, and cleanup for one book.
//!
//! Artifacts land in `<storage_root>/<book>/` in phase order; each phase is
//! skipped on resume when its artifact already exists. A book aborts only
//! when the PDF is unreadable or every chapter fails doctrine extraction.
//! Phase 2.5 and 3.5 failures are logged to error files and never fail the
//! book.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::doctrine::{self, extractor, Doctrine, DoctrineMeta, DoctrineStatus};
use crate::domain::Domain;
use crate::error::IngestError;
use crate::extract::{self, repair::GlyphRepairer};
use crate::llm::{ollama::OllamaClient, LlmService};
use crate::memory::MemoryStore;
use crate::minister::MinisterWriter;
use crate::nodes::{self, EmbeddedNode, NodeMetadata};
use crate::pipeline::metrics::IngestMetrics;
use crate::pipeline::orchestrator::{ChunkPayload, IngestOrchestrator, OrchestratorConfig};
use crate::pipeline::rate::{AdaptiveRateController, FlowConfig, FlowController, RateControllerConfig};
use crate::progress::{self, Phase};
use crate::scoring::{self, Event};
use crate::segment::{self, ChapterSegmenter, Chapter};
use crate::store::{file::FileVectorStore, Category, VectorStore};
use crate::text;

/// Below this canonical length a single-chapter streaming result is
/// plausible and the heading fallback stays off.
const SINGLE_CHAPTER_FALLBACK_MIN_CHARS: usize = 10_000;

const RAW_FILE: &str = "00_raw.txt";
const CANONICAL_FILE: &str = "00_canonical_text.txt";
const REPAIRED_FILE: &str = "00_raw_repaired.txt";
const CHAPTERS_FILE: &str = "01_chapters.json";
const DOCTRINE_FILE: &str = "02_doctrine.json";
const DOCTRINE_ERRORS_FILE: &str = "02_doctrine_errors.log";
const MINISTERS_INDEX_FILE: &str = "ministers_index.json";
const NODES_CHUNKS_FILE: &str = "03_nodes_chunks.json";
const EMBEDDINGS_FILE: &str = "03_embeddings.json";
const CONVERSION_FILE: &str = "03_5_minister_conversion.json";
const CONVERSION_ERRORS_FILE: &str = "03_5_minister_errors.log";

/// Everything one ingest run needs: configuration, one LLM client per model
/// role, and the shared stores.
pub struct IngestContext {
    pub config: Config,
    extract_client: Arc<dyn LlmService>,
    doctrine_client: Arc<dyn LlmService>,
    embed_client: Arc<dyn LlmService>,
    glyph_client: Arc<dyn LlmService>,
    store: Arc<dyn VectorStore>,
    memory: Arc<MemoryStore>,
}

impl IngestContext {
    pub fn from_config(config: Config) -> Result<Self, IngestError> {
        let base = &config.models.base_url;
        if config.db_dsn.is_some() {
            // a DSN-backed store would plug in here; until then the
            // file-backed store honors the same contract
            info!("DB_DSN set but only the file-backed vector store is built in; using it");
        }
        let store = Arc::new(FileVectorStore::open(&config.data_root)?);
        let memory = Arc::new(MemoryStore::open(&config.data_root));

        Ok(Self {
            extract_client: Arc::new(OllamaClient::new(base, &config.models.extract)),
            doctrine_client: Arc::new(OllamaClient::new(base, &config.models.doctrine)),
            embed_client: Arc::new(OllamaClient::new(base, &config.models.embed)),
            glyph_client: Arc::new(OllamaClient::new(base, &config.models.glyph_repair)),
            store,
            memory,
            config,
        })
    }

    /// Construction seam for tests: inject stub services and stores.
    pub fn with_services(
        config: Config,
        extract_client: Arc<dyn LlmService>,
        doctrine_client: Arc<dyn LlmService>,
        embed_client: Arc<dyn LlmService>,
        glyph_client: Arc<dyn LlmService>,
        store: Arc<dyn VectorStore>,
        memory: Arc<MemoryStore>,
    ) -> Self {
        Self {
            config,
            extract_client,
            doctrine_client,
            embed_client,
            glyph_client,
            store,
            memory,
        }
    }

    /// Ingest every PDF in a folder. Per-book failures are logged; the
    /// folder run continues.
    pub async fn ingest_folder(&self, folder: &Path, fresh: bool) -> Result<(), IngestError> {
        let mut pdfs: Vec<PathBuf> = walkdir::WalkDir::new(folder)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
            })
            .collect();
        pdfs.sort();

        if pdfs.is_empty() {
            info!("no PDFs found in {}", folder.display());
            return Ok(());
        }

        info!("found {} PDFs in {}", pdfs.len(), folder.display());
        for (i, pdf) in pdfs.iter().enumerate() {
            info!("({}/{}) processing {}", i + 1, pdfs.len(), pdf.display());
            if let Err(e) = self.ingest(pdf, !fresh).await {
                warn!("ingest failed for {}: {e}", pdf.display());
            }
        }
        Ok(())
    }

    /// Ingest one book. Idempotent when `resume` is true.
    pub async fn ingest(&self, pdf_path: &Path, resume: bool) -> Result<(), IngestError> {
        let storage = self.config.book_storage(pdf_path);
        let book_id = storage
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "book".to_string());
        fs::create_dir_all(&storage)?;

        if resume && is_ingest_completed(&storage) {
            info!("skipping {book_id}: already completed");
            return Ok(());
        }

        // ── Phase 0 + 0.5: PDF extraction and glyph repair ──────────────
        // with chapters and canonical text already on disk, resume skips
        // the decoder entirely
        let canonical_path = storage.join(CANONICAL_FILE);
        let chapters_cached = resume && storage.join(CHAPTERS_FILE).exists();

        let (pages, raw): (Vec<String>, String) = if chapters_cached && canonical_path.exists() {
            progress::live_progress(
                &storage,
                Phase::Extraction,
                "Using cached extraction (resume)",
                None,
                None,
            );
            (vec![], fs::read_to_string(&canonical_path)?)
        } else {
            progress::live_progress(&storage, Phase::Extraction, "Starting PDF extraction", None, None);
            let pdf_path_owned = pdf_path.to_path_buf();
            let pages =
                tokio::task::spawn_blocking(move || extract::extract_pages(&pdf_path_owned))
                    .await
                    .map_err(|e| {
                        IngestError::CriticalIngestFailure(format!("extraction task died: {e}"))
                    })??;
            let mut raw = extract::canonical(&pages);

            let repaired_path = storage.join(REPAIRED_FILE);
            if resume && repaired_path.exists() {
                if let Ok(cached) = fs::read_to_string(&repaired_path) {
                    raw = cached;
                    progress::live_progress(
                        &storage,
                        Phase::GlyphRepair,
                        "Using cached repaired text (resume)",
                        None,
                        None,
                    );
                }
            } else if text::looks_glyph_encoded(&raw) {
                let repairer =
                    GlyphRepairer::new(Arc::clone(&self.glyph_client), &self.config.cache_root);
                let storage_for_progress = storage.clone();
                raw = repairer
                    .repair(&raw, move |current, total| {
                        progress::live_progress(
                            &storage_for_progress,
                            Phase::GlyphRepair,
                            "Repairing glyph text",
                            Some(current),
                            Some(total),
                        );
                    })
                    .await;
                fs::write(&repaired_path, &raw)?;
                progress::live_progress(
                    &storage,
                    Phase::GlyphRepair,
                    "Glyph repair completed",
                    None,
                    None,
                );
            }

            fs::write(storage.join(RAW_FILE), &raw)?;
            fs::write(&canonical_path, &raw)?;
            progress::live_progress(&storage, Phase::Extraction, "PDF extraction completed", None, None);
            (pages, raw)
        };

        // ── Phase 1: chapter split ──────────────────────────────────────
        progress::live_progress(&storage, Phase::ChapterSplit, "Chapter split started", None, None);
        let chapters_path = storage.join(CHAPTERS_FILE);
        let chapters: Vec<Chapter> = if resume && chapters_path.exists() {
            load_json(&chapters_path)?
        } else {
            let segmenter = ChapterSegmenter::new(self.extract_client.as_ref(), &self.config.cache_root);
            let storage_for_progress = storage.clone();
            let total_pages = pages.len();
            let mut chapters = segmenter
                .split(&pages, &book_id, move |page, _| {
                    progress::live_progress(
                        &storage_for_progress,
                        Phase::ChapterSplit,
                        &format!("Chapter split: page {page}/{total_pages}"),
                        Some(page),
                        Some(total_pages),
                    );
                })
                .await;

            if chapters.len() == 1 && raw.chars().count() > SINGLE_CHAPTER_FALLBACK_MIN_CHARS {
                let fallback = segment::fallback_split_by_headings(&raw);
                if fallback.len() > 1 {
                    info!("heading fallback produced {} chapters", fallback.len());
                    chapters = fallback;
                }
            }

            save_json(&chapters_path, &chapters)?;
            chapters
        };
        progress::live_progress(
            &storage,
            Phase::ChapterSplit,
            "Chapter split completed",
            Some(chapters.len()),
            Some(chapters.len()),
        );

        // ── Phase 2: doctrine extraction ────────────────────────────────
        progress::live_progress(&storage, Phase::DoctrineExtraction, "Doctrine extraction started", None, None);
        let doctrine_path = storage.join(DOCTRINE_FILE);
        let checkpoints = Arc::new(Mutex::new(CheckpointStore::open(&storage)));

        let doctrines: Vec<Doctrine> = if resume && doctrine_path.exists() {
            load_json(&doctrine_path)?
        } else {
            let rate = Arc::new(AdaptiveRateController::new(RateControllerConfig {
                initial_concurrency: self.config.doctrine_workers.min(2),
                max_concurrency: self.config.doctrine_workers.max(1),
                min_concurrency: 1,
                ..Default::default()
            }));
            let metrics = Arc::new(IngestMetrics::new());
            let storage_for_progress = storage.clone();

            let outcomes = extractor::run_extraction(
                &chapters,
                Arc::clone(&self.doctrine_client),
                Arc::clone(&checkpoints),
                rate,
                metrics,
                self.config.doctrine_workers,
                move |chapter_index, chunk, total| {
                    progress::live_progress(
                        &storage_for_progress,
                        Phase::DoctrineExtraction,
                        &format!("Extracting doctrine (chapter {chapter_index})"),
                        Some(chunk),
                        Some(total),
                    );
                },
            )
            .await;

            let failed: Vec<usize> = outcomes
                .iter()
                .filter(|o| o.failed)
                .map(|o| o.doctrine.chapter_index)
                .collect();
            if failed.len() == chapters.len() {
                return Err(IngestError::CriticalIngestFailure(
                    "all chapters failed doctrine extraction".into(),
                ));
            }
            if !failed.is_empty() {
                warn!("completed with {}/{} extraction failures", failed.len(), chapters.len());
            }

            let mut doctrines: Vec<Doctrine> = outcomes
                .into_iter()
                .map(|outcome| {
                    let mut doctrine = outcome.doctrine;
                    if outcome.failed {
                        doctrine.meta = Some(failed_meta());
                    }
                    doctrine
                })
                .collect();

            {
                let checkpoints = checkpoints.lock().expect("checkpoint lock");
                doctrine::enrich(&mut doctrines, &chapters, &checkpoints);
            }
            save_json(&doctrine_path, &doctrines)?;
            doctrines
        };

        // ── Phase 2.5: minister memories stub ───────────────────────────
        progress::live_progress(&storage, Phase::MinisterMemories, "Building minister memories", None, None);
        if let Err(e) = save_json(
            &storage.join(MINISTERS_INDEX_FILE),
            &serde_json::json!({
                "book_meta": {"title": book_id},
                "count": doctrines.len(),
            }),
        ) {
            append_log(&storage.join(DOCTRINE_ERRORS_FILE), &format!("Phase 2.5 error: {e}"));
        }
        progress::live_progress(
            &storage,
            Phase::DoctrineExtraction,
            "Doctrine extraction completed",
            Some(chapters.len()),
            Some(chapters.len()),
        );

        // ── Phase 3: embeddings ─────────────────────────────────────────
        progress::live_progress(&storage, Phase::Embedding, "Embedding started", None, None);
        let all_nodes: Vec<nodes::Node> = doctrines
            .iter()
            .flat_map(|d| nodes::to_nodes(d, &book_id.to_uppercase()))
            .collect();
        let embeddable: Vec<&nodes::Node> = all_nodes
            .iter()
            .filter(|n| n.node_type.is_embeddable())
            .collect();

        let payloads: Vec<ChunkPayload> = embeddable
            .iter()
            .map(|n| {
                let mut metadata = BTreeMap::new();
                metadata.insert("node_id".to_string(), serde_json::json!(n.node_id));
                metadata.insert("node_type".to_string(), serde_json::json!(n.node_type));
                ChunkPayload {
                    text: n.text.clone(),
                    domain: n
                        .metadata
                        .domain
                        .map(|d| d.as_str().to_string())
                        .unwrap_or_else(|| Domain::Base.as_str().to_string()),
                    category: node_category(n.node_type).as_str().to_string(),
                    source_book: book_id.clone(),
                    source_chapter: n.metadata.chapter,
                    metadata,
                }
            })
            .collect();
        let nodes_chunks_path = storage.join(NODES_CHUNKS_FILE);
        save_json(&nodes_chunks_path, &payloads)?;

        let orchestrator = IngestOrchestrator::new(
            OrchestratorConfig {
                num_embed_workers: self.config.embed_workers,
                ..Default::default()
            },
            Arc::clone(&self.embed_client),
            Arc::clone(&self.store),
            // book-local aggregation; global consolidation happens in 3.5
            Arc::new(MinisterWriter::new(&storage)),
            Arc::new(AdaptiveRateController::new(RateControllerConfig::default())),
            Arc::new(FlowController::new(FlowConfig::default())),
        );
        let output = orchestrator.run(vec![nodes_chunks_path]).await;

        let embedded_nodes: Vec<EmbeddedNode> = output
            .embedded
            .iter()
            .map(|chunk| {
                let node_id = chunk
                    .metadata
                    .get("node_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| chunk.id.to_string());
                let node_type = chunk
                    .metadata
                    .get("node_type")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or(nodes::NodeType::Claim);
                EmbeddedNode {
                    embedding_id: format!("emb-{node_id}"),
                    node_id,
                    node_type,
                    text: chunk.text.clone(),
                    vector: chunk.embedding.clone().unwrap_or_default(),
                    metadata: NodeMetadata {
                        chapter: chunk.source_chapter,
                        domain: Some(chunk.domain),
                        confidence: None,
                        abstracted_from: None,
                    },
                }
            })
            .collect();

        save_json(
            &storage.join(EMBEDDINGS_FILE),
            &serde_json::json!({
                "pipeline_metrics": output.metrics,
                "embeddings": embedded_nodes,
            }),
        )?;
        progress::live_progress(
            &storage,
            Phase::Embedding,
            "Embedding completed",
            Some(embedded_nodes.len()),
            Some(embedded_nodes.len().max(1)),
        );

        // ── Phase 3.5: minister conversion ──────────────────────────────
        progress::live_progress(&storage, Phase::MinisterConversion, "Converting doctrine to minister structure", None, None);
        let conversion = (|| -> Result<(), IngestError> {
            let minister = MinisterWriter::new(&self.config.data_root);
            let summary = minister.convert_all(&doctrines, &book_id);
            minister.update_combined_index(&self.config.data_root)?;
            save_json(&storage.join(CONVERSION_FILE), &summary)?;
            progress::live_progress(
                &storage,
                Phase::MinisterConversion,
                &format!(
                    "Minister conversion completed: {} entries created",
                    summary.total_entries_created
                ),
                Some(1),
                Some(1),
            );
            Ok(())
        })();
        if let Err(e) = conversion {
            append_log(&storage.join(CONVERSION_ERRORS_FILE), &format!("Phase 3.5 error: {e}"));
            warn!("minister conversion failed for {book_id}: {e}");
        }

        // ── Phase 4–8: scoring and memory commits ───────────────────────
        progress::live_progress(&storage, Phase::MemoryCommit, "Scoring and committing memories", None, None);
        let events: Vec<Event> = embedded_nodes
            .iter()
            .map(|n| Event {
                embedding: n.vector.clone(),
                raw_text: n.text.clone(),
                domain: n.metadata.domain,
                category: node_category(n.node_type),
                entities: vec![],
            })
            .collect();
        let committed = scoring::commit_events(
            &events,
            &self.memory,
            self.store.as_ref(),
            self.config.mission_vector.as_deref(),
            &self.config.scoring,
            &book_id,
        )
        .await;
        info!("committed {} memories for {book_id}", committed.len());

        // ── Done ────────────────────────────────────────────────────────
        progress::live_progress(&storage, Phase::Completed, "Ingestion finished", Some(100), Some(100));
        clear_cache(&self.config.cache_root);
        info!("ingest completed for {book_id}");
        Ok(())
    }
}

fn node_category(node_type: nodes::NodeType) -> Category {
    match node_type {
        nodes::NodeType::Principle => Category::Principles,
        nodes::NodeType::Rule => Category::Rules,
        nodes::NodeType::Warning => Category::Warnings,
        nodes::NodeType::Claim => Category::Claims,
    }
}

fn failed_meta() -> DoctrineMeta {
    DoctrineMeta {
        status: DoctrineStatus::ExtractionFailed,
        chapter_type: doctrine::ChapterType::Commentary,
        reason: Some("extraction failed".into()),
        doctrine_density: 0.0,
        extracted_chunks: 0,
        model_confidence: doctrine::ModelConfidence::Low,
    }
}

/// Fast-skip check: completed progress marker or the final artifact.
fn is_ingest_completed(storage: &Path) -> bool {
    if let Some(record) = progress::load_progress(storage)
        && record.is_completed()
    {
        return true;
    }
    storage.join(EMBEDDINGS_FILE).exists()
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, IngestError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), IngestError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).map_err(|source| IngestError::DiskWriteFailed {
        path: path.to_path_buf(),
        source,
    })
}

fn append_log(path: &Path, line: &str) {
    use std::io::Write;
    if let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{line}");
    }
}

/// Clear cache contents after a completed ingest, tolerant of concurrent
/// recreation.
fn clear_cache(cache_root: &Path) {
    let Ok(entries) = fs::read_dir(cache_root) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if result.is_err() {
            warn!("failed to clear cache entry {}", path.display());
        }
    }
    let _ = fs::remove_dir(cache_root);
}

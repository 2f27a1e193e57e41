//! Post-embedding scoring and memory commits.
//!
//! Every embedded node is scored on relevance, novelty, emotional weight,
//! and strategic weight; the weighted composite routes it through the
//! decision gate to a memory tier (or drops it). Global commits trigger a
//! doctrine-diff against stored beliefs and a reinforcement pass.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::Domain;
use crate::error::IngestError;
use crate::memory::{MemoryRecord, MemoryStore, MemoryTier};
use crate::store::{cosine, Category, NewRecord, VectorStore};

/// Scoring weights and gate thresholds. The defaults mirror the calibrated
/// production values; they are configuration, not constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub relevance_weight: f64,
    pub novelty_weight: f64,
    pub emotional_weight: f64,
    pub strategic_weight: f64,
    pub drop_threshold: f64,
    pub session_threshold: f64,
    pub project_threshold: f64,
    /// Sliding window of committed embeddings used for novelty.
    pub novelty_window: usize,
    pub attention_delta: f64,
    pub entity_delta: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            relevance_weight: 0.4,
            novelty_weight: 0.2,
            emotional_weight: 0.2,
            strategic_weight: 0.2,
            drop_threshold: 0.30,
            session_threshold: 0.55,
            project_threshold: 0.75,
            novelty_window: 50,
            attention_delta: 0.1,
            entity_delta: 0.05,
        }
    }
}

/// A scoreable event: an embedded node plus its provenance.
#[derive(Debug, Clone)]
pub struct Event {
    pub embedding: Vec<f32>,
    pub raw_text: String,
    pub domain: Option<Domain>,
    pub category: Category,
    pub entities: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ScoreBundle {
    pub relevance: f64,
    pub novelty: f64,
    pub emotional_weight: f64,
    pub strategic_weight: f64,
    pub importance: f64,
}

const EMOTION_TOKENS: [&str; 4] = ["fear", "anger", "joy", "sad"];

const STRATEGIC_KEYWORDS: [&str; 7] = [
    "strategy", "plan", "goal", "objective", "mission", "risk", "execute",
];

/// Score one event against the mission vector and the recent-memory window.
pub fn score_event(
    event: &Event,
    memory: &MemoryStore,
    mission_vector: Option<&[f32]>,
    config: &ScoringConfig,
) -> ScoreBundle {
    let relevance = mission_vector
        .map(|m| cosine(&event.embedding, m).max(0.0) as f64)
        .unwrap_or(0.0);

    let max_similarity = memory
        .recent_embeddings(config.novelty_window)
        .iter()
        .map(|r| cosine(&event.embedding, r))
        .fold(0.0f32, f32::max);
    let novelty = 1.0 - max_similarity as f64;

    let lowered = event.raw_text.to_lowercase();
    let emotion_tokens = EMOTION_TOKENS.iter().filter(|t| lowered.contains(*t)).count();
    let exclamation = if event.raw_text.contains('!') { 0.2 } else { 0.0 };
    let emotional = (exclamation + 0.2 * emotion_tokens as f64).min(1.0);

    let strategic_hits = STRATEGIC_KEYWORDS
        .iter()
        .filter(|kw| lowered.contains(*kw))
        .count();
    let strategic = (0.15 * strategic_hits as f64).min(1.0);

    let importance = config.relevance_weight * relevance
        + config.novelty_weight * novelty
        + config.emotional_weight * emotional
        + config.strategic_weight * strategic;

    ScoreBundle {
        relevance,
        novelty,
        emotional_weight: emotional,
        strategic_weight: strategic,
        importance,
    }
}

/// Route an importance score to a memory tier. `None` drops the event.
/// Monotone: higher importance never routes lower.
pub fn decision_gate(importance: f64, config: &ScoringConfig) -> Option<MemoryTier> {
    if importance < config.drop_threshold {
        None
    } else if importance < config.session_threshold {
        Some(MemoryTier::Session)
    } else if importance < config.project_threshold {
        Some(MemoryTier::Project)
    } else {
        Some(MemoryTier::Global)
    }
}

/// Commit a routed event: memory record + embedding, and (when the domain
/// is valid) the combined and per-domain vector indices.
pub async fn commit_event(
    event: &Event,
    scores: &ScoreBundle,
    tier: MemoryTier,
    memory: &MemoryStore,
    vectors: &dyn VectorStore,
    book: &str,
) -> Result<Uuid, IngestError> {
    let memory_id = memory.insert_memory(MemoryRecord {
        id: Uuid::new_v4(),
        content: event.raw_text.clone(),
        memory_type: tier,
        importance_score: scores.importance,
        novelty_score: scores.novelty,
        strategic_weight: scores.strategic_weight,
        emotional_weight: scores.emotional_weight,
        domain: event.domain,
        created_at: chrono::Utc::now(),
    })?;
    memory.insert_embedding(memory_id, event.embedding.clone())?;

    if let Some(domain) = event.domain {
        let record = NewRecord {
            domain,
            category: event.category,
            text: event.raw_text.clone(),
            embedding: event.embedding.clone(),
            source_book: Some(book.to_string()),
            source_chapter: None,
            weight: 1.0,
        };
        if let Err(e) = vectors.insert_combined(record.clone()).await {
            warn!("combined index insert failed: {e}");
        }
        if let Err(e) = vectors.insert_domain(record).await {
            warn!("domain index insert failed: {e}");
        }
    }

    Ok(memory_id)
}

/// Textual contradiction heuristic: a "not" on exactly one side of the
/// pair. A placeholder, kept deliberately simple.
fn contradicts(new_text: &str, belief_text: &str) -> bool {
    let new_has_not = new_text.to_lowercase().contains("not");
    let belief_has_not = belief_text.to_lowercase().contains("not");
    new_has_not != belief_has_not
}

/// For global commits: find stored beliefs the new memory contradicts and
/// queue a pending doctrine patch for each.
pub fn doctrine_diff(memory_id: Uuid, memory: &MemoryStore) -> Result<usize, IngestError> {
    let Some(embedding) = memory.embedding(memory_id) else {
        return Ok(0);
    };
    let Some(record) = memory.memory(memory_id) else {
        return Ok(0);
    };

    let mut patched = 0;
    for belief in memory.retrieve_related_beliefs(&embedding, 20) {
        if contradicts(&record.content, &belief.belief_text) {
            memory.create_doctrine_patch(memory_id, belief.id)?;
            patched += 1;
        }
    }
    if patched > 0 {
        debug!("doctrine diff queued {patched} patches for memory {memory_id}");
    }
    Ok(patched)
}

/// Reinforcement: bump the domain's attention prior and the event's entity
/// weights in proportion to importance.
pub fn reinforce(
    event: &Event,
    scores: &ScoreBundle,
    memory: &MemoryStore,
    config: &ScoringConfig,
) -> Result<(), IngestError> {
    if let Some(domain) = event.domain {
        memory.adjust_attention_prior(domain, config.attention_delta * scores.importance)?;
    }
    memory.adjust_entity_weights(&event.entities, config.entity_delta * scores.importance)?;
    Ok(())
}

/// Retrieval maintenance hook points, run after each commit.
pub fn optimize_retrieval(memory_id: Uuid, memory: &MemoryStore) {
    memory.update_topk_cache(memory_id);
    memory.recompute_cluster_centroids();
    memory.update_memory_salience(memory_id);
}

/// Score and commit a batch of events (Phase 4–8 for one book). Individual
/// event failures are logged and skipped; returns the committed memory ids.
pub async fn commit_events(
    events: &[Event],
    memory: &MemoryStore,
    vectors: &dyn VectorStore,
    mission_vector: Option<&[f32]>,
    config: &ScoringConfig,
    book: &str,
) -> Vec<Uuid> {
    let mut committed = Vec::new();

    for event in events {
        let scores = score_event(event, memory, mission_vector, config);
        let Some(tier) = decision_gate(scores.importance, config) else {
            continue;
        };

        let memory_id = match commit_event(event, &scores, tier, memory, vectors, book).await {
            Ok(id) => id,
            Err(e) => {
                warn!("memory commit failed: {e}");
                continue;
            }
        };

        if tier == MemoryTier::Global
            && let Err(e) = doctrine_diff(memory_id, memory)
        {
            warn!("doctrine diff failed for {memory_id}: {e}");
        }
        if let Err(e) = reinforce(event, &scores, memory, config) {
            warn!("reinforcement failed for {memory_id}: {e}");
        }
        optimize_retrieval(memory_id, memory);

        committed.push(memory_id);
    }

    committed
}

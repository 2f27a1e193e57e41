//! Tiered memory store for post-embedding commits.
//!
//! File-backed fallback covering memories, their embeddings, doctrine
//! belief versions, pending doctrine patches, attention priors, and entity
//! weights. A relational backend can replace this behind the same surface.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::Domain;
use crate::error::IngestError;
use crate::store::cosine;

const MEMORY_FILE: &str = "memory_db.json";

/// Storage tier selected by the decision gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemoryTier {
    #[serde(rename = "SESSION_MEMORY")]
    Session,
    #[serde(rename = "PROJECT_MEMORY")]
    Project,
    #[serde(rename = "GLOBAL_MEMORY")]
    Global,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub content: String,
    pub memory_type: MemoryTier,
    pub importance_score: f64,
    pub novelty_score: f64,
    pub strategic_weight: f64,
    pub emotional_weight: f64,
    #[serde(default)]
    pub domain: Option<Domain>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeliefVersion {
    pub id: Uuid,
    pub version_number: u32,
    pub belief_text: String,
    #[serde(default)]
    pub supersedes: Option<Uuid>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctrinePatch {
    pub id: Uuid,
    pub triggering_memory: Uuid,
    pub conflicting_belief: Uuid,
    pub resolution_status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmbeddingEntry {
    memory_id: Uuid,
    vector: Vec<f32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryData {
    memories: BTreeMap<Uuid, MemoryRecord>,
    /// Insertion-ordered, for the sliding novelty window.
    embeddings: Vec<EmbeddingEntry>,
    doctrine_versions: BTreeMap<Uuid, BeliefVersion>,
    doctrine_patches: BTreeMap<Uuid, DoctrinePatch>,
    attention_priors: BTreeMap<Domain, f64>,
    entity_weights: BTreeMap<String, f64>,
}

pub struct MemoryStore {
    path: PathBuf,
    state: Mutex<MemoryData>,
}

impl MemoryStore {
    pub fn open(data_root: &Path) -> Self {
        let path = data_root.join(MEMORY_FILE);
        let state = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    fn persist(&self, state: &MemoryData) -> Result<(), IngestError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(state)?;
        std::fs::write(&self.path, json).map_err(|source| IngestError::DiskWriteFailed {
            path: self.path.clone(),
            source,
        })
    }

    pub fn insert_memory(&self, mut record: MemoryRecord) -> Result<Uuid, IngestError> {
        let mut state = self.state.lock().expect("memory lock");
        if record.id.is_nil() {
            record.id = Uuid::new_v4();
        }
        let id = record.id;
        state.memories.insert(id, record);
        self.persist(&state)?;
        Ok(id)
    }

    pub fn insert_embedding(&self, memory_id: Uuid, vector: Vec<f32>) -> Result<(), IngestError> {
        let mut state = self.state.lock().expect("memory lock");
        state.embeddings.push(EmbeddingEntry { memory_id, vector });
        self.persist(&state)
    }

    pub fn memory(&self, id: Uuid) -> Option<MemoryRecord> {
        self.state.lock().expect("memory lock").memories.get(&id).cloned()
    }

    pub fn embedding(&self, memory_id: Uuid) -> Option<Vec<f32>> {
        let state = self.state.lock().expect("memory lock");
        state
            .embeddings
            .iter()
            .rev()
            .find(|e| e.memory_id == memory_id)
            .map(|e| e.vector.clone())
    }

    /// Last `window` committed embeddings, oldest first.
    pub fn recent_embeddings(&self, window: usize) -> Vec<Vec<f32>> {
        let state = self.state.lock().expect("memory lock");
        let skip = state.embeddings.len().saturating_sub(window);
        state.embeddings[skip..].iter().map(|e| e.vector.clone()).collect()
    }

    #[allow(dead_code)]
    pub fn store_doctrine_version(
        &self,
        belief_text: &str,
        version_number: u32,
        supersedes: Option<Uuid>,
        embedding: Option<Vec<f32>>,
    ) -> Result<Uuid, IngestError> {
        let mut state = self.state.lock().expect("memory lock");
        let id = Uuid::new_v4();
        state.doctrine_versions.insert(
            id,
            BeliefVersion {
                id,
                version_number,
                belief_text: belief_text.to_string(),
                supersedes,
                embedding,
            },
        );
        self.persist(&state)?;
        Ok(id)
    }

    /// Beliefs ranked by similarity to the query embedding. Beliefs without
    /// an embedding rank last (no signal).
    pub fn retrieve_related_beliefs(&self, query: &[f32], topk: usize) -> Vec<BeliefVersion> {
        let state = self.state.lock().expect("memory lock");
        let mut scored: Vec<(f32, &BeliefVersion)> = state
            .doctrine_versions
            .values()
            .map(|b| {
                let score = b
                    .embedding
                    .as_deref()
                    .map(|e| cosine(query, e))
                    .unwrap_or(0.0);
                (score, b)
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.into_iter().take(topk).map(|(_, b)| b.clone()).collect()
    }

    pub fn create_doctrine_patch(
        &self,
        triggering_memory: Uuid,
        conflicting_belief: Uuid,
    ) -> Result<Uuid, IngestError> {
        let mut state = self.state.lock().expect("memory lock");
        let id = Uuid::new_v4();
        state.doctrine_patches.insert(
            id,
            DoctrinePatch {
                id,
                triggering_memory,
                conflicting_belief,
                resolution_status: "pending".into(),
                created_at: Utc::now(),
            },
        );
        self.persist(&state)?;
        Ok(id)
    }

    #[allow(dead_code)]
    pub fn doctrine_patches(&self) -> Vec<DoctrinePatch> {
        self.state
            .lock()
            .expect("memory lock")
            .doctrine_patches
            .values()
            .cloned()
            .collect()
    }

    pub fn adjust_attention_prior(&self, domain: Domain, delta: f64) -> Result<(), IngestError> {
        let mut state = self.state.lock().expect("memory lock");
        *state.attention_priors.entry(domain).or_insert(1.0) += delta;
        self.persist(&state)
    }

    pub fn attention_prior(&self, domain: Domain) -> f64 {
        *self
            .state
            .lock()
            .expect("memory lock")
            .attention_priors
            .get(&domain)
            .unwrap_or(&1.0)
    }

    pub fn adjust_entity_weights(&self, entities: &[String], delta: f64) -> Result<(), IngestError> {
        if entities.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().expect("memory lock");
        for entity in entities {
            *state.entity_weights.entry(entity.clone()).or_insert(1.0) += delta;
        }
        self.persist(&state)
    }

    #[allow(dead_code)]
    pub fn entity_weight(&self, entity: &str) -> f64 {
        *self
            .state
            .lock()
            .expect("memory lock")
            .entity_weights
            .get(entity)
            .unwrap_or(&1.0)
    }

    // Retrieval-maintenance hook points. Deliberately no-ops in the
    // file-backed store; a production backend refreshes caches here.

    pub fn update_topk_cache(&self, _memory_id: Uuid) {}

    pub fn recompute_cluster_centroids(&self) {}

    pub fn update_memory_salience(&self, _memory_id: Uuid) {}
}

//! Pluggable vector store with combined and per-domain indices.
//!
//! Both backends honor the same contract: writes validate the domain
//! against the whitelist (enforced by the `Domain` type at the boundary),
//! similarity is weighted cosine, results come back sorted descending, and
//! the embedding dimension is locked from the first non-zero vector.

pub mod file;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::Domain;
use crate::error::IngestError;

/// Node category, also the consolidation file a node lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Principles,
    Rules,
    Claims,
    Warnings,
    Content,
}

impl Category {
    pub const CONSOLIDATED: [Category; 4] = [
        Category::Principles,
        Category::Rules,
        Category::Claims,
        Category::Warnings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Principles => "principles",
            Category::Rules => "rules",
            Category::Claims => "claims",
            Category::Warnings => "warnings",
            Category::Content => "content",
        }
    }

    pub fn parse(s: &str) -> Category {
        match s.trim().to_lowercase().as_str() {
            "principles" | "principle" => Category::Principles,
            "rules" | "rule" => Category::Rules,
            "claims" | "claim" => Category::Claims,
            "warnings" | "warning" => Category::Warnings,
            _ => Category::Content,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record to insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRecord {
    pub domain: Domain,
    pub category: Category,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub source_book: Option<String>,
    #[serde(default)]
    pub source_chapter: Option<usize>,
    pub weight: f32,
}

/// A stored record as returned from searches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: Uuid,
    pub domain: Domain,
    pub category: Category,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub source_book: Option<String>,
    #[serde(default)]
    pub source_chapter: Option<usize>,
    pub weight: f32,
}

/// Search hit: record plus its weighted-cosine score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredRecord {
    pub score: f32,
    pub record: VectorRecord,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn insert_combined(&self, record: NewRecord) -> Result<Uuid, IngestError>;

    async fn insert_combined_batch(&self, records: Vec<NewRecord>) -> Result<Vec<Uuid>, IngestError>;

    async fn insert_domain(&self, record: NewRecord) -> Result<Uuid, IngestError>;

    async fn insert_domain_batch(&self, records: Vec<NewRecord>) -> Result<Vec<Uuid>, IngestError>;

    /// Search the combined index. Results sorted by `weight * cos` descending.
    async fn search_combined(
        &self,
        query: &[f32],
        topk: usize,
    ) -> Result<Vec<ScoredRecord>, IngestError>;

    /// Search one domain's index. Same ordering contract.
    async fn search_domain(
        &self,
        domain: Domain,
        query: &[f32],
        topk: usize,
    ) -> Result<Vec<ScoredRecord>, IngestError>;
}

/// Cosine similarity. Zero vectors (the "unavailable" sentinel) and length
/// mismatches score 0 — no signal.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// True when the vector is the all-zero "no signal" sentinel.
pub fn is_zero_vector(v: &[f32]) -> bool {
    v.iter().all(|x| *x == 0.0)
}

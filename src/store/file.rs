//! File-backed vector store.
//!
//! The default backend when no `DB_DSN` is configured: all records live in
//! a single JSON file guarded by a mutex, with linear-scan weighted-cosine
//! search. Good enough for local corpora; the trait keeps a relational
//! backend pluggable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{cosine, is_zero_vector, NewRecord, ScoredRecord, VectorRecord, VectorStore};
use crate::domain::Domain;
use crate::error::IngestError;

const STORE_FILE: &str = "vector_db.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    /// Locked from the first non-zero vector; later mismatches are rejected.
    dimension: Option<usize>,
    combined: Vec<VectorRecord>,
    domain: BTreeMap<Domain, Vec<VectorRecord>>,
}

pub struct FileVectorStore {
    path: PathBuf,
    state: Mutex<StoreData>,
}

impl FileVectorStore {
    /// Open (or create) the store under `data_root`.
    pub fn open(data_root: &Path) -> Result<Self, IngestError> {
        let path = data_root.join(STORE_FILE);
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => StoreData::default(),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn check_dimension(state: &mut StoreData, embedding: &[f32]) -> Result<(), IngestError> {
        // the zero vector is the "unavailable" sentinel and never locks or
        // violates the dimension
        if is_zero_vector(embedding) {
            return Ok(());
        }
        match state.dimension {
            None => {
                state.dimension = Some(embedding.len());
                Ok(())
            }
            Some(expected) if expected == embedding.len() => Ok(()),
            Some(expected) => Err(IngestError::DimensionMismatch {
                expected,
                got: embedding.len(),
            }),
        }
    }

    fn persist(&self, state: &StoreData) -> Result<(), IngestError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(state)?;
        std::fs::write(&self.path, json).map_err(|source| IngestError::DiskWriteFailed {
            path: self.path.clone(),
            source,
        })
    }

    fn to_record(record: NewRecord) -> VectorRecord {
        VectorRecord {
            id: Uuid::new_v4(),
            domain: record.domain,
            category: record.category,
            text: record.text,
            embedding: record.embedding,
            source_book: record.source_book,
            source_chapter: record.source_chapter,
            weight: record.weight,
        }
    }

    fn search_records(records: &[VectorRecord], query: &[f32], topk: usize) -> Vec<ScoredRecord> {
        let mut scored: Vec<ScoredRecord> = records
            .iter()
            .map(|r| ScoredRecord {
                score: r.weight * cosine(query, &r.embedding),
                record: r.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(topk);
        scored
    }
}

#[async_trait]
impl VectorStore for FileVectorStore {
    async fn insert_combined(&self, record: NewRecord) -> Result<Uuid, IngestError> {
        let ids = self.insert_combined_batch(vec![record]).await?;
        Ok(ids[0])
    }

    async fn insert_combined_batch(&self, records: Vec<NewRecord>) -> Result<Vec<Uuid>, IngestError> {
        let mut state = self.state.lock().expect("store lock");
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            Self::check_dimension(&mut state, &record.embedding)?;
            let stored = Self::to_record(record);
            ids.push(stored.id);
            state.combined.push(stored);
        }
        self.persist(&state)?;
        Ok(ids)
    }

    async fn insert_domain(&self, record: NewRecord) -> Result<Uuid, IngestError> {
        let ids = self.insert_domain_batch(vec![record]).await?;
        Ok(ids[0])
    }

    async fn insert_domain_batch(&self, records: Vec<NewRecord>) -> Result<Vec<Uuid>, IngestError> {
        let mut state = self.state.lock().expect("store lock");
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            Self::check_dimension(&mut state, &record.embedding)?;
            let stored = Self::to_record(record);
            ids.push(stored.id);
            state.domain.entry(stored.domain).or_default().push(stored);
        }
        self.persist(&state)?;
        Ok(ids)
    }

    async fn search_combined(
        &self,
        query: &[f32],
        topk: usize,
    ) -> Result<Vec<ScoredRecord>, IngestError> {
        let state = self.state.lock().expect("store lock");
        Ok(Self::search_records(&state.combined, query, topk))
    }

    async fn search_domain(
        &self,
        domain: Domain,
        query: &[f32],
        topk: usize,
    ) -> Result<Vec<ScoredRecord>, IngestError> {
        let state = self.state.lock().expect("store lock");
        let records = state.domain.get(&domain).map(Vec::as_slice).unwrap_or(&[]);
        Ok(Self::search_records(records, query, topk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Category;
    use tempfile::tempdir;

    fn record(domain: Domain, text: &str, embedding: Vec<f32>, weight: f32) -> NewRecord {
        NewRecord {
            domain,
            category: Category::Principles,
            text: text.into(),
            embedding,
            source_book: Some("book".into()),
            source_chapter: Some(1),
            weight,
        }
    }

    #[tokio::test]
    async fn test_insert_and_search_combined() {
        let dir = tempdir().unwrap();
        let store = FileVectorStore::open(dir.path()).unwrap();

        store
            .insert_combined(record(Domain::Strategy, "hold ground", vec![1.0, 0.0], 1.0))
            .await
            .unwrap();
        store
            .insert_combined(record(Domain::Risk, "avoid sieges", vec![0.0, 1.0], 1.0))
            .await
            .unwrap();

        let hits = store.search_combined(&[1.0, 0.1], 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.text, "hold ground");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_weight_scales_score() {
        let dir = tempdir().unwrap();
        let store = FileVectorStore::open(dir.path()).unwrap();

        store
            .insert_combined(record(Domain::Strategy, "light", vec![1.0, 0.0], 0.5))
            .await
            .unwrap();
        store
            .insert_combined(record(Domain::Strategy, "heavy", vec![1.0, 0.0], 2.0))
            .await
            .unwrap();

        let hits = store.search_combined(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits[0].record.text, "heavy");
        assert!((hits[0].score - 2.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_domain_index_isolated() {
        let dir = tempdir().unwrap();
        let store = FileVectorStore::open(dir.path()).unwrap();

        store
            .insert_domain(record(Domain::Power, "power text", vec![1.0, 0.0], 1.0))
            .await
            .unwrap();

        let hits = store.search_domain(Domain::Power, &[1.0, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 1);

        let empty = store.search_domain(Domain::Truth, &[1.0, 0.0], 5).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_dimension_locked_from_first_nonzero() {
        let dir = tempdir().unwrap();
        let store = FileVectorStore::open(dir.path()).unwrap();

        // zero vector does not lock the dimension
        store
            .insert_combined(record(Domain::Strategy, "sentinel", vec![0.0; 4], 1.0))
            .await
            .unwrap();
        store
            .insert_combined(record(Domain::Strategy, "first real", vec![0.1, 0.2], 1.0))
            .await
            .unwrap();

        let err = store
            .insert_combined(record(Domain::Strategy, "wrong dim", vec![0.1, 0.2, 0.3], 1.0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::DimensionMismatch { expected: 2, got: 3 }
        ));
    }

    #[tokio::test]
    async fn test_batch_insert_returns_ids_in_order() {
        let dir = tempdir().unwrap();
        let store = FileVectorStore::open(dir.path()).unwrap();

        let ids = store
            .insert_domain_batch(vec![
                record(Domain::Data, "a", vec![1.0], 1.0),
                record(Domain::Timing, "b", vec![0.5], 1.0),
            ])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileVectorStore::open(dir.path()).unwrap();
            store
                .insert_combined(record(Domain::Strategy, "durable", vec![1.0, 0.0], 1.0))
                .await
                .unwrap();
        }
        let store = FileVectorStore::open(dir.path()).unwrap();
        let hits = store.search_combined(&[1.0, 0.0], 1).await.unwrap();
        assert_eq!(hits[0].record.text, "durable");
    }

    #[tokio::test]
    async fn test_topk_truncation() {
        let dir = tempdir().unwrap();
        let store = FileVectorStore::open(dir.path()).unwrap();
        for i in 0..5 {
            store
                .insert_combined(record(
                    Domain::Strategy,
                    &format!("r{i}"),
                    vec![1.0, i as f32],
                    1.0,
                ))
                .await
                .unwrap();
        }
        let hits = store.search_combined(&[1.0, 0.0], 3).await.unwrap();
        assert_eq!(hits.len(), 3);
    }
}

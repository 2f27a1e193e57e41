//! Chunk-level checkpoint store for doctrine extraction.
//!
//! Parsed chunk output is persisted to `02_doctrine_chunks.json` before the
//! aggregate doctrine is assembled, so a chapter that fails mid-extraction
//! can be resumed (completed chunks are skipped) or reconstructed from
//! whatever parsed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CHECKPOINT_FILE: &str = "02_doctrine_chunks.json";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ChapterState {
    /// Completed chunk parses, keyed by chunk index (string keys keep the
    /// on-disk format stable for external readers).
    #[serde(default)]
    completed: BTreeMap<String, Value>,
}

/// Per-book checkpoint store. One instance per ingest run; writes go
/// through immediately (tiny JSON file, acceptable on the hot path).
pub struct CheckpointStore {
    path: PathBuf,
    state: BTreeMap<String, ChapterState>,
}

impl CheckpointStore {
    /// Open (or create) the checkpoint file in a book storage directory.
    pub fn open(storage: &Path) -> Self {
        let path = storage.join(CHECKPOINT_FILE);
        let state = fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self { path, state }
    }

    fn chapter_key(chapter_id: &str) -> String {
        format!("chapter_{chapter_id}")
    }

    /// A previously completed parse for this chunk, if any.
    pub fn get(&self, chapter_id: &str, chunk_index: usize) -> Option<&Value> {
        self.state
            .get(&Self::chapter_key(chapter_id))
            .and_then(|ch| ch.completed.get(&chunk_index.to_string()))
    }

    /// Record a completed chunk parse and persist the store.
    pub fn put(&mut self, chapter_id: &str, chunk_index: usize, parsed: Value) -> anyhow::Result<()> {
        self.state
            .entry(Self::chapter_key(chapter_id))
            .or_default()
            .completed
            .insert(chunk_index.to_string(), parsed);
        self.persist()
    }

    /// All completed chunk parses for a chapter, in chunk-index order.
    /// Used to reconstruct a partial doctrine after a chapter-level failure.
    pub fn completed_chunks(&self, chapter_id: &str) -> Vec<Value> {
        let Some(chapter) = self.state.get(&Self::chapter_key(chapter_id)) else {
            return vec![];
        };
        let mut indexed: Vec<(usize, &Value)> = chapter
            .completed
            .iter()
            .filter_map(|(k, v)| k.parse::<usize>().ok().map(|i| (i, v)))
            .collect();
        indexed.sort_by_key(|(i, _)| *i);
        indexed.into_iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn completed_count(&self, chapter_id: &str) -> usize {
        self.state
            .get(&Self::chapter_key(chapter_id))
            .map(|ch| ch.completed.len())
            .unwrap_or(0)
    }

    fn persist(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.state)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_put_then_get() {
        let dir = tempdir().unwrap();
        let mut store = CheckpointStore::open(dir.path());

        assert!(store.get("abc", 0).is_none());
        store.put("abc", 0, json!({"domains": ["risk"]})).unwrap();
        assert_eq!(store.get("abc", 0).unwrap()["domains"][0], "risk");
        assert!(store.get("abc", 1).is_none());
        assert!(store.get("other", 0).is_none());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut store = CheckpointStore::open(dir.path());
            store.put("ch1", 2, json!({"principles": []})).unwrap();
        }
        let store = CheckpointStore::open(dir.path());
        assert!(store.get("ch1", 2).is_some());
        assert_eq!(store.completed_count("ch1"), 1);
    }

    #[test]
    fn test_completed_chunks_sorted_by_index() {
        let dir = tempdir().unwrap();
        let mut store = CheckpointStore::open(dir.path());
        store.put("ch", 10, json!({"n": 10})).unwrap();
        store.put("ch", 2, json!({"n": 2})).unwrap();
        store.put("ch", 0, json!({"n": 0})).unwrap();

        let chunks = store.completed_chunks("ch");
        let order: Vec<i64> = chunks.iter().map(|c| c["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![0, 2, 10]);
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CHECKPOINT_FILE), "{not json").unwrap();
        let store = CheckpointStore::open(dir.path());
        assert_eq!(store.completed_count("any"), 0);
    }
}

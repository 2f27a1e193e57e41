use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::scoring::ScoringConfig;

/// Model selection, one role per pipeline concern. Environment variables
/// always win over the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Boundary decisions and general extraction.
    pub extract: String,
    /// Instruction-following model for doctrine JSON.
    pub doctrine: String,
    /// Lightweight embedding model.
    pub embed: String,
    /// Fast model for glyph repair.
    pub glyph_repair: String,
    pub base_url: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            extract: "qwen2.5:7b".into(),
            doctrine: "deepseek-r1:8b".into(),
            embed: "nomic-embed-text".into(),
            glyph_repair: "mistral".into(),
            base_url: "http://localhost:11434".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-book artifact directories live here.
    pub storage_root: PathBuf,
    /// LLM decision and glyph-repair caches; cleared after a completed
    /// ingest.
    pub cache_root: PathBuf,
    /// Ministers, vector store, memory store, combined index.
    pub data_root: PathBuf,
    pub models: ModelConfig,
    /// Vector-backend DSN; absent selects the file-backed store.
    pub db_dsn: Option<String>,
    pub scoring: ScoringConfig,
    /// Phase 2 doctrine worker pool size.
    pub doctrine_workers: usize,
    /// Phase 3 embedding worker pool size.
    pub embed_workers: usize,
    /// Optional mission vector for relevance scoring.
    pub mission_vector: Option<Vec<f32>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("rag_storage"),
            cache_root: PathBuf::from("rag_cache"),
            data_root: PathBuf::from("data"),
            models: ModelConfig::default(),
            db_dsn: None,
            scoring: ScoringConfig::default(),
            doctrine_workers: 2,
            embed_workers: 4,
            mission_vector: None,
        }
    }
}

impl Config {
    /// Get the configuration directory path.
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("doctrina");
        Ok(config_dir)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration: defaults, overridden by the optional config
    /// file, overridden by environment variables.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_path() {
            Ok(path) if path.exists() => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file at {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file at {}", path.display()))?
            }
            _ => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply the environment-variable contract.
    pub fn apply_env(&mut self) {
        if let Ok(model) = std::env::var("OLLAMA_EXTRACT_MODEL") {
            self.models.extract = model;
        }
        if let Ok(model) = std::env::var("OLLAMA_DEEPSEEK_MODEL") {
            self.models.doctrine = model;
        }
        if let Ok(model) = std::env::var("OLLAMA_EMBED_MODEL") {
            self.models.embed = model;
        }
        if let Ok(model) = std::env::var("OLLAMA_GLYPH_REPAIR_MODEL") {
            self.models.glyph_repair = model;
        }
        if let Ok(url) = std::env::var("OLLAMA_BASE_URL") {
            self.models.base_url = url;
        }
        if let Ok(dsn) = std::env::var("DB_DSN")
            && !dsn.is_empty()
        {
            self.db_dsn = Some(dsn);
        }
    }

    /// Book storage directory: the storage root joined with the file stem.
    pub fn book_storage(&self, pdf_path: &std::path::Path) -> PathBuf {
        let stem = pdf_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "book".to_string());
        self.storage_root.join(stem)
    }
}

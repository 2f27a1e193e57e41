//! LLM-driven glyph repair.
//!
//! Canonical text with font-encoding artifacts is split into paragraph
//! chunks and repaired chunk-by-chunk. Each repair is cached by content
//! hash, so re-running a book is free. A failed repair passes the chunk
//! through unchanged — repair must never lose content.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::llm::{prompts, LlmService};
use crate::text::{chunk_text, MAX_CHUNK_CHARS};

/// Parallel in-flight repair calls.
const REPAIR_CONCURRENCY: usize = 4;

/// Per-chunk repair timeout.
const REPAIR_TIMEOUT: Duration = Duration::from_secs(30);

pub struct GlyphRepairer {
    client: Arc<dyn LlmService>,
    cache_dir: PathBuf,
}

impl GlyphRepairer {
    pub fn new(client: Arc<dyn LlmService>, cache_dir: &Path) -> Self {
        Self {
            client,
            cache_dir: cache_dir.join("glyph"),
        }
    }

    /// Repair the canonical text. Chunk order is preserved; chunks that
    /// fail to repair are passed through unchanged.
    pub async fn repair<F>(&self, text: &str, mut on_chunk: F) -> String
    where
        F: FnMut(usize, usize),
    {
        let chunks = chunk_text(text, MAX_CHUNK_CHARS);
        let total = chunks.len();

        let repaired: Vec<String> = stream::iter(chunks.into_iter())
            .map(|chunk| {
                let client = Arc::clone(&self.client);
                let cache_dir = self.cache_dir.clone();
                async move { repair_chunk(client, &cache_dir, chunk).await }
            })
            .buffered(REPAIR_CONCURRENCY)
            .enumerate()
            .map(|(i, chunk)| {
                on_chunk(i + 1, total);
                chunk
            })
            .collect()
            .await;

        repaired.join("\n\u{c}\n")
    }
}

async fn repair_chunk(client: Arc<dyn LlmService>, cache_dir: &Path, chunk: String) -> String {
    let key = crate::text::sha256_hex(&chunk);
    let cache_path = cache_dir.join(format!("{key}.txt"));

    if let Ok(cached) = std::fs::read_to_string(&cache_path) {
        debug!("glyph repair cache hit for {key}");
        return cached;
    }

    let prompt = prompts::glyph_repair_prompt(&chunk);
    match client.generate(None, &prompt, REPAIR_TIMEOUT).await {
        Ok(repaired) if !repaired.trim().is_empty() => {
            if std::fs::create_dir_all(cache_dir)
                .and_then(|_| std::fs::write(&cache_path, &repaired))
                .is_err()
            {
                warn!("failed to cache glyph repair for {key}");
            }
            repaired
        }
        Ok(_) => chunk,
        Err(e) => {
            warn!("glyph repair failed, passing chunk through: {e}");
            chunk
        }
    }
}

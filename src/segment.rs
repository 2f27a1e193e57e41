//! Chapter segmentation.
//!
//! The streaming pass feeds the LLM one page at a time together with the
//! tail of the chapter buffer and asks for a boundary decision. Decisions
//! are cached by content hash. When the streaming pass collapses a long
//! book into a single chapter, a heading-regex fallback takes over.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::llm::{generate_json, prompts, LlmService};
use crate::text::sha256_hex;

/// Per-decision LLM timeout.
const SPLIT_TIMEOUT: Duration = Duration::from_secs(120);

/// How much buffer tail / page head the LLM sees per decision.
const DECISION_WINDOW_CHARS: usize = 4_000;

/// One chapter of a book. Indices are dense from 1; the id is a stable
/// content hash of the raw text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub chapter_index: usize,
    pub chapter_id: String,
    pub chapter_title: Option<String>,
    pub raw_text: String,
}

impl Chapter {
    fn from_text(index: usize, title: Option<String>, text: &str) -> Self {
        Self {
            chapter_index: index,
            chapter_id: sha256_hex(text),
            chapter_title: title,
            raw_text: text.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Boundary {
    StartNewChapter,
    ContinueChapter,
    EndChapter,
}

#[derive(Debug, Deserialize)]
struct BoundaryDecision {
    decision: Boundary,
    #[serde(default)]
    #[allow(dead_code)]
    confidence: f32,
}

pub struct ChapterSegmenter<'a> {
    client: &'a dyn LlmService,
    cache_dir: PathBuf,
}

impl<'a> ChapterSegmenter<'a> {
    pub fn new(client: &'a dyn LlmService, cache_dir: &Path) -> Self {
        Self {
            client,
            cache_dir: cache_dir.join("decisions"),
        }
    }

    /// Streaming LLM-driven split. Pages are consumed in reading order and
    /// each page lands in exactly one chapter. The result is never empty.
    pub async fn split<F>(
        &self,
        pages: &[String],
        book_title: &str,
        mut on_page: F,
    ) -> Vec<Chapter>
    where
        F: FnMut(usize, usize),
    {
        let mut chapters: Vec<Chapter> = Vec::new();
        let mut buffer = String::new();

        for (page_no, page) in pages.iter().enumerate() {
            on_page(page_no + 1, pages.len());

            let page_text = page.trim();
            if page_text.is_empty() {
                buffer.push_str("\n\u{c}\n");
                continue;
            }

            let decision = self.boundary_decision(&buffer, page_text).await;

            match decision {
                Boundary::StartNewChapter => {
                    flush(&mut chapters, &mut buffer);
                    buffer = page_text.to_string();
                }
                Boundary::EndChapter => {
                    buffer.push_str("\n\u{c}\n");
                    buffer.push_str(page_text);
                    flush(&mut chapters, &mut buffer);
                }
                Boundary::ContinueChapter => {
                    buffer.push_str("\n\u{c}\n");
                    buffer.push_str(page_text);
                }
            }
        }

        flush(&mut chapters, &mut buffer);

        if chapters.is_empty() {
            let joined = pages.join("\n\u{c}\n");
            chapters.push(Chapter::from_text(1, Some(book_title.to_string()), &joined));
        }

        chapters
    }

    async fn boundary_decision(&self, buffer: &str, page_text: &str) -> Boundary {
        let tail: String = tail_chars(buffer, DECISION_WINDOW_CHARS);
        let head: String = page_text.chars().take(DECISION_WINDOW_CHARS).collect();
        let user_prompt = prompts::chapter_boundary_user_prompt(&tail, &head);

        let cache_key = sha256_hex(&format!(
            "{}{}",
            prompts::CHAPTER_BOUNDARY_SYSTEM_PROMPT,
            user_prompt
        ));
        let cache_path = self.cache_dir.join(format!("{cache_key}.json"));

        if let Some(decision) = read_cached_decision(&cache_path) {
            debug!("boundary decision cache hit");
            return decision.decision;
        }

        match generate_json(
            self.client,
            prompts::CHAPTER_BOUNDARY_SYSTEM_PROMPT,
            &user_prompt,
            SPLIT_TIMEOUT,
        )
        .await
        {
            Ok(value) => match serde_json::from_value::<BoundaryDecision>(value.clone()) {
                Ok(decision) => {
                    cache_decision(&self.cache_dir, &cache_path, &value);
                    decision.decision
                }
                Err(e) => {
                    warn!("unparseable boundary decision ({e}); defaulting to continue");
                    Boundary::ContinueChapter
                }
            },
            Err(e) => {
                warn!("boundary decision failed ({e}); defaulting to continue");
                Boundary::ContinueChapter
            }
        }
    }
}

fn flush(chapters: &mut Vec<Chapter>, buffer: &mut String) {
    let text = buffer.trim();
    if text.is_empty() {
        buffer.clear();
        return;
    }
    chapters.push(Chapter::from_text(chapters.len() + 1, None, text));
    buffer.clear();
}

fn tail_chars(s: &str, n: usize) -> String {
    let count = s.chars().count();
    if count <= n {
        return s.to_string();
    }
    s.chars().skip(count - n).collect()
}

fn read_cached_decision(path: &Path) -> Option<BoundaryDecision> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn cache_decision(dir: &Path, path: &Path, value: &serde_json::Value) {
    if std::fs::create_dir_all(dir)
        .and_then(|_| std::fs::write(path, value.to_string()))
        .is_err()
    {
        warn!("failed to cache boundary decision");
    }
}

static HEADING_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?m)^(THE\s+[A-Z ]+BOOK)\b",
        r"(?m)^(BOOK\s+[IVXLCDM]+)\b",
        r"(?m)^(CHAPTER\s+\d+)\b",
        r"(?m)^(THE\s+[A-Z]+)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

/// Fallback splitter matching heading patterns such as `BOOK II` or
/// `CHAPTER 1`. Used when the streaming pass yields a single chapter for a
/// book long enough that this is implausible.
pub fn fallback_split_by_headings(text: &str) -> Vec<Chapter> {
    if text.trim().is_empty() {
        return vec![];
    }

    let mut positions: Vec<usize> = HEADING_PATTERNS
        .iter()
        .flat_map(|re| re.find_iter(text).map(|m| m.start()))
        .collect();
    positions.sort_unstable();
    positions.dedup();

    if positions.len() <= 1 {
        return vec![Chapter::from_text(1, None, text)];
    }

    positions.push(text.len());
    let mut chapters = Vec::new();
    for window in positions.windows(2) {
        let chunk = text[window[0]..window[1]].trim();
        if chunk.is_empty() {
            continue;
        }
        chapters.push(Chapter::from_text(chapters.len() + 1, None, chunk));
    }

    if chapters.is_empty() {
        chapters.push(Chapter::from_text(1, None, text));
    }

    chapters
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    use crate::llm::LlmError;

    /// Stub that replays a scripted sequence of boundary decisions.
    struct ScriptedSplitter {
        responses: Mutex<Vec<String>>,
    }

    impl ScriptedSplitter {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().rev().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl LlmService for ScriptedSplitter {
        async fn generate(
            &self,
            _system: Option<&str>,
            _prompt: &str,
            _timeout: Duration,
        ) -> Result<String, LlmError> {
            let mut responses = self.responses.lock().unwrap();
            Ok(responses
                .pop()
                .unwrap_or_else(|| r#"{"decision":"continue_chapter","confidence":0.0}"#.into()))
        }

        async fn embed(&self, _text: &str, _timeout: Duration) -> Result<Vec<f32>, LlmError> {
            unimplemented!()
        }

        async fn embed_batch(
            &self,
            _texts: &[String],
            _timeout: Duration,
        ) -> Result<Vec<Vec<f32>>, LlmError> {
            unimplemented!()
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn pages(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn test_start_new_chapter_flushes_buffer() {
        let dir = tempdir().unwrap();
        let client = ScriptedSplitter::new(vec![
            r#"{"decision":"continue_chapter","confidence":0.9}"#,
            r#"{"decision":"continue_chapter","confidence":0.9}"#,
            r#"{"decision":"start_new_chapter","confidence":0.95}"#,
            r#"{"decision":"continue_chapter","confidence":0.9}"#,
        ]);
        let segmenter = ChapterSegmenter::new(&client, dir.path());

        let chapters = segmenter
            .split(
                &pages(&["intro text", "more intro", "CHAPTER 1 begins", "body"]),
                "book",
                |_, _| {},
            )
            .await;

        assert_eq!(chapters.len(), 2);
        assert!(chapters[0].raw_text.contains("intro text"));
        assert!(chapters[1].raw_text.starts_with("CHAPTER 1"));
    }

    #[tokio::test]
    async fn test_indices_dense_and_ids_stable() {
        let dir = tempdir().unwrap();
        let client = ScriptedSplitter::new(vec![
            r#"{"decision":"continue_chapter","confidence":0.9}"#,
            r#"{"decision":"end_chapter","confidence":0.9}"#,
            r#"{"decision":"start_new_chapter","confidence":0.9}"#,
        ]);
        let segmenter = ChapterSegmenter::new(&client, dir.path());

        let chapters = segmenter
            .split(&pages(&["one", "two", "three"]), "book", |_, _| {})
            .await;

        assert_eq!(chapters.len(), 2);
        for (i, ch) in chapters.iter().enumerate() {
            assert_eq!(ch.chapter_index, i + 1);
            assert_eq!(ch.chapter_id, sha256_hex(&ch.raw_text));
        }
    }

    #[tokio::test]
    async fn test_unparseable_output_defaults_to_continue() {
        let dir = tempdir().unwrap();
        let client = ScriptedSplitter::new(vec![
            "this is not json",
            r#"{"wrong_key": true}"#,
        ]);
        let segmenter = ChapterSegmenter::new(&client, dir.path());

        let chapters = segmenter.split(&pages(&["a", "b"]), "book", |_, _| {}).await;
        assert_eq!(chapters.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_pages_need_no_llm_call() {
        let dir = tempdir().unwrap();
        // only one scripted response; blank pages must not consume any
        let client = ScriptedSplitter::new(vec![
            r#"{"decision":"continue_chapter","confidence":0.5}"#,
        ]);
        let segmenter = ChapterSegmenter::new(&client, dir.path());

        let chapters = segmenter
            .split(&pages(&["", "  ", "actual content"]), "book", |_, _| {})
            .await;
        assert_eq!(chapters.len(), 1);
        assert!(chapters[0].raw_text.contains("actual content"));
    }

    #[tokio::test]
    async fn test_result_never_empty() {
        let dir = tempdir().unwrap();
        let client = ScriptedSplitter::new(vec![]);
        let segmenter = ChapterSegmenter::new(&client, dir.path());

        let chapters = segmenter.split(&pages(&["", ""]), "mybook", |_, _| {}).await;
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].chapter_title.as_deref(), Some("mybook"));
    }

    #[tokio::test]
    async fn test_decision_cache_hit_skips_llm() {
        let dir = tempdir().unwrap();
        let client = ScriptedSplitter::new(vec![
            r#"{"decision":"start_new_chapter","confidence":0.9}"#,
        ]);
        {
            let segmenter = ChapterSegmenter::new(&client, dir.path());
            segmenter.split(&pages(&["same page"]), "book", |_, _| {}).await;
        }
        // second run: scripted responses exhausted, so a cache miss would
        // fall back to continue_chapter; a hit replays start_new_chapter
        let client2 = ScriptedSplitter::new(vec![]);
        let segmenter = ChapterSegmenter::new(&client2, dir.path());
        let chapters = segmenter.split(&pages(&["same page"]), "book", |_, _| {}).await;
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].raw_text, "same page");
    }

    // ── fallback splitter ───────────────────────────────────────────────

    #[test]
    fn test_fallback_splits_on_book_headings() {
        let text = "BOOK I\nFirst book content here.\n\nBOOK II\nSecond book content.\n\nBOOK III\nThird book content.";
        let chapters = fallback_split_by_headings(text);
        assert_eq!(chapters.len(), 3);
        assert!(chapters[0].raw_text.starts_with("BOOK I"));
        assert!(chapters[2].raw_text.starts_with("BOOK III"));
    }

    #[test]
    fn test_fallback_splits_on_chapter_headings() {
        let text = "CHAPTER 1\nalpha\n\nCHAPTER 2\nbeta";
        let chapters = fallback_split_by_headings(text);
        assert_eq!(chapters.len(), 2);
    }

    #[test]
    fn test_fallback_single_chapter_when_no_headings() {
        let text = "no headings anywhere in this text";
        let chapters = fallback_split_by_headings(text);
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].chapter_index, 1);
    }

    #[test]
    fn test_fallback_empty_text() {
        assert!(fallback_split_by_headings("  ").is_empty());
    }
}

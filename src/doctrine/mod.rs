//! Structured doctrine extracted from chapters.
//!
//! A doctrine is the paraphrased operational content of one chapter:
//! principles, rules, claims, and warnings, tagged with one to three
//! whitelisted domains.

pub mod extractor;
pub mod normalize;

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointStore;
use crate::domain::Domain;
use crate::segment::Chapter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principle {
    pub id: String,
    pub statement: String,
    #[serde(default)]
    pub abstracted_from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub condition: String,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub claim: String,
    #[serde(default)]
    pub confidence: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub situation: String,
    #[serde(default)]
    pub risk: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterType {
    Doctrinal,
    Narrative,
    Commentary,
    Introductory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoctrineStatus {
    Ok,
    ValidEmpty,
    ExtractionFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelConfidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctrineMeta {
    pub status: DoctrineStatus,
    pub chapter_type: ChapterType,
    #[serde(default)]
    pub reason: Option<String>,
    pub doctrine_density: f64,
    pub extracted_chunks: usize,
    pub model_confidence: ModelConfidence,
}

/// Per-chapter doctrine. `domains` is always non-empty after normalization
/// (the keyword-inference fallback guarantees it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Doctrine {
    pub chapter_index: usize,
    pub chapter_title: Option<String>,
    pub domains: Vec<Domain>,
    pub principles: Vec<Principle>,
    pub rules: Vec<Rule>,
    pub claims: Vec<Claim>,
    pub warnings: Vec<Warning>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<DoctrineMeta>,
}

impl Doctrine {
    /// Empty doctrine shell for a chapter whose extraction produced nothing.
    pub fn empty(chapter_index: usize, chapter_title: Option<String>) -> Self {
        Self {
            chapter_index,
            chapter_title,
            domains: vec![],
            principles: vec![],
            rules: vec![],
            claims: vec![],
            warnings: vec![],
            meta: None,
        }
    }

    pub fn item_count(&self) -> usize {
        self.principles.len() + self.rules.len() + self.claims.len() + self.warnings.len()
    }

    pub fn is_doctrinal(&self) -> bool {
        self.item_count() > 0
    }
}

const NARRATIVE_MARKERS: [&str; 5] = ["story", "example", "illustration", "history", "background"];

const STRUCTURAL_MARKERS: [&str; 6] = [
    "contents",
    "preface",
    "foreword",
    "introduction",
    "acknowledg",
    "copyright",
];

/// Classify a chapter from its extracted doctrine and raw text.
pub fn classify_chapter(doctrine: &Doctrine, raw_text: &str) -> ChapterType {
    if doctrine.is_doctrinal() {
        return ChapterType::Doctrinal;
    }

    let lowered = raw_text.to_lowercase();
    let word_count = raw_text.split_whitespace().count();

    if word_count < 250 && STRUCTURAL_MARKERS.iter().any(|m| lowered.contains(m)) {
        return ChapterType::Introductory;
    }

    if NARRATIVE_MARKERS.iter().any(|m| lowered.contains(m)) {
        return ChapterType::Narrative;
    }

    ChapterType::Commentary
}

/// Items per word of chapter text, rounded to four decimal places.
pub fn doctrine_density(doctrine: &Doctrine, raw_text: &str) -> f64 {
    let words = raw_text.split_whitespace().count().max(1);
    let density = doctrine.item_count() as f64 / words as f64;
    (density * 10_000.0).round() / 10_000.0
}

/// Attach `_meta` to every doctrine: classification, density, checkpointed
/// chunk count, and status. A status already present (set by a failed
/// extraction) is preserved.
pub fn enrich(doctrines: &mut [Doctrine], chapters: &[Chapter], checkpoints: &CheckpointStore) {
    for doctrine in doctrines.iter_mut() {
        let chapter = chapters
            .iter()
            .find(|c| c.chapter_index == doctrine.chapter_index);
        let raw_text = chapter.map(|c| c.raw_text.as_str()).unwrap_or("");
        let extracted_chunks = chapter
            .map(|c| checkpoints.completed_count(&c.chapter_id))
            .unwrap_or(0);

        let chapter_type = classify_chapter(doctrine, raw_text);
        let density = doctrine_density(doctrine, raw_text);

        let status = match doctrine.meta.as_ref().map(|m| m.status) {
            Some(DoctrineStatus::ExtractionFailed) => DoctrineStatus::ExtractionFailed,
            _ if density == 0.0 => DoctrineStatus::ValidEmpty,
            _ => DoctrineStatus::Ok,
        };

        doctrine.meta = Some(DoctrineMeta {
            status,
            chapter_type,
            reason: (density == 0.0).then(|| "No actionable doctrine present".to_string()),
            doctrine_density: density,
            extracted_chunks,
            model_confidence: if density == 0.0 {
                ModelConfidence::High
            } else {
                ModelConfidence::Medium
            },
        });
    }
}

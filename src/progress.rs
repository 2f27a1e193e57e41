//! Per-book progress file.
//!
//! Every phase overwrites `progress.json` in the book's storage directory.
//! The file is purely advisory (a concurrent writer may clobber it), but
//! `phase == "completed"` is the durable signal the resume logic keys on.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Pipeline phase identifiers as they appear in `progress.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[serde(rename = "phase_0")]
    Extraction,
    #[serde(rename = "phase_0.5")]
    GlyphRepair,
    #[serde(rename = "phase_1")]
    ChapterSplit,
    #[serde(rename = "phase_2")]
    DoctrineExtraction,
    #[serde(rename = "phase_2.5")]
    MinisterMemories,
    #[serde(rename = "phase_3")]
    Embedding,
    #[serde(rename = "phase_3.5")]
    MinisterConversion,
    #[serde(rename = "phase_4")]
    MemoryCommit,
    #[serde(rename = "completed")]
    Completed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Extraction => "phase_0",
            Phase::GlyphRepair => "phase_0.5",
            Phase::ChapterSplit => "phase_1",
            Phase::DoctrineExtraction => "phase_2",
            Phase::MinisterMemories => "phase_2.5",
            Phase::Embedding => "phase_3",
            Phase::MinisterConversion => "phase_3.5",
            Phase::MemoryCommit => "phase_4",
            Phase::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Running,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Counts {
    pub current: Option<usize>,
    pub total: Option<usize>,
}

/// One progress event. Created at phase 0, overwritten on every phase event;
/// the final value has `phase == Completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub phase: Phase,
    pub message: String,
    pub current: Option<usize>,
    pub total: Option<usize>,
    pub status: ProgressStatus,
    pub percent: u8,
    pub counts: Counts,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ProgressRecord {
    pub fn is_completed(&self) -> bool {
        self.phase == Phase::Completed
    }
}

/// Write a progress event for `storage/progress.json`.
///
/// Failures are logged and swallowed: progress is advisory and must never
/// fail a phase.
pub fn live_progress(
    storage: &Path,
    phase: Phase,
    message: &str,
    current: Option<usize>,
    total: Option<usize>,
) {
    let done = phase == Phase::Completed
        || matches!((current, total), (Some(c), Some(t)) if t > 0 && c >= t);
    let percent = match (current, total) {
        (Some(c), Some(t)) if t > 0 => ((c as f64 / t as f64) * 100.0).min(100.0) as u8,
        _ if phase == Phase::Completed => 100,
        _ => 0,
    };

    let record = ProgressRecord {
        phase,
        message: message.to_string(),
        current,
        total,
        status: if done {
            ProgressStatus::Completed
        } else {
            ProgressStatus::Running
        },
        percent,
        counts: Counts { current, total },
        timestamp: chrono::Utc::now(),
    };

    if let Err(e) = write_record(storage, &record) {
        debug!("progress write failed for {}: {}", storage.display(), e);
    }
}

fn write_record(storage: &Path, record: &ProgressRecord) -> anyhow::Result<()> {
    fs::create_dir_all(storage)?;
    let json = serde_json::to_string_pretty(record)?;
    fs::write(storage.join("progress.json"), json)?;
    Ok(())
}

/// Load the current progress record, if any.
pub fn load_progress(storage: &Path) -> Option<ProgressRecord> {
    let content = fs::read_to_string(storage.join("progress.json")).ok()?;
    serde_json::from_str(&content).ok()
}

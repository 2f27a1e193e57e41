use std::path::PathBuf;

use thiserror::Error;

/// Pipeline-level error kinds.
///
/// Most failures are recovered where they happen (workers count them in
/// `IngestMetrics` and continue); only the driver surfaces these to the CLI.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("PDF unreadable: {path} ({reason})")]
    PdfUnreadable { path: PathBuf, reason: String },

    #[error("doctrine extraction failed for chapter {chapter_index}: {cause}")]
    ExtractionFailed { chapter_index: usize, cause: String },

    #[error("critical ingest failure: {0}")]
    CriticalIngestFailure(String),

    #[error("domain '{0}' is not in the whitelist")]
    DomainInvalid(String),

    #[error("embedding dimension mismatch: store has {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("disk write failed: {path}")]
    DiskWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl IngestError {
    /// True when the whole book must be abandoned (driver-level abort).
    #[allow(dead_code)]
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            IngestError::CriticalIngestFailure(_) | IngestError::PdfUnreadable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_critical_classification() {
        let e = IngestError::CriticalIngestFailure("all chapters failed".into());
        assert!(e.is_critical());

        let e = IngestError::DomainInvalid("astrology".into());
        assert!(!e.is_critical());

        let e = IngestError::ExtractionFailed {
            chapter_index: 5,
            cause: "invalid json".into(),
        };
        assert!(!e.is_critical());
    }
}

//! Tiered text extraction: primary decoder, secondary decoder, OCR.
//!
//! Each tier is accepted when its quality score clears the bar and no raw
//! glyph-stream markers leaked through; otherwise the next tier runs. The
//! book is unreadable only when every tier yields empty text.

mod ocr;
mod pdf;
pub mod repair;

use std::path::Path;

use tracing::{info, warn};

use crate::error::IngestError;
use crate::text::{is_glyph_stream, quality_score, PAGE_SEPARATOR};

/// Minimum printable-character ratio for a decoder tier to be accepted.
const QUALITY_BAR: f64 = 0.85;

/// Extract per-page text, escalating through decoder tiers as needed.
pub fn extract_pages(path: &Path) -> Result<Vec<String>, IngestError> {
    let primary = match pdf::extract_pages(path) {
        Ok(pages) => pages,
        Err(e) => {
            warn!("primary decoder failed for {}: {e:#}", path.display());
            vec![]
        }
    };

    let primary_text = canonical(&primary);
    let primary_quality = quality_score(&primary_text);
    if !primary_text.is_empty() && primary_quality > QUALITY_BAR && !is_glyph_stream(&primary_text)
    {
        return Ok(primary);
    }

    info!(
        "primary decoder quality {:.2} for {}; trying secondary decoder",
        primary_quality,
        path.display()
    );
    let secondary = match pdf::extract_pages_poppler(path) {
        Ok(pages) => pages,
        Err(e) => {
            warn!("secondary decoder failed for {}: {e:#}", path.display());
            vec![]
        }
    };

    let secondary_text = canonical(&secondary);
    let secondary_quality = quality_score(&secondary_text);
    if !secondary_text.is_empty()
        && secondary_quality > primary_quality
        && secondary_quality > QUALITY_BAR
        && !is_glyph_stream(&secondary_text)
    {
        return Ok(secondary);
    }

    info!("decoders below quality bar for {}; trying OCR", path.display());
    let ocr = match ocr::extract_pages_ocr(path) {
        Ok(pages) => pages,
        Err(e) => {
            warn!("OCR tier failed for {}: {e:#}", path.display());
            vec![]
        }
    };

    // Best non-empty result wins; an unreadable book is a hard error.
    let mut candidates = vec![
        (primary_quality, primary),
        (secondary_quality, secondary),
        (quality_score(&canonical(&ocr)), ocr),
    ];
    candidates.retain(|(_, pages)| !canonical(pages).trim().is_empty());
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

    match candidates.into_iter().next() {
        Some((_, pages)) => Ok(pages),
        None => Err(IngestError::PdfUnreadable {
            path: path.to_path_buf(),
            reason: "all extraction tiers yielded empty text".into(),
        }),
    }
}

/// Canonical text: pages concatenated with a form-feed separator.
pub fn canonical(pages: &[String]) -> String {
    pages.join(&PAGE_SEPARATOR.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_joins_with_form_feed() {
        let pages = vec!["page one".to_string(), "page two".to_string()];
        assert_eq!(canonical(&pages), "page one\u{c}page two");
    }

    #[test]
    fn test_canonical_empty() {
        assert_eq!(canonical(&[]), "");
    }

    #[test]
    fn test_unreadable_pdf_is_hard_error() {
        let dir = std::env::temp_dir();
        let path = dir.join("doctrina-test-missing.pdf");
        let err = extract_pages(&path).unwrap_err();
        assert!(matches!(err, IngestError::PdfUnreadable { .. }));
    }
}

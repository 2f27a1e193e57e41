use anyhow::{Context, Result};
use std::path::Path;

/// Extract per-page text with the primary decoder.
pub fn extract_pages(path: &Path) -> Result<Vec<String>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read PDF file: {}", path.display()))?;

    let pages = pdf_extract::extract_text_from_mem_by_pages(&bytes)
        .with_context(|| format!("Failed to extract text from PDF: {}", path.display()))?;

    Ok(pages.iter().map(|p| clean_page_text(p)).collect())
}

/// Secondary decoder: the poppler `pdftotext` binary, when installed.
/// Emits form-feed separators between pages, which we split on.
pub fn extract_pages_poppler(path: &Path) -> Result<Vec<String>> {
    let output = std::process::Command::new("pdftotext")
        .arg("-layout")
        .arg(path)
        .arg("-")
        .output()
        .context("Failed to run pdftotext (is poppler installed?)")?;

    if !output.status.success() {
        anyhow::bail!(
            "pdftotext failed for {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let text = String::from_utf8_lossy(&output.stdout).to_string();
    Ok(text.split('\u{c}').map(clean_page_text).collect())
}

/// Clean up decoder output: strip empty lines, normalize whitespace, drop
/// null bytes and BOMs left by broken encoders.
fn clean_page_text(text: &str) -> String {
    text.lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
        .replace('\u{0}', "")
        .replace('\u{FEFF}', "")
        .trim_matches('\n')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_page_text() {
        let dirty = "  Hello  \n\n\u{0}World\u{FEFF}  \n";
        let clean = clean_page_text(dirty);
        assert_eq!(clean, "  Hello\n\nWorld");
    }

    #[test]
    fn test_clean_strips_leading_trailing_newlines() {
        assert_eq!(clean_page_text("\n\ntext\n\n"), "text");
    }
}

//! OCR fallback tier: rasterize with `pdftoppm`, recognize with `tesseract`.
//!
//! Both binaries are external collaborators; this module only shells out to
//! them and is reached when every text decoder produced garbage.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};

/// Rasterize the PDF and run OCR on each page image.
pub fn extract_pages_ocr(path: &Path) -> Result<Vec<String>> {
    if !binary_available("pdftoppm") || !binary_available("tesseract") {
        anyhow::bail!("OCR tier unavailable: pdftoppm and tesseract are required");
    }

    let tmp = tempdir_for_ocr()?;
    let prefix = tmp.join("page");

    let status = Command::new("pdftoppm")
        .arg(path)
        .arg(&prefix)
        .arg("-png")
        .status()
        .context("Failed to run pdftoppm")?;
    if !status.success() {
        anyhow::bail!("pdftoppm failed for {}", path.display());
    }

    let mut images: Vec<_> = std::fs::read_dir(&tmp)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("png"))
        .collect();
    images.sort();

    let mut pages = Vec::with_capacity(images.len());
    for image in &images {
        let output = Command::new("tesseract")
            .arg(image)
            .arg("stdout")
            .output()
            .context("Failed to run tesseract")?;
        pages.push(String::from_utf8_lossy(&output.stdout).to_string());
    }

    std::fs::remove_dir_all(&tmp).ok();
    Ok(pages)
}

fn binary_available(name: &str) -> bool {
    Command::new(name)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn tempdir_for_ocr() -> Result<std::path::PathBuf> {
    let dir = std::env::temp_dir().join(format!("doctrina-ocr-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

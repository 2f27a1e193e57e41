//! Text helpers shared across pipeline phases: content hashing, paragraph
//! chunking, and extraction-quality heuristics.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Page separator used when concatenating pages into canonical text.
pub const PAGE_SEPARATOR: char = '\u{c}';

/// Maximum characters per LLM chunk (glyph repair and doctrine extraction).
pub const MAX_CHUNK_CHARS: usize = 8_000;

static GLYPH_STREAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/G[0-9A-Fa-f]{2}").expect("static regex"));

static WEIRD_CHAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{C}\p{S}]").expect("static regex"));

/// SHA-256 hex digest of a string. Stable ids for chapters and cache keys.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Split text into chunks of at most `max_chars` characters, cutting at
/// paragraph boundaries (`\n\n`) where one falls inside the window.
///
/// Whitespace-only chunks are dropped; every non-whitespace character of the
/// input appears in exactly one chunk.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let mut out = Vec::new();
    let mut start = 0;

    while start < n {
        let end = (start + max_chars).min(n);
        let window: String = chars[start..end].iter().collect();
        let cut = if end < n {
            match window.rfind("\n\n") {
                Some(pos) if pos > 0 => {
                    // rfind returns a byte offset into the window; convert back
                    // to a char count so multi-byte text stays intact.
                    let cut_chars = window[..pos].chars().count();
                    start + cut_chars
                }
                _ => end,
            }
        } else {
            end
        };
        let chunk: String = chars[start..cut].iter().collect();
        if !chunk.trim().is_empty() {
            out.push(chunk);
        }
        start = cut.max(start + 1);
    }

    out
}

/// Printable-character ratio, used to decide whether an extraction tier is
/// good enough or the next tier should run.
pub fn quality_score(text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }
    let total = text.chars().count();
    let printable = text
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .count();
    printable as f64 / total as f64
}

/// Heuristic for font-encoding / glyph artifacts in extracted text.
///
/// "Weird" characters are those in Unicode categories `C*` (control,
/// unassigned, private use) or `S*` (symbols). Whitespace controls are not
/// counted as weird.
pub fn looks_glyph_encoded(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let total = text.chars().count();

    let non_ascii = text.chars().filter(|c| !c.is_ascii()).count();
    let non_ascii_ratio = non_ascii as f64 / total as f64;

    let weird = text
        .chars()
        .filter(|c| !c.is_whitespace() && WEIRD_CHAR_RE.is_match(&c.to_string()))
        .count();
    let weird_ratio = weird as f64 / total as f64;

    (non_ascii_ratio > 0.15 && weird_ratio > 0.05) || weird_ratio > 0.12
}

/// Detect raw glyph-stream markers (`/G3F`-style names) leaking out of the
/// PDF content stream.
pub fn is_glyph_stream(text: &str) -> bool {
    GLYPH_STREAM_RE.is_match(text)
}

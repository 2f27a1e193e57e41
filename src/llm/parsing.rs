//! Shared JSON parsing utilities for LLM response handling.
//!
//! LLM responses are unpredictable — they may wrap JSON in markdown fences,
//! include explanatory text before/after, or return malformed JSON. This
//! module provides robust extraction of a single JSON object from raw LLM
//! output.

use serde_json::Value;

/// Parse a raw LLM response into a JSON object.
///
/// Handles:
/// - Clean JSON objects
/// - JSON wrapped in markdown code fences (` ```json ... ``` `)
/// - JSON with leading/trailing prose
///
/// Returns `None` when no parseable object is present.
pub fn parse_json_object(response: &str) -> Option<Value> {
    let candidate = extract_json_object(response);
    match serde_json::from_str::<Value>(&candidate) {
        Ok(Value::Object(map)) => Some(Value::Object(map)),
        _ => None,
    }
}

/// Extract a JSON object from a response that may contain extra text.
///
/// Tries the following strategies in order:
/// 1. Strip markdown code fences (` ```json ... ``` `)
/// 2. If the (cleaned) text starts with `{`, find the matching `}`
/// 3. Search for the first `{` in the text and find its matching `}`
/// 4. Fall back to returning the cleaned text as-is
pub fn extract_json_object(response: &str) -> String {
    let stripped = strip_code_fences(response.trim());

    if stripped.starts_with('{')
        && let Some(end) = find_matching_brace(stripped)
    {
        return stripped[..=end].to_string();
    }

    if let Some(start) = stripped.find('{')
        && let Some(end) = find_matching_brace(&stripped[start..])
    {
        return stripped[start..=start + end].to_string();
    }

    stripped.to_string()
}

/// Strip markdown code fences (``` or ```json) from around content.
fn strip_code_fences(s: &str) -> &str {
    let s = s.trim();

    if s.starts_with("```") {
        if let Some(first_newline) = s.find('\n') {
            let inner = &s[first_newline + 1..];
            if let Some(closing) = inner.rfind("```") {
                return inner[..closing].trim();
            }
        }
    }

    s
}

/// Find the byte index of the `}` that matches the first `{` in the string.
///
/// Brace characters inside JSON strings are ignored. Returns `None` if the
/// braces are unbalanced.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if c == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

// ─── Tests ──────────────────────────────────────────────────────────────────

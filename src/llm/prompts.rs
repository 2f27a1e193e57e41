//! Prompt templates for every LLM-driven phase.

/// System prompt for the streaming chapter-boundary decision.
pub const CHAPTER_BOUNDARY_SYSTEM_PROMPT: &str = r#"You are a document structure analyst segmenting a book into chapters.
You are shown the tail of the chapter currently being assembled and the text of the next page.
Decide whether the new page starts a new chapter, continues the current chapter, or ends the current chapter.

Signals for a new chapter: a heading line (e.g. "CHAPTER 3", "BOOK II", "THE THIRD BOOK"), a large topic shift, front-matter ending.
Signals for continuation: the page picks up mid-sentence or mid-argument.

Return JSON exactly:
{
  "decision": "start_new_chapter | continue_chapter | end_chapter",
  "confidence": 0.0
}

Output ONLY valid JSON, no other text."#;

/// User prompt for one boundary decision. Both sides are truncated so the
/// request stays within a small context window.
pub fn chapter_boundary_user_prompt(buffer_tail: &str, page_head: &str) -> String {
    format!(
        "CURRENT BUFFER (tail only):\n\
         --------------------------\n\
         {buffer_tail}\n\
         --------------------------\n\n\
         NEW PAGE TEXT:\n\
         --------------------------\n\
         {page_head}\n\
         --------------------------\n\n\
         QUESTION:\n\
         Does this page START a new chapter, CONTINUE the current chapter,\n\
         or END the current chapter?\n\n\
         Return JSON exactly:\n\
         {{\n  \"decision\": \"start_new_chapter | continue_chapter | end_chapter\",\n  \"confidence\": 0.0\n}}\n"
    )
}

/// System prompt for doctrine extraction from a chapter chunk.
pub const DOCTRINE_SYSTEM_PROMPT: &str = r#"You are a doctrine analyst extracting operational content from a book chapter.
Your task is to distill principles, rules, claims, and warnings from the given text.

Rules you must obey:
- PARAPHRASE ONLY. Never quote the source text verbatim.
- Generalize concrete episodes into operational statements that apply beyond the original context.
- Prefer over-extraction: if any operational content is present, extract it.
- domains must be non-empty and chosen ONLY from this list:
  adaptation, base, conflict, constraints, data, diplomacy, discipline, executor,
  legitimacy, optionality, power, psychology, registry, risk, strategy, technology,
  timing, truth, key_constr
- Pick 1 to 3 domains that best fit the chunk.

Format your output as a single JSON object:
{
  "domains": ["strategy"],
  "principles": [{"statement": "An abstracted operational principle", "abstracted_from": "brief source context or null"}],
  "rules": [{"condition": "When X holds", "action": "do Y"}],
  "claims": [{"claim": "A falsifiable assertion about how the world works", "confidence": "high|medium|low"}],
  "warnings": [{"situation": "A situation to watch for", "risk": "what goes wrong"}]
}

Empty lists are acceptable for chapters with no operational content.
Output ONLY valid JSON, no other text."#;

/// User prompt for one doctrine-extraction chunk.
pub fn doctrine_user_prompt(chunk: &str) -> String {
    format!("chapter text: ```{chunk}```\n\noutput: ")
}

/// Prompt for glyph repair. The repaired text must preserve content, so the
/// instruction forbids summarizing.
pub fn glyph_repair_prompt(text: &str) -> String {
    format!(
        "The following text contains font-encoding or glyph artifacts.\n\
         Repair it into clean, readable English.\n\
         Do not summarize or omit content.\n\n\
         TEXT:\n{text}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_prompt_embeds_both_sides() {
        let p = chapter_boundary_user_prompt("end of buffer", "start of page");
        assert!(p.contains("end of buffer"));
        assert!(p.contains("start of page"));
        assert!(p.contains("start_new_chapter"));
    }

    #[test]
    fn test_doctrine_system_prompt_lists_whitelist() {
        for domain in ["adaptation", "key_constr", "truth", "timing"] {
            assert!(DOCTRINE_SYSTEM_PROMPT.contains(domain));
        }
    }

    #[test]
    fn test_repair_prompt_forbids_summarizing() {
        let p = glyph_repair_prompt("garbled");
        assert!(p.contains("Do not summarize"));
        assert!(p.contains("garbled"));
    }
}

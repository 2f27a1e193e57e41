//! Doctrine normalization.
//!
//! The LLM is asked for canonical record shapes but routinely returns bare
//! strings, objects with missing keys, or domain entries wrapped in
//! `{"name": ...}`. Everything is coerced here into the canonical types;
//! normalization is idempotent.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{Claim, Doctrine, Principle, Rule, Warning};
use crate::domain::{infer_domains, Domain};
use crate::segment::Chapter;
use crate::text::sha256_hex;

/// Maximum domains per chapter.
pub const MAX_DOMAINS: usize = 3;

static THEN_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bTHEN\b").expect("static regex"));

/// One chunk's worth of LLM output. Missing keys deserialize to empty lists.
#[derive(Debug, Default, Deserialize)]
pub struct ChunkDoctrine {
    #[serde(default)]
    pub domains: Vec<Value>,
    #[serde(default)]
    pub principles: Vec<RawPrinciple>,
    #[serde(default)]
    pub rules: Vec<RawRule>,
    #[serde(default)]
    pub claims: Vec<RawClaim>,
    #[serde(default)]
    pub warnings: Vec<RawWarning>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawPrinciple {
    Record {
        #[serde(default)]
        id: Option<String>,
        statement: String,
        #[serde(default)]
        abstracted_from: Option<String>,
    },
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawRule {
    Record {
        #[serde(default)]
        condition: String,
        action: String,
    },
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawClaim {
    Record {
        claim: String,
        #[serde(default)]
        confidence: Option<String>,
    },
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawWarning {
    Record {
        situation: String,
        #[serde(default)]
        risk: Option<String>,
    },
    Text(String),
}

impl From<RawPrinciple> for Principle {
    fn from(raw: RawPrinciple) -> Self {
        match raw {
            RawPrinciple::Record {
                id,
                statement,
                abstracted_from,
            } => Principle {
                id: id.unwrap_or_else(|| sha256_hex(&statement)),
                statement,
                abstracted_from,
            },
            RawPrinciple::Text(statement) => Principle {
                id: sha256_hex(&statement),
                statement,
                abstracted_from: None,
            },
        }
    }
}

impl From<RawRule> for Rule {
    fn from(raw: RawRule) -> Self {
        match raw {
            RawRule::Record { condition, action } => Rule { condition, action },
            RawRule::Text(text) => {
                // A bare rule string splits around a case-insensitive THEN.
                let parts: Vec<&str> = THEN_SPLIT.splitn(&text, 2).collect();
                if parts.len() == 2 {
                    Rule {
                        condition: strip_if_prefix(parts[0].trim()).to_string(),
                        action: parts[1].trim().to_string(),
                    }
                } else {
                    Rule {
                        condition: String::new(),
                        action: text,
                    }
                }
            }
        }
    }
}

fn strip_if_prefix(s: &str) -> &str {
    match s.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("if ") => s[3..].trim_start(),
        _ => s,
    }
}

impl From<RawClaim> for Claim {
    fn from(raw: RawClaim) -> Self {
        match raw {
            RawClaim::Record { claim, confidence } => Claim { claim, confidence },
            RawClaim::Text(claim) => Claim {
                claim,
                confidence: None,
            },
        }
    }
}

impl From<RawWarning> for Warning {
    fn from(raw: RawWarning) -> Self {
        match raw {
            RawWarning::Record { situation, risk } => Warning { situation, risk },
            RawWarning::Text(situation) => Warning {
                situation,
                risk: None,
            },
        }
    }
}

/// Parse a domain entry from LLM output. Accepts `"strategy"` and
/// `{"name": "strategy"}`; anything outside the whitelist is dropped.
fn parse_domain_value(value: &Value) -> Option<Domain> {
    let name = match value {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map.get("name").and_then(|v| v.as_str())?,
        _ => return None,
    };
    match Domain::parse(name) {
        Ok(d) => Some(d),
        Err(_) => {
            debug!("dropping non-whitelisted domain from LLM output: {name}");
            None
        }
    }
}

/// Aggregate parsed chunk outputs into a chapter doctrine.
pub fn from_chunks(chapter: &Chapter, chunk_values: &[Value]) -> Doctrine {
    let mut domains: BTreeSet<Domain> = BTreeSet::new();
    let mut doctrine = Doctrine::empty(chapter.chapter_index, chapter.chapter_title.clone());

    for value in chunk_values {
        let chunk: ChunkDoctrine = match serde_json::from_value(value.clone()) {
            Ok(c) => c,
            Err(e) => {
                debug!("skipping malformed chunk parse: {e}");
                continue;
            }
        };

        domains.extend(chunk.domains.iter().filter_map(parse_domain_value));
        doctrine
            .principles
            .extend(chunk.principles.into_iter().map(Principle::from));
        doctrine.rules.extend(chunk.rules.into_iter().map(Rule::from));
        doctrine.claims.extend(chunk.claims.into_iter().map(Claim::from));
        doctrine
            .warnings
            .extend(chunk.warnings.into_iter().map(Warning::from));
    }

    doctrine.domains = domains.into_iter().take(MAX_DOMAINS).collect();
    normalize(doctrine, &chapter.raw_text)
}

/// Normalize a doctrine: fill missing principle ids, deduplicate every
/// collection preserving first occurrence, and infer domains from the
/// chapter text when the LLM returned none. Idempotent.
pub fn normalize(mut doctrine: Doctrine, raw_text: &str) -> Doctrine {
    for principle in &mut doctrine.principles {
        if principle.id.is_empty() {
            principle.id = sha256_hex(&principle.statement);
        }
    }

    doctrine.principles = dedupe(doctrine.principles);
    doctrine.rules = dedupe(doctrine.rules);
    doctrine.claims = dedupe(doctrine.claims);
    doctrine.warnings = dedupe(doctrine.warnings);

    doctrine.domains.sort();
    doctrine.domains.dedup();
    doctrine.domains.truncate(MAX_DOMAINS);
    if doctrine.domains.is_empty() {
        doctrine.domains = infer_domains(raw_text, MAX_DOMAINS);
    }

    doctrine
}

/// Deterministic order-preserving dedup; the key is the record's canonical
/// JSON encoding.
fn dedupe<T: serde::Serialize>(items: Vec<T>) -> Vec<T> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let key = serde_json::to_string(&item).unwrap_or_default();
        if seen.insert(key) {
            out.push(item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chapter(text: &str) -> Chapter {
        Chapter {
            chapter_index: 1,
            chapter_id: sha256_hex(text),
            chapter_title: None,
            raw_text: text.to_string(),
        }
    }

    #[test]
    fn test_bare_principle_string_coerced() {
        let p: Principle = RawPrinciple::Text("Act decisively".into()).into();
        assert_eq!(p.statement, "Act decisively");
        assert_eq!(p.id, sha256_hex("Act decisively"));
        assert!(p.abstracted_from.is_none());
    }

    #[test]
    fn test_bare_rule_splits_on_then() {
        let r: Rule = RawRule::Text("IF the enemy retreats THEN consolidate gains".into()).into();
        assert_eq!(r.condition, "the enemy retreats");
        assert_eq!(r.action, "consolidate gains");
    }

    #[test]
    fn test_bare_rule_then_case_insensitive() {
        let r: Rule = RawRule::Text("when supply runs low then ration".into()).into();
        assert_eq!(r.condition, "when supply runs low");
        assert_eq!(r.action, "ration");
    }

    #[test]
    fn test_bare_rule_without_then() {
        let r: Rule = RawRule::Text("always scout ahead".into()).into();
        assert_eq!(r.condition, "");
        assert_eq!(r.action, "always scout ahead");
    }

    #[test]
    fn test_bare_claim_and_warning() {
        let c: Claim = RawClaim::Text("morale decides battles".into()).into();
        assert_eq!(c.claim, "morale decides battles");
        assert!(c.confidence.is_none());

        let w: Warning = RawWarning::Text("overextension".into()).into();
        assert_eq!(w.situation, "overextension");
        assert!(w.risk.is_none());
    }

    #[test]
    fn test_chunk_missing_keys_default_empty() {
        let chunk: ChunkDoctrine = serde_json::from_value(json!({"domains": ["risk"]})).unwrap();
        assert!(chunk.principles.is_empty());
        assert!(chunk.rules.is_empty());
        assert_eq!(chunk.domains.len(), 1);
    }

    #[test]
    fn test_domain_object_form_accepted() {
        assert_eq!(
            parse_domain_value(&json!({"name": "power"})),
            Some(Domain::Power)
        );
        assert_eq!(parse_domain_value(&json!("timing")), Some(Domain::Timing));
        assert_eq!(parse_domain_value(&json!("astrology")), None);
        assert_eq!(parse_domain_value(&json!(42)), None);
    }

    #[test]
    fn test_from_chunks_aggregates_and_dedupes() {
        let ch = chapter("some chapter text");
        let chunks = vec![
            json!({
                "domains": ["strategy"],
                "principles": ["Hold the high ground"],
                "rules": [{"condition": "outnumbered", "action": "withdraw"}]
            }),
            json!({
                "domains": ["strategy", "risk"],
                "principles": ["Hold the high ground"],
                "claims": ["speed beats size"]
            }),
        ];

        let doctrine = from_chunks(&ch, &chunks);
        assert_eq!(doctrine.principles.len(), 1);
        assert_eq!(doctrine.rules.len(), 1);
        assert_eq!(doctrine.claims.len(), 1);
        assert_eq!(doctrine.domains, vec![Domain::Risk, Domain::Strategy]);
    }

    #[test]
    fn test_from_chunks_caps_domains() {
        let ch = chapter("text");
        let chunks = vec![json!({
            "domains": ["strategy", "risk", "power", "timing", "truth"]
        })];
        let doctrine = from_chunks(&ch, &chunks);
        assert_eq!(doctrine.domains.len(), MAX_DOMAINS);
    }

    #[test]
    fn test_empty_domains_inferred_from_text() {
        let ch = chapter("the risk of battle against a stronger enemy");
        let doctrine = from_chunks(&ch, &[json!({"principles": ["p"]})]);
        assert!(!doctrine.domains.is_empty());
    }

    #[test]
    fn test_inference_defaults_to_strategy() {
        let ch = chapter("lorem ipsum dolor");
        let doctrine = from_chunks(&ch, &[json!({})]);
        assert_eq!(doctrine.domains, vec![Domain::Strategy]);
    }

    #[test]
    fn test_normalize_idempotent() {
        let ch = chapter("the strategy of conflict");
        let chunks = vec![json!({
            "domains": ["conflict"],
            "principles": ["a", "b", "a"],
            "rules": ["IF x THEN y", "plain rule"],
            "claims": [{"claim": "c", "confidence": "high"}],
            "warnings": ["w"]
        })];
        let once = from_chunks(&ch, &chunks);
        let twice = normalize(once.clone(), &ch.raw_text);

        assert_eq!(
            serde_json::to_value(&once).unwrap(),
            serde_json::to_value(&twice).unwrap()
        );
    }

    #[test]
    fn test_dedupe_preserves_first_occurrence() {
        let items = vec![
            Claim { claim: "a".into(), confidence: Some("high".into()) },
            Claim { claim: "b".into(), confidence: None },
            Claim { claim: "a".into(), confidence: Some("high".into()) },
        ];
        let out = dedupe(items);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].claim, "a");
        assert_eq!(out[1].claim, "b");
    }

    #[test]
    fn test_malformed_chunk_skipped() {
        let ch = chapter("text about strategy");
        let chunks = vec![
            json!("not an object"),
            json!({"principles": ["kept"]}),
        ];
        let doctrine = from_chunks(&ch, &chunks);
        assert_eq!(doctrine.principles.len(), 1);
    }
}

//! The closed domain whitelist.
//!
//! Every domain-tagged record in the system validates against this set.
//! Adding or removing a member is an API break for downstream consumers,
//! which read the per-domain consolidation files directly.

use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// Semantic partition used for both aggregation and vector indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Adaptation,
    Base,
    Conflict,
    Constraints,
    Data,
    Diplomacy,
    Discipline,
    Executor,
    Legitimacy,
    Optionality,
    Power,
    Psychology,
    Registry,
    Risk,
    Strategy,
    Technology,
    Timing,
    Truth,
    KeyConstr,
}

impl Domain {
    pub const ALL: [Domain; 19] = [
        Domain::Adaptation,
        Domain::Base,
        Domain::Conflict,
        Domain::Constraints,
        Domain::Data,
        Domain::Diplomacy,
        Domain::Discipline,
        Domain::Executor,
        Domain::Legitimacy,
        Domain::Optionality,
        Domain::Power,
        Domain::Psychology,
        Domain::Registry,
        Domain::Risk,
        Domain::Strategy,
        Domain::Technology,
        Domain::Timing,
        Domain::Truth,
        Domain::KeyConstr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Adaptation => "adaptation",
            Domain::Base => "base",
            Domain::Conflict => "conflict",
            Domain::Constraints => "constraints",
            Domain::Data => "data",
            Domain::Diplomacy => "diplomacy",
            Domain::Discipline => "discipline",
            Domain::Executor => "executor",
            Domain::Legitimacy => "legitimacy",
            Domain::Optionality => "optionality",
            Domain::Power => "power",
            Domain::Psychology => "psychology",
            Domain::Registry => "registry",
            Domain::Risk => "risk",
            Domain::Strategy => "strategy",
            Domain::Technology => "technology",
            Domain::Timing => "timing",
            Domain::Truth => "truth",
            Domain::KeyConstr => "key_constr",
        }
    }

    /// Parse a domain name, rejecting anything outside the whitelist.
    pub fn parse(s: &str) -> Result<Domain, IngestError> {
        let trimmed = s.trim().to_lowercase();
        Domain::ALL
            .iter()
            .find(|d| d.as_str() == trimmed)
            .copied()
            .ok_or_else(|| IngestError::DomainInvalid(s.to_string()))
    }

    /// Keywords used for fallback domain inference when the LLM returns an
    /// empty domain list.
    fn keywords(&self) -> &'static [&'static str] {
        match self {
            Domain::Adaptation => &["adapt", "adjust", "flexib", "evolve", "change course"],
            Domain::Base => &["foundation", "fundament", "basis", "groundwork"],
            Domain::Conflict => &["conflict", "battle", "enemy", "attack", "war", "fight"],
            Domain::Constraints => &["constraint", "limit", "scarcity", "bound", "restriction"],
            Domain::Data => &["data", "information", "intelligence", "measure", "signal"],
            Domain::Diplomacy => &["ally", "alliance", "negotiat", "diplomac", "treaty"],
            Domain::Discipline => &["discipline", "training", "drill", "habit", "order"],
            Domain::Executor => &["execute", "implement", "carry out", "operation"],
            Domain::Legitimacy => &["legitimacy", "authority", "mandate", "consent"],
            Domain::Optionality => &["option", "alternative", "reserve", "fallback", "hedge"],
            Domain::Power => &["power", "dominan", "control", "influence", "leverage"],
            Domain::Psychology => &["psycholog", "morale", "fear", "perception", "mind"],
            Domain::Registry => &["record", "registry", "ledger", "account", "inventory"],
            Domain::Risk => &["risk", "danger", "hazard", "exposure", "threat"],
            Domain::Strategy => &["strategy", "strategic", "plan", "objective", "campaign"],
            Domain::Technology => &["technology", "tool", "machine", "weapon", "invention"],
            Domain::Timing => &["timing", "moment", "opportunity", "delay", "season"],
            Domain::Truth => &["truth", "deception", "honesty", "lie", "reality"],
            Domain::KeyConstr => &["key constraint", "bottleneck", "critical path"],
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Infer up to `max_domains` domains from raw text by keyword counting.
///
/// Falls back to `strategy` when nothing matches, so inferred domain lists
/// are never empty.
pub fn infer_domains(text: &str, max_domains: usize) -> Vec<Domain> {
    let lowered = text.to_lowercase();
    let mut scores: Vec<(Domain, usize)> = Vec::new();

    for domain in Domain::ALL {
        let score: usize = domain
            .keywords()
            .iter()
            .map(|kw| lowered.matches(kw).count())
            .sum();
        if score > 0 {
            scores.push((domain, score));
        }
    }

    if scores.is_empty() {
        return vec![Domain::Strategy];
    }

    scores.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    scores.into_iter().take(max_domains).map(|(d, _)| d).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_whitelisted() {
        assert_eq!(Domain::parse("strategy").unwrap(), Domain::Strategy);
        assert_eq!(Domain::parse("key_constr").unwrap(), Domain::KeyConstr);
        assert_eq!(Domain::parse("  Timing ").unwrap(), Domain::Timing);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(Domain::parse("astrology").is_err());
        assert!(Domain::parse("").is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let json = serde_json::to_string(&Domain::KeyConstr).unwrap();
        assert_eq!(json, "\"key_constr\"");
        let back: Domain = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Domain::KeyConstr);
    }

    #[test]
    fn test_infer_matches_keywords() {
        let text = "The risk of attack grows when the enemy controls the timing of battle.";
        let domains = infer_domains(text, 3);
        assert!(domains.len() <= 3);
        assert!(domains.contains(&Domain::Conflict));
    }

    #[test]
    fn test_infer_defaults_to_strategy() {
        let domains = infer_domains("lorem ipsum dolor sit amet", 3);
        assert_eq!(domains, vec![Domain::Strategy]);
    }

    #[test]
    fn test_infer_never_exceeds_max() {
        let text = "strategy risk power timing truth data conflict discipline";
        assert!(infer_domains(text, 3).len() <= 3);
    }
}

//! Atomic doctrine nodes.
//!
//! Every principle, rule, warning, and claim becomes an individually
//! addressable node with a stable id of the form
//! `<BOOK>-C<chapter:02>-<TypeLetter>-<seq:03>`. Principles, rules, and
//! claims are embedded; warnings are stored but not embedded.

use serde::{Deserialize, Serialize};

use crate::doctrine::Doctrine;
use crate::domain::Domain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Principle,
    Rule,
    Warning,
    Claim,
}

impl NodeType {
    pub fn letter(&self) -> char {
        match self {
            NodeType::Principle => 'P',
            NodeType::Rule => 'R',
            NodeType::Warning => 'W',
            NodeType::Claim => 'L',
        }
    }

    /// Warnings are stored but never embedded.
    pub fn is_embeddable(&self) -> bool {
        !matches!(self, NodeType::Warning)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub chapter: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Domain>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abstracted_from: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub text: String,
    pub metadata: NodeMetadata,
}

/// An embedded node as persisted in `03_embeddings.json` and scored by the
/// commit engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedNode {
    pub embedding_id: String,
    pub node_id: String,
    pub node_type: NodeType,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: NodeMetadata,
}

/// Convert a chapter doctrine into nodes.
///
/// Sequence numbers are monotonically increasing per type within the
/// chapter, so node ids are unique within a book as long as chapter indices
/// are unique.
pub fn to_nodes(doctrine: &Doctrine, book_prefix: &str) -> Vec<Node> {
    let book = book_prefix.replace(['\n', '\r'], "").to_uppercase();
    let chapter = doctrine.chapter_index;
    let primary_domain = doctrine.domains.first().copied();
    let mut nodes = Vec::with_capacity(doctrine.item_count());

    let make_id = |node_type: NodeType, seq: usize| {
        format!("{book}-C{chapter:02}-{}-{seq:03}", node_type.letter())
    };

    for (i, principle) in doctrine.principles.iter().enumerate() {
        nodes.push(Node {
            node_id: make_id(NodeType::Principle, i + 1),
            node_type: NodeType::Principle,
            text: principle.statement.clone(),
            metadata: NodeMetadata {
                chapter,
                domain: primary_domain,
                confidence: None,
                abstracted_from: principle.abstracted_from.clone(),
            },
        });
    }

    for (i, rule) in doctrine.rules.iter().enumerate() {
        nodes.push(Node {
            node_id: make_id(NodeType::Rule, i + 1),
            node_type: NodeType::Rule,
            text: format!("IF {} THEN {}", rule.condition, rule.action),
            metadata: NodeMetadata {
                chapter,
                domain: primary_domain,
                ..Default::default()
            },
        });
    }

    for (i, warning) in doctrine.warnings.iter().enumerate() {
        nodes.push(Node {
            node_id: make_id(NodeType::Warning, i + 1),
            node_type: NodeType::Warning,
            text: format!(
                "SITUATION: {}. RISK: {}",
                warning.situation,
                warning.risk.as_deref().unwrap_or("")
            ),
            metadata: NodeMetadata {
                chapter,
                domain: primary_domain,
                ..Default::default()
            },
        });
    }

    for (i, claim) in doctrine.claims.iter().enumerate() {
        nodes.push(Node {
            node_id: make_id(NodeType::Claim, i + 1),
            node_type: NodeType::Claim,
            text: format!("CLAIM: {}", claim.claim),
            metadata: NodeMetadata {
                chapter,
                domain: primary_domain,
                confidence: claim.confidence.clone(),
                ..Default::default()
            },
        });
    }

    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doctrine::{Claim, Principle, Rule, Warning};
    use std::sync::LazyLock;

    use regex::Regex;

    static NODE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^[A-Z0-9_\-]+-C\d{2}-[PRWL]-\d{3}$").unwrap()
    });

    fn doctrine() -> Doctrine {
        Doctrine {
            chapter_index: 3,
            chapter_title: None,
            domains: vec![Domain::Power, Domain::Risk],
            principles: vec![Principle {
                id: "p".into(),
                statement: "Concentrate force at the decisive point".into(),
                abstracted_from: Some("campaign history".into()),
            }],
            rules: vec![
                Rule {
                    condition: "the enemy divides".into(),
                    action: "strike each part in turn".into(),
                },
                Rule {
                    condition: "supply lines thin".into(),
                    action: "shorten the front".into(),
                },
            ],
            claims: vec![Claim {
                claim: "speed multiplies force".into(),
                confidence: Some("medium".into()),
            }],
            warnings: vec![Warning {
                situation: "long sieges".into(),
                risk: Some("exhausted reserves".into()),
            }],
            meta: None,
        }
    }

    #[test]
    fn test_node_ids_canonical_format() {
        let nodes = to_nodes(&doctrine(), "artofwar");
        for node in &nodes {
            assert!(
                NODE_ID_RE.is_match(&node.node_id),
                "bad node id: {}",
                node.node_id
            );
            assert!(node.node_id.starts_with("ARTOFWAR-C03-"));
        }
    }

    #[test]
    fn test_sequences_per_type() {
        let nodes = to_nodes(&doctrine(), "BOOK");
        let rule_ids: Vec<&str> = nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Rule)
            .map(|n| n.node_id.as_str())
            .collect();
        assert_eq!(rule_ids, vec!["BOOK-C03-R-001", "BOOK-C03-R-002"]);
    }

    #[test]
    fn test_node_ids_unique() {
        let nodes = to_nodes(&doctrine(), "BOOK");
        let mut ids: Vec<&String> = nodes.iter().map(|n| &n.node_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), nodes.len());
    }

    #[test]
    fn test_text_synthesis() {
        let nodes = to_nodes(&doctrine(), "BOOK");
        let rule = nodes.iter().find(|n| n.node_type == NodeType::Rule).unwrap();
        assert_eq!(rule.text, "IF the enemy divides THEN strike each part in turn");

        let warning = nodes.iter().find(|n| n.node_type == NodeType::Warning).unwrap();
        assert_eq!(warning.text, "SITUATION: long sieges. RISK: exhausted reserves");

        let claim = nodes.iter().find(|n| n.node_type == NodeType::Claim).unwrap();
        assert_eq!(claim.text, "CLAIM: speed multiplies force");
    }

    #[test]
    fn test_embeddable_filter_excludes_warnings() {
        let nodes = to_nodes(&doctrine(), "BOOK");
        let embeddable: Vec<_> = nodes.iter().filter(|n| n.node_type.is_embeddable()).collect();
        assert_eq!(embeddable.len(), 4);
        assert!(embeddable.iter().all(|n| n.node_type != NodeType::Warning));
    }

    #[test]
    fn test_primary_domain_tagged() {
        let nodes = to_nodes(&doctrine(), "BOOK");
        assert!(nodes.iter().all(|n| n.metadata.domain == Some(Domain::Power)));
    }

    #[test]
    fn test_claim_confidence_carried() {
        let nodes = to_nodes(&doctrine(), "BOOK");
        let claim = nodes.iter().find(|n| n.node_type == NodeType::Claim).unwrap();
        assert_eq!(claim.metadata.confidence.as_deref(), Some("medium"));
    }

    #[test]
    fn test_empty_doctrine_no_nodes() {
        let empty = Doctrine::empty(1, None);
        assert!(to_nodes(&empty, "BOOK").is_empty());
    }
}

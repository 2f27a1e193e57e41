//! Per-domain doctrine consolidation ("minister" files).
//!
//! Each domain owns four consolidated category files plus a summary. Every
//! mutation goes through a temp-file + rename, so a crash at any point
//! leaves either the old or the new document on disk, never partial JSON.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::doctrine::Doctrine;
use crate::domain::Domain;
use crate::error::IngestError;
use crate::store::Category;

pub const COMBINED_INDEX_FILE: &str = "combined_vector.index";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub book: String,
    pub chapter: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryEntry {
    pub id: Uuid,
    pub text: String,
    pub source: SourceRef,
    pub weight: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryMeta {
    pub total_entries: usize,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub aggregated_from: Vec<SourceRef>,
}

/// One consolidated `(domain, category)` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryFile {
    pub domain: Domain,
    pub category: Category,
    pub entries: Vec<CategoryEntry>,
    pub meta: CategoryMeta,
}

impl CategoryFile {
    fn empty(domain: Domain, category: Category) -> Self {
        Self {
            domain,
            category,
            entries: vec![],
            meta: CategoryMeta::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionSummary {
    pub status: String,
    pub total_chapters_processed: usize,
    pub total_entries_created: usize,
    pub domains_populated: usize,
    pub domain_statistics: BTreeMap<String, usize>,
}

/// Owns the ministers directory. All writes to a given `(domain, category)`
/// file funnel through one instance (the aggregator task), which serializes
/// them.
pub struct MinisterWriter {
    ministers_root: PathBuf,
}

impl MinisterWriter {
    pub fn new(data_root: &Path) -> Self {
        Self {
            ministers_root: data_root.join("ministers"),
        }
    }

    pub fn domain_path(&self, domain: Domain) -> PathBuf {
        self.ministers_root.join(domain.as_str())
    }

    fn category_path(&self, domain: Domain, category: Category) -> PathBuf {
        self.domain_path(domain).join(format!("{}.json", category.as_str()))
    }

    /// Create the full structure for a domain: the four consolidated
    /// category files plus a `doctrine.json` summary.
    pub fn ensure_structure(&self, domain: Domain) -> Result<(), IngestError> {
        let domain_dir = self.domain_path(domain);
        fs::create_dir_all(&domain_dir)?;

        for category in Category::CONSOLIDATED {
            let path = self.category_path(domain, category);
            if !path.exists() {
                atomic_write_json(&path, &CategoryFile::empty(domain, category))?;
            }
        }

        let doctrine_path = domain_dir.join("doctrine.json");
        if !doctrine_path.exists() {
            atomic_write_json(
                &doctrine_path,
                &serde_json::json!({
                    "domain": domain.as_str(),
                    "type": "domain_summary",
                    "consolidated": true,
                    "meta": {"total_entries": 0, "last_updated": null}
                }),
            )?;
        }

        Ok(())
    }

    /// Append one entry to a consolidated category file.
    #[allow(dead_code)]
    pub fn add_category_entry(
        &self,
        domain: Domain,
        category: Category,
        text: &str,
        book: &str,
        chapter: usize,
        weight: f32,
    ) -> Result<Uuid, IngestError> {
        let ids = self.add_category_entries(
            domain,
            category,
            &[(text.to_string(), book.to_string(), chapter, weight)],
        )?;
        Ok(ids[0])
    }

    /// Append a batch of entries in a single load + atomic write.
    pub fn add_category_entries(
        &self,
        domain: Domain,
        category: Category,
        entries: &[(String, String, usize, f32)],
    ) -> Result<Vec<Uuid>, IngestError> {
        self.ensure_structure(domain)?;
        let path = self.category_path(domain, category);
        let mut file = load_category_file(&path, domain, category);

        let mut ids = Vec::with_capacity(entries.len());
        for (text, book, chapter, weight) in entries {
            let id = Uuid::new_v4();
            ids.push(id);
            file.entries.push(CategoryEntry {
                id,
                text: text.clone(),
                source: SourceRef {
                    book: book.clone(),
                    chapter: *chapter,
                },
                weight: *weight,
            });
            let source = SourceRef {
                book: book.clone(),
                chapter: *chapter,
            };
            if !file.meta.aggregated_from.contains(&source) {
                file.meta.aggregated_from.push(source);
            }
        }

        file.meta.total_entries = file.entries.len();
        file.meta.last_updated = Some(Utc::now());

        atomic_write_json(&path, &file)?;
        Ok(ids)
    }

    /// Convert one chapter's doctrine into entries under each of its
    /// domains.
    pub fn process_chapter(
        &self,
        doctrine: &Doctrine,
        book: &str,
    ) -> Result<BTreeMap<Domain, Vec<Uuid>>, IngestError> {
        let chapter = doctrine.chapter_index;
        let mut created: BTreeMap<Domain, Vec<Uuid>> = BTreeMap::new();

        for &domain in &doctrine.domains {
            self.ensure_structure(domain)?;
            let mut ids = Vec::new();

            let principles: Vec<_> = doctrine
                .principles
                .iter()
                .map(|p| (p.statement.clone(), book.to_string(), chapter, 1.0))
                .collect();
            ids.extend(self.add_category_entries(domain, Category::Principles, &principles)?);

            let rules: Vec<_> = doctrine
                .rules
                .iter()
                .map(|r| {
                    (
                        format!("IF {} THEN {}", r.condition, r.action),
                        book.to_string(),
                        chapter,
                        1.0,
                    )
                })
                .collect();
            ids.extend(self.add_category_entries(domain, Category::Rules, &rules)?);

            let claims: Vec<_> = doctrine
                .claims
                .iter()
                .map(|c| (c.claim.clone(), book.to_string(), chapter, 1.0))
                .collect();
            ids.extend(self.add_category_entries(domain, Category::Claims, &claims)?);

            let warnings: Vec<_> = doctrine
                .warnings
                .iter()
                .map(|w| {
                    (
                        format!(
                            "SITUATION: {}. RISK: {}",
                            w.situation,
                            w.risk.as_deref().unwrap_or("")
                        ),
                        book.to_string(),
                        chapter,
                        1.0,
                    )
                })
                .collect();
            ids.extend(self.add_category_entries(domain, Category::Warnings, &warnings)?);

            created.insert(domain, ids);
        }

        Ok(created)
    }

    /// Convert every doctrine of a book. Chapters whose conversion fails
    /// are logged and skipped; the summary reflects what landed.
    pub fn convert_all(&self, doctrines: &[Doctrine], book: &str) -> ConversionSummary {
        let mut total_entries = 0usize;
        let mut domain_statistics: BTreeMap<String, usize> = BTreeMap::new();

        for doctrine in doctrines {
            match self.process_chapter(doctrine, book) {
                Ok(created) => {
                    for (domain, ids) in created {
                        *domain_statistics.entry(domain.as_str().to_string()).or_default() +=
                            ids.len();
                        total_entries += ids.len();
                    }
                }
                Err(e) => {
                    debug!(
                        "minister conversion failed for chapter {}: {e}",
                        doctrine.chapter_index
                    );
                }
            }
        }

        ConversionSummary {
            status: "success".into(),
            total_chapters_processed: doctrines.len(),
            total_entries_created: total_entries,
            domains_populated: domain_statistics.len(),
            domain_statistics,
        }
    }

    /// Rebuild `combined_vector.index` from the consolidated files on disk.
    pub fn update_combined_index(&self, data_root: &Path) -> Result<(), IngestError> {
        let mut domains: Vec<String> = Vec::new();
        let mut domain_statistics: BTreeMap<String, Value> = BTreeMap::new();
        let mut total_entries = 0usize;

        for domain in Domain::ALL {
            let domain_dir = self.domain_path(domain);
            if !domain_dir.is_dir() {
                continue;
            }

            let mut entry_count = 0usize;
            let mut last_updated: Option<DateTime<Utc>> = None;
            for category in Category::CONSOLIDATED {
                let path = self.category_path(domain, category);
                let Ok(content) = fs::read_to_string(&path) else {
                    continue;
                };
                let Ok(file) = serde_json::from_str::<CategoryFile>(&content) else {
                    continue;
                };
                entry_count += file.entries.len();
                if let Some(updated) = file.meta.last_updated
                    && last_updated.is_none_or(|prev| updated > prev)
                {
                    last_updated = Some(updated);
                }
            }

            if entry_count > 0 {
                total_entries += entry_count;
                domain_statistics.insert(
                    domain.as_str().to_string(),
                    serde_json::json!({
                        "total_entries": entry_count,
                        "last_updated": last_updated,
                    }),
                );
                domains.push(domain.as_str().to_string());
            }
        }

        let index = serde_json::json!({
            "domain": "all",
            "combined": true,
            "domains_included": domains,
            "domain_statistics": domain_statistics,
            "metadata": {
                "created": Utc::now(),
                "total_domains": domain_statistics.len(),
                "total_entries": total_entries,
            }
        });

        atomic_write_json(&data_root.join(COMBINED_INDEX_FILE), &index)
    }
}

fn load_category_file(path: &Path, domain: Domain, category: Category) -> CategoryFile {
    fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_else(|| CategoryFile::empty(domain, category))
}

/// Write JSON via temp file + rename. The destination is either the old
/// valid document or the new valid document, never partial.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), IngestError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let tmp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let json = serde_json::to_string_pretty(value)?;

    fs::write(&tmp, json).map_err(|source| IngestError::DiskWriteFailed {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| {
        let _ = fs::remove_file(&tmp);
        IngestError::DiskWriteFailed {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doctrine::{Claim, Principle, Rule, Warning};
    use tempfile::tempdir;

    fn sample_doctrine() -> Doctrine {
        Doctrine {
            chapter_index: 2,
            chapter_title: None,
            domains: vec![Domain::Strategy, Domain::Risk],
            principles: vec![Principle {
                id: "p1".into(),
                statement: "Keep reserves".into(),
                abstracted_from: None,
            }],
            rules: vec![Rule {
                condition: "flank exposed".into(),
                action: "refuse the flank".into(),
            }],
            claims: vec![Claim {
                claim: "terrain decides".into(),
                confidence: None,
            }],
            warnings: vec![Warning {
                situation: "night marches".into(),
                risk: Some("disorder".into()),
            }],
            meta: None,
        }
    }

    #[test]
    fn test_ensure_structure_creates_files() {
        let dir = tempdir().unwrap();
        let writer = MinisterWriter::new(dir.path());
        writer.ensure_structure(Domain::Power).unwrap();

        for name in ["principles", "rules", "claims", "warnings"] {
            let path = dir.path().join("ministers/power").join(format!("{name}.json"));
            assert!(path.exists(), "missing {name}.json");
            let file: CategoryFile =
                serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
            assert_eq!(file.meta.total_entries, 0);
        }
        assert!(dir.path().join("ministers/power/doctrine.json").exists());
    }

    #[test]
    fn test_add_entry_updates_meta() {
        let dir = tempdir().unwrap();
        let writer = MinisterWriter::new(dir.path());

        writer
            .add_category_entry(Domain::Timing, Category::Rules, "IF a THEN b", "book", 3, 1.0)
            .unwrap();
        writer
            .add_category_entry(Domain::Timing, Category::Rules, "IF c THEN d", "book", 3, 1.0)
            .unwrap();

        let path = dir.path().join("ministers/timing/rules.json");
        let file: CategoryFile = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(file.entries.len(), 2);
        assert_eq!(file.meta.total_entries, 2);
        assert!(file.meta.last_updated.is_some());
        // same source recorded once
        assert_eq!(file.meta.aggregated_from.len(), 1);
    }

    #[test]
    fn test_process_chapter_fans_out_per_domain() {
        let dir = tempdir().unwrap();
        let writer = MinisterWriter::new(dir.path());

        let created = writer.process_chapter(&sample_doctrine(), "mybook").unwrap();
        assert_eq!(created.len(), 2);
        // 4 items per domain
        assert_eq!(created[&Domain::Strategy].len(), 4);
        assert_eq!(created[&Domain::Risk].len(), 4);

        let path = dir.path().join("ministers/risk/warnings.json");
        let file: CategoryFile = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(file.entries[0].text.contains("SITUATION: night marches"));
    }

    #[test]
    fn test_convert_all_summary() {
        let dir = tempdir().unwrap();
        let writer = MinisterWriter::new(dir.path());

        let summary = writer.convert_all(&[sample_doctrine()], "mybook");
        assert_eq!(summary.status, "success");
        assert_eq!(summary.total_chapters_processed, 1);
        assert_eq!(summary.total_entries_created, 8);
        assert_eq!(summary.domains_populated, 2);
    }

    #[test]
    fn test_combined_index_counts() {
        let dir = tempdir().unwrap();
        let writer = MinisterWriter::new(dir.path());
        writer.convert_all(&[sample_doctrine()], "mybook");
        writer.update_combined_index(dir.path()).unwrap();

        let index: Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join(COMBINED_INDEX_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(index["metadata"]["total_entries"], 8);
        assert_eq!(index["metadata"]["total_domains"], 2);
        assert!(index["domains_included"]
            .as_array()
            .unwrap()
            .iter()
            .any(|d| d == "strategy"));
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.json");
        atomic_write_json(&path, &serde_json::json!({"ok": true})).unwrap();
        atomic_write_json(&path, &serde_json::json!({"ok": false})).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["out.json"]);

        let value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["ok"], false);
    }

    #[test]
    fn test_reload_preserves_existing_entries() {
        let dir = tempdir().unwrap();
        {
            let writer = MinisterWriter::new(dir.path());
            writer
                .add_category_entry(Domain::Truth, Category::Claims, "first", "b", 1, 1.0)
                .unwrap();
        }
        let writer = MinisterWriter::new(dir.path());
        writer
            .add_category_entry(Domain::Truth, Category::Claims, "second", "b", 2, 1.0)
            .unwrap();

        let path = dir.path().join("ministers/truth/claims.json");
        let file: CategoryFile = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(file.entries.len(), 2);
        assert_eq!(file.meta.aggregated_from.len(), 2);
    }
}

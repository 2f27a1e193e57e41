//! End-to-end CLI tests using `assert_cmd`.
//!
//! These tests invoke the actual compiled binary and verify exit codes
//! and output. They do NOT require Ollama to be running (except tests
//! marked #[ignore]).

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn cmd() -> Command {
    Command::cargo_bin("doctrina").unwrap()
}

// ─── Help / version ─────────────────────────────────────────────────────

#[test]
fn test_help_shows_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("ingest"))
        .stdout(predicate::str::contains("search"))
        .stdout(predicate::str::contains("stats"));
}

#[test]
fn test_version_shows_name() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("doctrina"));
}

// ─── Ingest subcommand argument validation ──────────────────────────────

#[test]
fn test_ingest_help() {
    cmd()
        .args(["ingest", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("PATH"))
        .stdout(predicate::str::contains("--fresh"))
        .stdout(predicate::str::contains("--workers"))
        .stdout(predicate::str::contains("OLLAMA_EXTRACT_MODEL"));
}

#[test]
fn test_ingest_requires_path() {
    cmd()
        .arg("ingest")
        .assert()
        .failure()
        .stderr(predicate::str::contains("PATH"));
}

#[test]
fn test_ingest_unreadable_pdf_fails() {
    let dir = tempdir().unwrap();
    let bogus = dir.path().join("not_really.pdf");
    std::fs::write(&bogus, "this is not a pdf").unwrap();

    cmd()
        .arg("ingest")
        .arg(&bogus)
        .current_dir(dir.path())
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .failure();
}

#[test]
fn test_ingest_empty_folder_succeeds() {
    let dir = tempdir().unwrap();

    cmd()
        .arg("ingest")
        .arg(dir.path())
        .current_dir(dir.path())
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success();
}

// ─── Search subcommand ──────────────────────────────────────────────────

#[test]
fn test_search_help() {
    cmd()
        .args(["search", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("QUERY"))
        .stdout(predicate::str::contains("--domain"))
        .stdout(predicate::str::contains("--topk"));
}

#[test]
fn test_search_requires_query() {
    cmd()
        .arg("search")
        .assert()
        .failure()
        .stderr(predicate::str::contains("QUERY"));
}

#[test]
fn test_search_rejects_unknown_domain() {
    let dir = tempdir().unwrap();
    cmd()
        .args(["search", "anything", "--domain", "astrology"])
        .current_dir(dir.path())
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .failure()
        .stderr(predicate::str::contains("domain"));
}

// ─── Stats subcommand ───────────────────────────────────────────────────

#[test]
fn test_stats_without_data_reports_empty() {
    let dir = tempdir().unwrap();
    cmd()
        .arg("stats")
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("No combined index"));
}

// ─── Integration (requires Ollama) ──────────────────────────────────────

#[test]
#[ignore] // Run with: cargo test -- --ignored
fn test_search_with_ollama() {
    let dir = tempdir().unwrap();
    cmd()
        .args(["search", "strategy of conflict"])
        .current_dir(dir.path())
        .timeout(std::time::Duration::from_secs(120))
        .assert()
        .success()
        .stdout(predicate::str::contains("Searching for"));
}

//! Binary-level CLI tests (offline paths only)

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn bin(index_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("llm-semantic").unwrap();
    cmd.arg("--index-dir").arg(index_dir.path().join(".llm-index"));
    // Keep host configuration out of the tests
    cmd.env_remove("LLM_SEMANTIC_API_URL")
        .env_remove("LLM_SEMANTIC_MODEL")
        .env_remove("LLM_SEMANTIC_API_KEY")
        .env_remove("QDRANT_COLLECTION");
    cmd
}

#[test]
fn test_help_lists_core_commands() {
    Command::cargo_bin("llm-semantic")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("index"))
        .stdout(predicate::str::contains("search"))
        .stdout(predicate::str::contains("multisearch"))
        .stdout(predicate::str::contains("memory"))
        .stdout(predicate::str::contains("collection"));
}

#[test]
fn test_completions_generate() {
    Command::cargo_bin("llm-semantic")
        .unwrap()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("llm-semantic"));
}

#[test]
fn test_index_status_on_fresh_dir() {
    let dir = TempDir::new().unwrap();
    bin(&dir)
        .args(["index-status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"chunks_total\":0"));
}

#[test]
fn test_invalid_fusion_alpha_json_envelope() {
    let dir = TempDir::new().unwrap();
    bin(&dir)
        .args(["search", "query", "--hybrid", "--fusion-alpha", "2.0", "--json"])
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("\"error\":true"))
        .stdout(predicate::str::contains("invalid_input"));
}

#[test]
fn test_min_mode_error_envelope() {
    let dir = TempDir::new().unwrap();
    bin(&dir)
        .args(["search", "query", "--hybrid", "--fusion-alpha=-1", "--min"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"err\":true"))
        .stdout(predicate::str::contains("\"msg\""));
}

#[test]
fn test_unreachable_provider_is_provider_error() {
    let dir = TempDir::new().unwrap();
    bin(&dir)
        .args([
            "search",
            "query",
            "--json",
            "--api-url",
            "http://127.0.0.1:1/v1",
        ])
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("\"kind\":\"provider\""));
}

#[test]
fn test_unknown_profile_rejected() {
    let dir = TempDir::new().unwrap();
    bin(&dir)
        .args(["search", "query", "--profiles", "nonsense", "--json"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("invalid_input"));
}

#[test]
fn test_prune_log_range_validation() {
    let dir = TempDir::new().unwrap();
    bin(&dir)
        .args(["memory", "prune-log", "--older-than", "0", "--json"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("invalid_input"));
}

#[test]
fn test_collection_delete_unknown_profile() {
    let dir = TempDir::new().unwrap();
    bin(&dir)
        .args(["collection", "delete", "--profile", "bogus", "--force", "--json"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("invalid_input"));
}

#[test]
fn test_unknown_embedder_rejected() {
    let dir = TempDir::new().unwrap();
    bin(&dir)
        .args(["index-status", "--embedder", "nonsense", "--json"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("unknown embedder"));
}

#[test]
fn test_config_missing_semantic_section() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("bad.yaml");
    std::fs::write(&config, "wrong:\n  key: 1\n").unwrap();
    bin(&dir)
        .arg("--config")
        .arg(&config)
        .args(["index-status", "--json"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("configuration"));
}

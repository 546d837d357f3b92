use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "Alpha Document\n\nThis is the alpha document about Rust programming and the cargo build tool. \
         It explains how crates are published to the public registry by maintainers.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.txt"),
        "Beta Document\n\nThis document discusses Python and machine learning with large datasets. \
         Deep learning frameworks like PyTorch are covered in the later sections.",
    )
    .unwrap();

    let kb_dir = root.join("kb");
    fs::create_dir_all(&kb_dir).unwrap();
    fs::write(
        kb_dir.join("gamma.txt"),
        "Gamma Notes\n\nContains notes about deployment and infrastructure for the platform team. \
         Kubernetes and Docker are mentioned here along with rollout tips.",
    )
    .unwrap();

    let config_content = format!(
        r#"[storage]
data_dir = "{root}/data"

[embedding]
provider = "hash"
dims = 64

[chunking]
chunk_size = 40
chunk_overlap = 5
min_chunk_size = 10

[knowledge_base]
enabled = true
root = "{root}/kb"
collection = "kb"

[logging]
level = "warn"
"#,
        root = root.display()
    );
    let config_path = root.join("srag.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_srag(config_path: &Path, args: &[&str]) -> (Value, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_srag"))
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .expect("failed to run srag");
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let json = serde_json::from_str(&stdout)
        .unwrap_or_else(|e| panic!("stdout is not JSON ({}): {}", e, stdout));
    (json, output.status.success())
}

#[test]
fn test_ingest_search_get_delete() {
    let (tmp, config) = setup_test_env();
    let alpha = tmp.path().join("files/alpha.md");
    let beta = tmp.path().join("files/beta.txt");

    let (out, ok) = run_srag(&config, &["ingest", alpha.to_str().unwrap(), "--tags", "rust,docs"]);
    assert!(ok, "{}", out);
    assert_eq!(out["status"], "indexed");
    assert_eq!(out["title"], "Alpha Document");
    let alpha_id = out["doc_id"].as_str().unwrap().to_string();

    let (out, ok) = run_srag(&config, &["ingest", beta.to_str().unwrap()]);
    assert!(ok);
    let beta_id = out["doc_id"].as_str().unwrap().to_string();

    let (out, ok) = run_srag(&config, &["search", "rust cargo crates", "--top-k", "1"]);
    assert!(ok);
    assert_eq!(out["results"].as_array().unwrap().len(), 1);
    assert_eq!(out["results"][0]["doc_id"], alpha_id.as_str());
    assert!(out["results"][0].get("full_text").is_none());

    let (out, ok) = run_srag(&config, &["get", &beta_id]);
    assert!(ok);
    assert!(out["documents"][0]["full_text"]
        .as_str()
        .unwrap()
        .contains("PyTorch"));

    let (out, ok) = run_srag(&config, &["chunk", &alpha_id, "--index", "0"]);
    assert!(ok);
    assert_eq!(out["chunk_index"], 0);

    let (out, ok) = run_srag(&config, &["delete", &alpha_id]);
    assert!(ok);
    assert_eq!(out["deleted"], true);
    let (out, _) = run_srag(&config, &["delete", &alpha_id]);
    assert_eq!(out["deleted"], false);

    let (out, ok) = run_srag(&config, &["stats"]);
    assert!(ok);
    assert_eq!(out["document_count"], 1);
}

#[test]
fn test_errors_are_structured() {
    let (_tmp, config) = setup_test_env();

    let (out, ok) = run_srag(&config, &["chunk", "no-such-doc", "--index", "0"]);
    assert!(!ok);
    assert_eq!(out["kind"], "not_found");
    assert!(out["error"].as_str().unwrap().contains("no-such-doc"));

    let (out, ok) = run_srag(&config, &["--collection", "bad/name", "stats"]);
    assert!(!ok);
    assert_eq!(out["kind"], "validation");
}

#[test]
fn test_kb_sync_and_status() {
    let (_tmp, config) = setup_test_env();

    let (out, ok) = run_srag(&config, &["kb", "sync"]);
    assert!(ok, "{}", out);
    assert_eq!(out["created"], 1);
    assert_eq!(out["errors"], 0);

    let (out, ok) = run_srag(&config, &["kb", "status"]);
    assert!(ok);
    assert_eq!(out["collection"], "kb");
    assert_eq!(out["manifest"]["total_indexed"], 1);

    let (out, ok) = run_srag(&config, &["--collection", "kb", "hybrid", "kubernetes docker"]);
    assert!(ok);
    assert_eq!(out["results"][0]["title"], "Gamma Notes");

    let (out, ok) = run_srag(&config, &["collections"]);
    assert!(ok);
    assert!(out
        .as_array()
        .unwrap()
        .iter()
        .any(|c| c["name"] == "kb" && c["document_count"] == 1));
}

#[test]
fn test_kb_commands_require_enabled() {
    let (_tmp, config) = setup_test_env();
    let body = fs::read_to_string(&config).unwrap();
    fs::write(&config, body.replace("enabled = true", "enabled = false")).unwrap();

    let (out, ok) = run_srag(&config, &["kb", "sync"]);
    assert!(!ok);
    assert_eq!(out["kind"], "validation");

    let (out, ok) = run_srag(&config, &["--collection", "kb", "stats"]);
    assert!(ok);
    assert_eq!(out["document_count"], 0);
}

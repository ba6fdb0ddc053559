#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn setup(name: &str) -> (TempDir, PathBuf, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let config = dir.path().join("config.toml");
    fs::write(
        &config,
        "[pager]\npage_size = 4096\ncache_pages = 64\n\n[index]\nm = 8\nef_construction = 48\n",
    )
    .expect("write config");
    let index = dir.path().join(format!("{name}.idx"));
    cargo_bin_cmd!("hnsw-inspect")
        .arg(&index)
        .arg("--config")
        .arg(&config)
        .args(["demo-build", "--rows", "150", "--dim", "8", "--seed", "7"])
        .assert()
        .success();
    (dir, index, config)
}

fn run_json(index: &PathBuf, config: &PathBuf, args: &[&str]) -> Value {
    let output = cargo_bin_cmd!("hnsw-inspect")
        .arg(index)
        .arg("--config")
        .arg(config)
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn demo_build_then_verify_reports_clean() {
    let (_dir, index, config) = setup("verify");
    let report = run_json(&index, &config, &["verify", "--json"]);
    assert_eq!(report["num_vectors"], 150);
    assert_eq!(report["vector_dim"], 8);
    assert_eq!(report["nodes_checked"], 150);
    assert_eq!(report["findings"].as_array().map(Vec::len), Some(0));
    assert!(report["node_blocks"].as_u64().unwrap_or(0) >= 1);
}

#[test]
fn node_dump_lists_neighbor_tiers() {
    let (_dir, index, config) = setup("node");
    let node = run_json(&index, &config, &["node", "3"]);
    assert_eq!(node["slot"], 3);
    assert_eq!(node["key"], 3);
    assert_eq!(node["tombstone"], false);
    let tiers = node["neighbors"].as_array().expect("tiers");
    assert_eq!(tiers.len() as u64, node["level"].as_u64().expect("level") + 1);
    assert!(!tiers[0].as_array().expect("base tier").is_empty());
    assert_eq!(node["payload_hex"].as_str().map(str::len), Some(8 * 4 * 2));
}

#[test]
fn info_and_header_print_fields() {
    let (_dir, index, config) = setup("info");
    let output = cargo_bin_cmd!("hnsw-inspect")
        .arg(&index)
        .arg("--config")
        .arg(&config)
        .arg("info")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("vectors"));
    assert!(text.contains("150"));

    let output = cargo_bin_cmd!("hnsw-inspect")
        .arg(&index)
        .arg("--config")
        .arg(&config)
        .arg("header")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let hex = String::from_utf8(output).expect("utf8");
    assert_eq!(hex.trim().len(), 20 * 2);
}

#[test]
fn missing_index_fails() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("hnsw-inspect")
        .arg(dir.path().join("absent.idx"))
        .arg("verify")
        .assert()
        .failure()
        .code(1);
}

//! Command-line round trips through the `nnbundle` binary.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use nnbundle::BundleSnapshot;

fn nnbundle(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_nnbundle"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to execute nnbundle")
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("temp paths are UTF-8")
}

#[test]
fn bundle_synthetic_layers_writes_a_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("bundle.json");

    let result = nnbundle(&[
        "bundle",
        "--layers",
        "4,3",
        "--phase",
        "edge-advect",
        "--max-steps",
        "3",
        "--output",
        path_str(&output),
    ]);
    assert!(result.status.success(), "{}", String::from_utf8_lossy(&result.stderr));
    assert!(String::from_utf8_lossy(&result.stdout).contains("Bundled 12 edges"));

    let snapshot = BundleSnapshot::load(&output).unwrap();
    assert_eq!(snapshot.layer_sizes, vec![4, 3]);
    assert_eq!(snapshot.edge_count(), 12);
    assert!(snapshot.point_count() > 24);
}

#[test]
fn bundle_reads_network_and_config_files() {
    let dir = tempfile::tempdir().unwrap();
    let network = dir.path().join("net.json");
    let config = dir.path().join("bundle.toml");
    let output = dir.path().join("out.json");
    fs::write(
        &network,
        r#"{"layer_sizes": [2, 2], "edge_importance": [[1.0, 0.1, 0.5, 0.0]]}"#,
    )
    .unwrap();
    fs::write(&config, "prune_threshold = 0.3\nsample_length = 1.0\n").unwrap();

    let result = nnbundle(&[
        "bundle",
        "--input",
        path_str(&network),
        "--config",
        path_str(&config),
        "--phase",
        "reset",
        "--output",
        path_str(&output),
    ]);
    assert!(result.status.success(), "{}", String::from_utf8_lossy(&result.stderr));

    let snapshot = BundleSnapshot::load(&output).unwrap();
    assert_eq!(snapshot.edge_count(), 2);
    assert_eq!(snapshot.pruned_edges, 2);
}

#[test]
fn inspect_prints_snapshot_counters() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("bundle.json");
    let result = nnbundle(&[
        "bundle",
        "--layers",
        "3,2",
        "--phase",
        "reset",
        "--output",
        path_str(&output),
    ]);
    assert!(result.status.success());

    let result = nnbundle(&["inspect", path_str(&output), "--json"]);
    assert!(result.status.success(), "{}", String::from_utf8_lossy(&result.stderr));
    let summary: serde_json::Value = serde_json::from_slice(&result.stdout).unwrap();
    assert_eq!(summary["edges"], 6);
    assert_eq!(summary["nodes"], 5);
    assert_eq!(summary["layer_sizes"], serde_json::json!([3, 2]));
}

#[test]
fn missing_network_fails_with_context() {
    let result = nnbundle(&["bundle", "--input", "does-not-exist.json"]);
    assert!(!result.status.success());
    assert!(String::from_utf8_lossy(&result.stderr).contains("failed to load network"));
}

#[test]
fn bundle_without_a_network_fails() {
    let result = nnbundle(&["bundle"]);
    assert!(!result.status.success());
    assert!(String::from_utf8_lossy(&result.stderr).contains("--input or --layers"));
}

//! Exercises the compiled `propcan-compiler` binary end-to-end: feed it a
//! YAML manifest on disk, check the envelope it produces decodes back to
//! the same schema (mirrors `check/tests/integration_tests.rs`'s style of
//! driving a built binary rather than calling library internals).

use std::path::PathBuf;
use std::process::Command;

use propcan::envelope::parse_envelope;
use propcan::manifest::parse_manifest_draft_csv;
use tempfile::TempDir;

const MANIFEST_YAML: &str = "\
device_name: Widget
properties:
  - name: voltage
    type: uint16
    unit: mV
    offset: 0
    scale: 1
    range: [0, 65535]
";

fn compiler_binary() -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("../target/debug/propcan-compiler");
    path
}

#[test]
fn compiles_a_manifest_to_a_valid_envelope() {
    let dir = TempDir::new().unwrap();
    let manifest_path = dir.path().join("widget.yaml");
    std::fs::write(&manifest_path, MANIFEST_YAML).unwrap();
    let output_path = dir.path().join("widget.bin");

    let status = Command::new(compiler_binary())
        .args([
            manifest_path.to_str().unwrap(),
            "--output",
            output_path.to_str().unwrap(),
        ])
        .status()
        .expect("failed to run propcan-compiler");
    assert!(status.success());

    let enveloped = std::fs::read(&output_path).unwrap();
    let body = parse_envelope(&enveloped).unwrap();
    let manifest = parse_manifest_draft_csv(&body).unwrap();

    assert_eq!(manifest.device_name, "Widget");
    assert_eq!(manifest.properties.len(), 1);
    assert_eq!(manifest.properties[0].name, "voltage");
}

#[test]
fn strict_mode_rejects_a_manifest_with_duplicate_names() {
    let dir = TempDir::new().unwrap();
    let manifest_path = dir.path().join("bad.yaml");
    std::fs::write(
        &manifest_path,
        "\
device_name: Bad
properties:
  - name: voltage
    type: uint16
    unit: mV
    offset: 0
    scale: 1
    range: [0, 65535]
  - name: voltage
    type: uint8 readonly
    unit: mV
    offset: 0
    scale: 1
    range: [0, 255]
",
    )
    .unwrap();

    let status = Command::new(compiler_binary())
        .args([manifest_path.to_str().unwrap(), "--strict"])
        .status()
        .expect("failed to run propcan-compiler");
    assert!(!status.success());
}

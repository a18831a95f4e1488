//! Integration tests for the xenpack command line.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn xenpack() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("xenpack"));
    cmd.env("NO_COLOR", "1");
    cmd.env_remove("XENPACK_PASSWORD");
    cmd.env_remove("XENPACK_LOG");
    cmd
}

fn write_template(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("template.yaml");
    std::fs::write(&path, body).expect("write template");
    path
}

const GOOD_TEMPLATE: &str = "type: xenserver-vm
remote_host: xs1.example.com
remote_password: secret
vm_name: web
source_vm: base
format: vdi_raw
";

// --- Help and version ---

#[test]
fn test_cli_no_args_shows_help_and_exits_two() {
    xenpack()
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Build XenServer VM images"));
}

#[test]
fn test_cli_help_lists_commands() {
    xenpack()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("destroy"));
}

#[test]
fn test_build_help_shows_keep_vm_and_force() {
    xenpack()
        .args(["build", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--force"))
        .stdout(predicate::str::contains("--keep-vm"));
}

#[test]
fn test_version_command_shows_version() {
    xenpack()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(concat!(
            "xenpack ",
            env!("CARGO_PKG_VERSION")
        )));
}

#[test]
fn test_version_command_json_outputs_valid_json() {
    let output = xenpack().args(["version", "--json"]).output().unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["version"], env!("CARGO_PKG_VERSION"));
}

// --- validate ---

#[test]
fn test_validate_accepts_a_good_template() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_template(dir.path(), GOOD_TEMPLATE);
    xenpack()
        .arg("validate")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid"))
        .stdout(predicate::str::contains("xenserver-vm"))
        .stdout(predicate::str::contains("output-web"));
}

#[test]
fn test_validate_json_reports_builder_and_format() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_template(dir.path(), GOOD_TEMPLATE);
    let output = xenpack()
        .args(["validate", "--json"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["valid"], true);
    assert_eq!(value["builder"], "xenserver-vm");
    assert_eq!(value["vm_name"], "web");
    assert_eq!(value["format"], "vdi_raw");
}

#[test]
fn test_validate_lists_every_problem() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_template(
        dir.path(),
        "type: xenserver-iso\nvm_name: web\nformat: ova\nboot_wait: soon\n",
    );
    xenpack()
        .arg("validate")
        .arg(&path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("remote_host must be specified"))
        .stderr(predicate::str::contains("remote_password must be specified"))
        .stderr(predicate::str::contains("iso_name must be specified"))
        .stderr(predicate::str::contains("Invalid value for format: ova"))
        .stderr(predicate::str::contains("boot_wait"));
}

#[test]
fn test_validate_takes_password_from_environment() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_template(
        dir.path(),
        "type: xenserver-vm\nremote_host: xs1\nvm_name: web\nsource_vm: base\n",
    );
    xenpack()
        .arg("validate")
        .arg(&path)
        .env("XENPACK_PASSWORD", "from-env")
        .assert()
        .success();
}

#[test]
fn test_validate_rejects_unknown_builder_type() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_template(dir.path(), "type: vmware-iso\nvm_name: web\n");
    xenpack()
        .arg("validate")
        .arg(&path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("cannot parse"));
}

#[test]
fn test_validate_missing_file_fails() {
    xenpack()
        .args(["validate", "/nonexistent/template.yaml"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("cannot read"));
}

#[test]
fn test_validate_error_is_json_with_json_flag() {
    let output = xenpack()
        .args(["validate", "--json", "/nonexistent/template.yaml"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["error"], true);
    assert_eq!(value["code"], "COMMAND_FAILED");
    assert!(value["message"].as_str().unwrap().contains("cannot read"));
}

// --- destroy ---

#[test]
fn test_destroy_removes_output_directory() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("output-web");
    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(out.join("web.xva"), b"image").unwrap();

    xenpack()
        .arg("destroy")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed"));
    assert!(!out.exists());
}

#[test]
fn test_destroy_missing_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    xenpack()
        .arg("destroy")
        .arg(dir.path().join("never-built"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("does not exist"));
}

// --- build ---

#[test]
fn test_build_with_invalid_template_fails_before_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_template(dir.path(), "type: xenserver-vm\nvm_name: web\n");
    xenpack()
        .arg("build")
        .arg(&path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("remote_host must be specified"));
}

#[test]
fn test_build_rejects_unknown_keep_vm_policy() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_template(dir.path(), GOOD_TEMPLATE);
    xenpack()
        .arg("build")
        .arg(&path)
        .args(["--keep-vm", "sometimes"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("keep_vm"));
}

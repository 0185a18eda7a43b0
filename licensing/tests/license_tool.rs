//! Integration tests for the license-tool binary
//!
//! Drives the full keygen → issue → verify → enforce flow through the CLI.

use std::path::Path;
use std::process::{Command, Output};

const TOOL: &str = env!("CARGO_BIN_EXE_license-tool");

fn run(args: &[&str]) -> Output {
    Command::new(TOOL)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run license-tool")
}

fn path(p: &Path) -> &str {
    p.to_str().unwrap()
}

#[test]
fn test_issue_and_verify() {
    let dir = tempfile::tempdir().unwrap();
    let key = dir.path().join("signing.pk8");
    let keyring = dir.path().join("keyring.json");
    let license = dir.path().join("license.gpg");

    let out = run(&["keygen", "--out", path(&key), "--keyring", path(&keyring)]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let out = run(&[
        "issue",
        "--key",
        path(&key),
        "--customer-id",
        "cust-9",
        "--seats",
        "30",
        "--days",
        "30",
        "--allow-audit",
        "--out",
        path(&license),
    ]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let out = run(&["verify", "--license", path(&license), "--keyring", path(&keyring)]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("\"customer_id\": \"cust-9\""));
    assert!(stdout.contains("\"allow_audit\": true"));
    assert!(stdout.contains("29 day(s) remaining"));
}

#[test]
fn test_verify_fails_for_foreign_signer() {
    let dir = tempfile::tempdir().unwrap();
    let trusted_key = dir.path().join("trusted.pk8");
    let other_key = dir.path().join("other.pk8");
    let keyring = dir.path().join("keyring.json");
    let scratch = dir.path().join("scratch.json");
    let license = dir.path().join("license.gpg");

    assert!(run(&["keygen", "--out", path(&trusted_key), "--keyring", path(&keyring)])
        .status
        .success());
    // Same claimed identity, different key, kept out of the real keyring
    assert!(run(&["keygen", "--out", path(&other_key), "--keyring", path(&scratch)])
        .status
        .success());

    assert!(run(&[
        "issue",
        "--key",
        path(&other_key),
        "--customer-id",
        "cust-1",
        "--seats",
        "1",
        "--out",
        path(&license),
    ])
    .status
    .success());

    let out = run(&["verify", "--license", path(&license), "--keyring", path(&keyring)]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("signature is invalid"));
}

#[test]
fn test_verify_fails_for_expired_license() {
    let dir = tempfile::tempdir().unwrap();
    let key = dir.path().join("signing.pk8");
    let keyring = dir.path().join("keyring.json");
    let license = dir.path().join("license.gpg");

    assert!(run(&["keygen", "--out", path(&key), "--keyring", path(&keyring)])
        .status
        .success());
    assert!(run(&[
        "issue",
        "--key",
        path(&key),
        "--customer-id",
        "cust-2",
        "--seats",
        "1",
        "--days",
        "0",
        "--out",
        path(&license),
    ])
    .status
    .success());

    let out = run(&["verify", "--license", path(&license), "--keyring", path(&keyring)]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("expired"));
}

#[test]
fn test_enforce_once_with_valid_license() {
    let dir = tempfile::tempdir().unwrap();
    let key = dir.path().join("signing.pk8");
    let keyring = dir.path().join("keyring.json");
    let license = dir.path().join("license.gpg");

    assert!(run(&["keygen", "--out", path(&key), "--keyring", path(&keyring)])
        .status
        .success());
    assert!(run(&[
        "issue",
        "--key",
        path(&key),
        "--customer-id",
        "cust-3",
        "--seats",
        "5",
        "--out",
        path(&license),
    ])
    .status
    .success());

    // A valid license never touches the services
    let out = run(&[
        "enforce",
        "--license",
        path(&license),
        "--keyring",
        path(&keyring),
        "--service",
        "inception-nonexistent.service",
        "--once",
    ]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
}

//! CLI Integration Tests
//!
//! These tests verify the CLI commands work correctly end-to-end.
//! None of them need a reachable peer.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a CLI command with a temporary data directory
fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("lanshare").expect("Failed to find lanshare binary");
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

// ============================================================================
// Help
// ============================================================================

#[test]
fn test_help_lists_commands() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("send"))
        .stdout(predicate::str::contains("speed-test"))
        .stdout(predicate::str::contains("nat-advice"));
}

#[test]
fn test_unknown_command_fails() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir).arg("frobnicate").assert().failure();
}

// ============================================================================
// Config Command Tests
// ============================================================================

#[test]
fn test_config_init_writes_defaults() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote"))
        .stdout(predicate::str::contains("Device ID:"));

    let written = std::fs::read_to_string(data_dir.path().join("config.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&written).unwrap();
    assert_eq!(json["discovery_port"], 47100);
    assert_eq!(json["transfer_port"], 47101);
    assert_eq!(json["compression"], "none");
}

#[test]
fn test_config_init_refuses_to_overwrite() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir).args(["config", "init"]).assert().success();
    cli_cmd(&data_dir)
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
    cli_cmd(&data_dir)
        .args(["config", "init", "--force"])
        .assert()
        .success();
}

#[test]
fn test_config_show_reads_file() {
    let data_dir = TempDir::new().unwrap();
    let config_path = data_dir.path().join("custom.json");
    std::fs::write(
        &config_path,
        r#"{ "device_id": "den-pc", "bandwidth_limit": 1048576 }"#,
    )
    .unwrap();

    cli_cmd(&data_dir)
        .arg("--config")
        .arg(&config_path)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"den-pc\""))
        .stdout(predicate::str::contains("1048576"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let data_dir = TempDir::new().unwrap();
    let config_path = data_dir.path().join("bad.json");
    std::fs::write(&config_path, r#"{ "device_id": "" }"#).unwrap();

    cli_cmd(&data_dir)
        .arg("--config")
        .arg(&config_path)
        .args(["config", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("device_id"));
}

// ============================================================================
// NAT advice
// ============================================================================

#[test]
fn test_nat_advice_restricted_pair() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["nat-advice", "restricted-cone", "restricted-cone"])
        .assert()
        .success()
        .stdout(predicate::str::contains("medium"));
}

#[test]
fn test_nat_advice_blocked_is_impossible() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["nat-advice", "open", "blocked"])
        .assert()
        .success()
        .stdout(predicate::str::contains("impossible"));
}

#[test]
fn test_nat_advice_rejects_unknown_type() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["nat-advice", "open", "carrier-grade"])
        .assert()
        .failure();
}

// ============================================================================
// Transfers and library
// ============================================================================

#[test]
fn test_send_missing_path_fails() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["send", "127.0.0.1:9"])
        .arg(data_dir.path().join("nope"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_send_rejects_bad_peer_address() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["send", "not-an-address", "."])
        .assert()
        .failure();
}

#[test]
fn test_send_to_closed_port_reports_failure() {
    let data_dir = TempDir::new().unwrap();
    let file = data_dir.path().join("notes.txt");
    std::fs::write(&file, "hello").unwrap();

    // Grab a free port, then close it again
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    cli_cmd(&data_dir)
        .arg("send")
        .arg(format!("127.0.0.1:{}", port))
        .arg(&file)
        .assert()
        .failure()
        .stdout(predicate::str::contains("failed"));
}

#[test]
fn test_failed_send_is_logged() {
    let data_dir = TempDir::new().unwrap();
    let file = data_dir.path().join("notes.txt");
    std::fs::write(&file, "hello").unwrap();

    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    // Warnings reach the console at default verbosity
    cli_cmd(&data_dir)
        .env_remove("RUST_LOG")
        .arg("send")
        .arg(format!("127.0.0.1:{}", port))
        .arg(&file)
        .assert()
        .failure()
        .stdout(predicate::str::contains("Send failed"));
}

#[test]
fn test_local_library_lists_packages() {
    let data_dir = TempDir::new().unwrap();
    let game = data_dir.path().join("library").join("game-one");
    std::fs::create_dir_all(game.join("data")).unwrap();
    std::fs::write(game.join("game.exe"), vec![0u8; 2048]).unwrap();
    std::fs::write(game.join("data/level1.pak"), vec![1u8; 4096]).unwrap();

    cli_cmd(&data_dir)
        .arg("library")
        .assert()
        .success()
        .stdout(predicate::str::contains("Library (1 items)"))
        .stdout(predicate::str::contains("game-one"));
}

#[test]
fn test_empty_local_library() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("library")
        .assert()
        .success()
        .stdout(predicate::str::contains("Library is empty."));
}

// ============================================================================
// Peers and saves
// ============================================================================

#[test]
fn test_manual_peer_add_and_remove() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["peers", "add", "10.0.0.5:47101", "--name", "nas"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Added"));

    cli_cmd(&data_dir)
        .args(["peers", "remove", "10.0.0.5:47101"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 10.0.0.5:47101"));

    cli_cmd(&data_dir)
        .args(["peers", "remove", "10.0.0.5:47101"])
        .assert()
        .success()
        .stdout(predicate::str::contains("was not a manual peer"));
}

#[test]
fn test_versions_of_unknown_save() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["saves", "versions", "game1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No versions stored for game1."));
}

#[test]
fn test_serve_rejects_malformed_save_argument() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["serve", "--save", "game1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected ID=PATH"));
}

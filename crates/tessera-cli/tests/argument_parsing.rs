//! Focused CLI argument parsing tests.
//!
//! Tests that verify command-line argument parsing works correctly without
//! running a cluster.

#![allow(deprecated)] // Command::cargo_bin is deprecated but replacement requires newer assert_cmd

use assert_cmd::Command;
use predicates::prelude::*;

fn tessera() -> Command {
    Command::cargo_bin("tessera").unwrap()
}

// ============================================================================
// Top Level
// ============================================================================

#[test]
fn version_command_succeeds() {
    tessera()
        .args(["--no-color", "version"])
        .assert()
        .success()
        .stdout(predicate::str::contains("tessera"));
}

#[test]
fn version_flag_shows_version() {
    tessera()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("tessera"));
}

#[test]
fn help_flag_lists_commands() {
    tessera()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("simulate"))
        .stdout(predicate::str::contains("config"))
        .stdout(predicate::str::contains("init"));
}

#[test]
fn no_command_shows_help() {
    tessera().assert().failure().stderr(predicate::str::contains("Usage"));
}

#[test]
fn unknown_command_fails() {
    tessera()
        .arg("serve")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

// ============================================================================
// Argument Errors
// ============================================================================

#[test]
fn init_requires_path() {
    tessera()
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn init_rejects_non_numeric_replica_id() {
    tessera()
        .args(["init", "somewhere", "--replica-id", "first"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn config_requires_subcommand() {
    tessera().arg("config").assert().failure();
}

#[test]
fn config_show_rejects_unknown_format() {
    tessera()
        .args(["config", "show", "--format", "yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn simulate_rejects_unknown_format() {
    tessera()
        .args(["simulate", "--format", "csv"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn simulate_help_shows_options() {
    tessera()
        .args(["simulate", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--replicas"))
        .stdout(predicate::str::contains("--requests"))
        .stdout(predicate::str::contains("--crash-primary"))
        .stdout(predicate::str::contains("--detection-ms"));
}

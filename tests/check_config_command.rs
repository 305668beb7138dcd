//! Integration tests for the `check-config` command

mod common;

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_check_config_prints_resolved_json() {
    let (_dir, path) = common::temp_config_file(
        "session:\n  default_duration_minutes: 15\nfanout:\n  max_degree_of_parallelism: 8\n",
    );

    Command::cargo_bin("scopekeeper")
        .unwrap()
        .env_remove("SCOPEKEEPER_MAX_PARALLELISM")
        .env_remove("SCOPEKEEPER_SESSION_DURATION_MINUTES")
        .args(["--config", path.to_str().unwrap(), "check-config", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"default_duration_minutes\": 15"))
        .stdout(predicate::str::contains("\"max_degree_of_parallelism\": 8"))
        .stdout(predicate::str::contains("\"header_name\": \"X-Session-Id\""));
}

#[test]
fn test_check_config_yaml_by_default() {
    let (_dir, path) = common::temp_config_file("server:\n  bind_address: \"0.0.0.0:9090\"\n");

    Command::cargo_bin("scopekeeper")
        .unwrap()
        .env_remove("SCOPEKEEPER_BIND_ADDRESS")
        .args(["--config", path.to_str().unwrap(), "check-config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("bind_address").and(predicate::str::contains("0.0.0.0:9090")));
}

#[test]
fn test_check_config_rejects_invalid_values() {
    let (_dir, path) = common::temp_config_file("sweeper:\n  interval_minutes: 0\n");

    Command::cargo_bin("scopekeeper")
        .unwrap()
        .env_remove("SCOPEKEEPER_SWEEP_INTERVAL_MINUTES")
        .args(["--config", path.to_str().unwrap(), "check-config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("interval_minutes"));
}

#[test]
fn test_env_override_applies_to_check_config() {
    let (_dir, path) = common::temp_config_file("fanout:\n  max_degree_of_parallelism: 2\n");

    Command::cargo_bin("scopekeeper")
        .unwrap()
        .env("SCOPEKEEPER_MAX_PARALLELISM", "6")
        .args(["--config", path.to_str().unwrap(), "check-config", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"max_degree_of_parallelism\": 6"));
}

#[test]
fn test_load_warnings_reach_stderr() {
    let dir = tempfile::TempDir::new().unwrap();
    let missing = dir.path().join("absent.yaml");

    Command::cargo_bin("scopekeeper")
        .unwrap()
        .env_remove("RUST_LOG")
        .env("SCOPEKEEPER_MAX_PARALLELISM", "abc")
        .args(["--config", missing.to_str().unwrap(), "check-config", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"max_degree_of_parallelism\": 4"))
        .stderr(predicate::str::contains("Config file not found"))
        .stderr(predicate::str::contains("Invalid SCOPEKEEPER_MAX_PARALLELISM: abc"));
}

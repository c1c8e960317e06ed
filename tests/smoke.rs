//! Smoke tests -- verify the binary runs and key subcommands work.

use assert_cmd::Command;
use predicates::prelude::*;

fn pipewatch() -> Command {
    let mut cmd = Command::cargo_bin("pipewatch").unwrap();
    cmd.env_remove("PIPEWATCH_CONFIG").env("RUST_LOG", "error");
    cmd
}

#[test]
fn test_cli_help() {
    pipewatch()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("cascade correlation"));
}

#[test]
fn test_cli_version() {
    pipewatch()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("pipewatch"));
}

#[test]
fn test_subcommands_exist() {
    for sub in [
        vec!["serve", "--help"],
        vec!["ingest", "--help"],
        vec!["trend", "--help"],
        vec!["rules", "validate", "--help"],
    ] {
        pipewatch().args(&sub).assert().success();
    }
}

#[test]
fn test_rules_list_shows_builtin_table() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = dir.path().join("pipewatch.toml");
    std::fs::write(
        &config,
        format!(
            "[storage]\ndb_path = \"{}\"\n",
            dir.path().join("pw.db").display()
        ),
    )
    .unwrap();

    pipewatch()
        .args(["--config", config.to_str().unwrap(), "rules", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("builtin-1"))
        .stdout(predicate::str::contains("consumer_lag"));
}

#[test]
fn test_rules_validate_rejects_garbage() {
    let dir = tempfile::TempDir::new().unwrap();
    let rules = dir.path().join("rules.toml");
    std::fs::write(&rules, "version = \n").unwrap();

    pipewatch()
        .args(["rules", "validate", rules.to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn test_ingest_then_status() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = dir.path().join("pipewatch.toml");
    std::fs::write(
        &config,
        format!(
            "[storage]\ndb_path = \"{}\"\n",
            dir.path().join("pw.db").display()
        ),
    )
    .unwrap();

    let now = chrono::Utc::now().to_rfc3339();
    let samples = dir.path().join("samples.jsonl");
    std::fs::write(
        &samples,
        format!(
            "{{\"timestamp\":\"{now}\",\"component\":\"broker\",\"metric\":\"consumer_lag\",\"value\":150000}}\n\
             not json\n\
             {{\"timestamp\":\"{now}\",\"component\":\"broker\",\"metric\":\"consumer_lag\",\"value\":1000}}\n"
        ),
    )
    .unwrap();

    pipewatch()
        .args(["--config", config.to_str().unwrap(), "ingest", "--file"])
        .arg(&samples)
        .assert()
        .success()
        .stdout(predicate::str::contains("Ingested 2 sample(s), skipped 1."));

    pipewatch()
        .args(["--config", config.to_str().unwrap(), "status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"open_critical\": 1"));
}

#[test]
fn test_trend_with_out_of_range_hours_fails_cleanly() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = dir.path().join("pipewatch.toml");
    std::fs::write(
        &config,
        format!(
            "[storage]\ndb_path = \"{}\"\n",
            dir.path().join("pw.db").display()
        ),
    )
    .unwrap();

    pipewatch()
        .args(["--config", config.to_str().unwrap(), "trend"])
        .args(["--component", "broker", "--metric", "consumer_lag"])
        .args(["--hours", "9223372036854775807"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("out of range"));
}

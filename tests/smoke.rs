//! Smoke tests -- verify the binary runs and every subcommand is wired.

use assert_cmd::Command;
use predicates::prelude::*;

fn matrixwatch() -> Command {
    Command::cargo_bin("matrixwatch").unwrap()
}

#[test]
fn test_cli_help() {
    matrixwatch()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Cross-source anomaly detection"));
}

#[test]
fn test_cli_version() {
    matrixwatch()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("matrixwatch"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["serve", "analyze", "predictions", "calibration", "schedule"] {
        matrixwatch().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_analyze_rejects_unknown_kind() {
    matrixwatch()
        .args(["analyze", "astrology"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn test_schedule_preview_uses_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("matrixwatch.toml");
    std::fs::write(&config, "[offline]\nschedule = \"0 0 * * * *\"\n").unwrap();
    matrixwatch()
        .arg("--config")
        .arg(&config)
        .args(["schedule", "--hours", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Upcoming batch runs"));
}

#[test]
fn test_analyze_and_predictions_on_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("matrixwatch.toml");
    let db = dir.path().join("mw.db");
    std::fs::write(
        &config,
        format!("[storage]\ndb_path = {:?}\n", db.to_string_lossy()),
    )
    .unwrap();

    matrixwatch()
        .arg("--config")
        .arg(&config)
        .args(["analyze", "clusters", "--hours", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"analysis\": \"clusters\""));

    matrixwatch()
        .arg("--config")
        .arg(&config)
        .args(["predictions", "--refresh"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No active predictions."));

    matrixwatch()
        .arg("--config")
        .arg(&config)
        .arg("calibration")
        .assert()
        .success()
        .stdout(predicate::str::contains("No resolved predictions yet."));
}

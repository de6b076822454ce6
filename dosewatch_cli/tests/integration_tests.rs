//! Integration tests for the dosewatch binary.
//!
//! These tests verify end-to-end behavior including:
//! - Medicine management
//! - Missed-dose reconciliation across separate runs
//! - Dose logging and adherence
//! - Export and retention

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const MORNING: &str = "2026-03-10T10:00:00+00:00";

/// Helper to create a test data directory
fn setup_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// CLI pointed at `data_dir`, acting as alice
fn cli(data_dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("dosewatch"));
    cmd.arg("--data-dir").arg(data_dir).arg("--user").arg("alice");
    cmd
}

/// Add a 09:00 + 21:00 medicine and return its id
fn add_medicine(data_dir: &Path) -> String {
    let output = cli(data_dir)
        .args(["--now", MORNING])
        .args(["medicine", "add", "--name", "Amlodipine", "--dosage", "5mg"])
        .args(["--times", "09:00,21:00", "--start", "2026-03-01", "--end", "2026-04-30"])
        .output()
        .expect("Failed to run CLI");
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("id: "))
        .expect("No medicine id in output")
        .to_string()
}

fn stored_events(data_dir: &Path) -> Vec<serde_json::Value> {
    let content = fs::read_to_string(data_dir.join("store.json")).expect("Failed to read store");
    let snapshot: serde_json::Value = serde_json::from_str(&content).unwrap();
    snapshot["events"].as_array().cloned().unwrap_or_default()
}

#[test]
fn test_cli_help() {
    Command::new(assert_cmd::cargo::cargo_bin!("dosewatch"))
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Medication schedule"));
}

#[test]
fn test_add_and_list_medicine() {
    let temp_dir = setup_test_dir();
    let id = add_medicine(temp_dir.path());

    assert!(temp_dir.path().join("store.json").exists());

    cli(temp_dir.path())
        .args(["--now", MORNING, "medicine", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains(id.as_str()))
        .stdout(predicate::str::contains("Amlodipine 5mg [active]"))
        .stdout(predicate::str::contains("09:00, 21:00"));
}

#[test]
fn test_status_reconciles_once() {
    let temp_dir = setup_test_dir();
    add_medicine(temp_dir.path());

    cli(temp_dir.path())
        .args(["--now", MORNING, "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Recorded 1 missed dose(s)"))
        .stdout(predicate::str::contains("Today's adherence: 0%"));

    // A second run finds the event already recorded
    cli(temp_dir.path())
        .args(["--now", "2026-03-10T10:05:00+00:00", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Recorded").not())
        .stdout(predicate::str::contains("Today's adherence: 0%"));

    let events = stored_events(temp_dir.path());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["source"], "reconciled");
    assert_eq!(events[0]["is_taken"], false);
}

#[test]
fn test_late_dose_replaces_missed_event() {
    let temp_dir = setup_test_dir();
    let id = add_medicine(temp_dir.path());

    cli(temp_dir.path())
        .args(["--now", MORNING, "status"])
        .assert()
        .success();

    cli(temp_dir.path())
        .args(["--now", "2026-03-10T10:30:00+00:00", "log", &id, "09:00"])
        .assert()
        .success()
        .stdout(predicate::str::contains("logged as taken"))
        .stdout(predicate::str::contains("Today's adherence: 100%"));

    let events = stored_events(temp_dir.path());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["source"], "user");
    assert_eq!(events[0]["is_taken"], true);
}

#[test]
fn test_log_unknown_dose_time_fails() {
    let temp_dir = setup_test_dir();
    let id = add_medicine(temp_dir.path());

    cli(temp_dir.path())
        .args(["--now", MORNING, "log", &id, "12:00"])
        .assert()
        .failure();
}

#[test]
fn test_invalid_dose_time_rejected() {
    let temp_dir = setup_test_dir();

    cli(temp_dir.path())
        .args(["medicine", "add", "--name", "Amlodipine", "--dosage", "5mg", "--times", "25:00"])
        .assert()
        .failure();
}

#[test]
fn test_status_requires_user() {
    let temp_dir = setup_test_dir();

    Command::new(assert_cmd::cargo::cargo_bin!("dosewatch"))
        .arg("--data-dir")
        .arg(temp_dir.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no user selected"));
}

#[test]
fn test_deactivated_medicine_not_scheduled() {
    let temp_dir = setup_test_dir();
    let id = add_medicine(temp_dir.path());

    cli(temp_dir.path())
        .args(["--now", MORNING, "medicine", "deactivate", &id])
        .assert()
        .success();

    cli(temp_dir.path())
        .args(["--now", MORNING, "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No medicines scheduled today"))
        .stdout(predicate::str::contains("Today's adherence: 100%"));

    assert!(stored_events(temp_dir.path()).is_empty());
}

#[test]
fn test_remove_medicine_deletes_events() {
    let temp_dir = setup_test_dir();
    let id = add_medicine(temp_dir.path());

    cli(temp_dir.path())
        .args(["--now", MORNING, "status"])
        .assert()
        .success();
    assert_eq!(stored_events(temp_dir.path()).len(), 1);

    cli(temp_dir.path())
        .args(["medicine", "remove", &id])
        .assert()
        .success();

    assert!(stored_events(temp_dir.path()).is_empty());
    cli(temp_dir.path())
        .args(["medicine", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No medicines"));
}

#[test]
fn test_export_csv() {
    let temp_dir = setup_test_dir();
    add_medicine(temp_dir.path());

    cli(temp_dir.path())
        .args(["--now", MORNING, "status"])
        .assert()
        .success();

    let csv_path = temp_dir.path().join("doses.csv");
    cli(temp_dir.path())
        .arg("export")
        .arg(&csv_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Exported 1 dose events"));

    let content = fs::read_to_string(&csv_path).expect("Failed to read CSV");
    assert!(content.starts_with("id,medicine_id,medicine,dose_id,date,timestamp,taken,source"));
    assert!(content.contains("Amlodipine"));
    assert!(content.contains("false,reconciled"));
}

#[test]
fn test_purge_old_events() {
    let temp_dir = setup_test_dir();
    add_medicine(temp_dir.path());

    cli(temp_dir.path())
        .args(["--now", MORNING, "status"])
        .assert()
        .success();

    // Within the retention window nothing goes
    cli(temp_dir.path())
        .args(["--now", "2026-03-20T10:00:00+00:00", "purge"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Purged 0"));

    cli(temp_dir.path())
        .args(["--now", "2026-05-01T10:00:00+00:00", "purge"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Purged 1"));

    assert!(stored_events(temp_dir.path()).is_empty());
}

#[test]
fn test_watch_prints_adherence() {
    let temp_dir = setup_test_dir();
    add_medicine(temp_dir.path());

    cli(temp_dir.path())
        .args(["--now", MORNING, "watch", "--ticks", "1", "--interval", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Today's adherence: 0%"));

    assert_eq!(stored_events(temp_dir.path()).len(), 1);
}

#[test]
fn test_offset_change_within_day_records_one_miss() {
    let temp_dir = setup_test_dir();

    cli(temp_dir.path())
        .args(["--now", "2026-10-20T12:00:00+02:00"])
        .args(["medicine", "add", "--name", "Levothyroxine", "--dosage", "50mcg"])
        .args(["--times", "01:00", "--start", "2026-10-20"])
        .assert()
        .success();

    // Summer time ends between the two runs on the same local day
    cli(temp_dir.path())
        .args(["--now", "2026-10-25T01:30:00+02:00", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Recorded 1 missed dose(s)"));

    cli(temp_dir.path())
        .args(["--now", "2026-10-25T10:00:00+01:00", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Recorded").not())
        .stdout(predicate::str::contains("Today's adherence: 0%"));

    let events = stored_events(temp_dir.path());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["day"], "2026-10-25");
}

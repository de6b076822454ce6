//! Multi-process tests for the dosewatch binary.
//!
//! These tests verify that separate processes sharing one store:
//! - Never record more than one event per dose per day
//! - Refuse to write over a corrupted store

use assert_cmd::Command;
use std::fs;
use std::path::Path;
use std::thread;
use tempfile::TempDir;

const EVENING: &str = "2026-03-10T22:00:00+00:00";

fn cli(data_dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("dosewatch"));
    cmd.arg("--data-dir").arg(data_dir).arg("--user").arg("alice");
    cmd
}

fn setup_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

fn event_count(data_dir: &Path) -> usize {
    let content = fs::read_to_string(data_dir.join("store.json")).expect("Failed to read store");
    let snapshot: serde_json::Value = serde_json::from_str(&content).unwrap();
    snapshot["events"].as_array().map_or(0, |events| events.len())
}

#[test]
fn test_parallel_status_runs_record_each_miss_once() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().to_path_buf();

    cli(&data_dir)
        .args(["--now", EVENING])
        .args(["medicine", "add", "--name", "Metformin", "--dosage", "500mg"])
        .args(["--times", "07:00,13:00,19:00", "--start", "2026-03-01"])
        .assert()
        .success();

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let data_dir = data_dir.clone();
            thread::spawn(move || {
                cli(&data_dir)
                    .args(["--now", EVENING, "status"])
                    .assert()
                    .success();
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("status run panicked");
    }

    assert_eq!(event_count(&data_dir), 3);
}

#[test]
fn test_sequential_days_each_get_their_own_events() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().to_path_buf();

    cli(&data_dir)
        .args(["--now", EVENING])
        .args(["medicine", "add", "--name", "Amlodipine", "--dosage", "5mg"])
        .args(["--times", "09:00", "--start", "2026-03-01"])
        .assert()
        .success();

    for now in [EVENING, "2026-03-11T22:00:00+00:00", "2026-03-11T23:00:00+00:00"] {
        cli(&data_dir).args(["--now", now, "status"]).assert().success();
    }

    assert_eq!(event_count(&data_dir), 2);
}

#[test]
fn test_corrupted_store_is_not_overwritten() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().to_path_buf();
    let store_path = data_dir.join("store.json");
    fs::write(&store_path, "{ invalid json }}}}").expect("Failed to write corrupted store");

    // Reads degrade to an empty store
    cli(&data_dir)
        .args(["--now", EVENING, "status"])
        .assert()
        .success();

    // Writes are refused
    cli(&data_dir)
        .args(["--now", EVENING])
        .args(["medicine", "add", "--name", "Amlodipine", "--dosage", "5mg", "--times", "09:00"])
        .assert()
        .failure();

    assert_eq!(fs::read_to_string(&store_path).unwrap(), "{ invalid json }}}}");
}

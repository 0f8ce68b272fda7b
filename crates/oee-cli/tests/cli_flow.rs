//! End-to-end tests driving the `oee` binary.
//!
//! Covers the full path: master data -> ingest -> compute -> backfill ->
//! query, plus a single scheduler tick configured through the environment.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use tempfile::TempDir;

const MASTER: &str = r#"
[[equipment]]
id = "press-01"
site_id = "plant-a"
ideal_cycle_time_secs = 60.0

[[reason_codes]]
code = "JAM"
loss_category = "breakdown"
downtime = "unplanned"

[[shifts]]
id = "day-1"
scope = "plant-a"
date = "2025-03-03"
planned_start = "2025-03-03T06:00:00Z"
planned_end = "2025-03-03T14:00:00Z"
planned_minutes = 480
break_minutes = 30
"#;

const EVENTS: &str = r#"{"type":"state_open","equipment_id":"press-01","category":"PRODUCING","start_time":"2025-03-03T06:00:00Z","shift_id":"day-1"}
{"type":"state_open","equipment_id":"press-01","category":"DOWN","reason_code":"JAM","start_time":"2025-03-03T06:50:00Z","shift_id":"day-1"}
{"type":"state_close","equipment_id":"press-01","end_time":"2025-03-03T07:00:00Z"}
{"type":"count","equipment_id":"press-01","timestamp":"2025-03-03T06:10:00Z","total_count":40,"good_count":38,"reject_count":2,"shift_id":"day-1"}
"#;

fn oee_binary() -> String {
    env!("CARGO_BIN_EXE_oee").to_string()
}

fn oee(home: &Path) -> Command {
    let mut cmd = Command::new(oee_binary());
    cmd.env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .env("XDG_DATA_HOME", home.join(".local/share"))
        .env("OEE_DATABASE_PATH", home.join("oee.db"))
        .env_remove("RUST_LOG");
    cmd
}

fn run_ok(cmd: &mut Command) -> String {
    let output = cmd.output().expect("failed to run oee");
    assert_success(&output);
    String::from_utf8(output.stdout).unwrap()
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "oee should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Loads master data and ingests the sample events.
fn seed(home: &Path) {
    let master_path = home.join("master.toml");
    std::fs::write(&master_path, MASTER).unwrap();
    let loaded = run_ok(oee(home).arg("master").arg("load").arg(&master_path));
    assert!(loaded.contains("Loaded 1 equipment, 1 reason codes, 1 shifts"), "{loaded}");

    let mut child = oee(home)
        .arg("ingest")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(EVENTS.as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();
    assert_success(&output);
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.starts_with("Ingested 4 events (0 rejected)"), "{stdout}");
}

#[test]
fn test_compute_backfill_and_query() {
    let temp = TempDir::new().unwrap();
    seed(temp.path());

    let computed = run_ok(
        oee(temp.path())
            .args(["compute", "press-01", "--json"])
            .args(["--start", "2025-03-03T06:00:00Z", "--end", "2025-03-03T07:00:00Z"]),
    );
    let computed: serde_json::Value = serde_json::from_str(&computed).unwrap();
    assert_eq!(computed["operating_time_ms"], 50 * 60_000);
    assert_eq!(computed["actual_output"], 40);
    let availability = computed["availability"].as_f64().unwrap();
    assert!((availability - 50.0 / 60.0).abs() < 1e-9);

    // Nothing is materialized before a refresh or backfill.
    let pending = run_ok(
        oee(temp.path())
            .args(["query", "oee", "press-01", "-g", "hour", "--json"])
            .args(["--start", "2025-03-03T06:00:00Z"]),
    );
    let pending: serde_json::Value = serde_json::from_str(&pending).unwrap();
    assert_eq!(pending["status"], "not_available");

    let backfilled = run_ok(
        oee(temp.path()).args(["backfill", "--start", "2025-03-03", "--end", "2025-03-04"]),
    );
    assert!(
        backfilled.contains("press-01: 1753 windows recomputed, 0 failed"),
        "{backfilled}"
    );

    let hour = run_ok(
        oee(temp.path())
            .args(["query", "oee", "press-01", "-g", "hour", "--json"])
            .args(["--start", "2025-03-03T06:00:00Z"]),
    );
    let hour: serde_json::Value = serde_json::from_str(&hour).unwrap();
    assert_eq!(hour["status"], "ready");
    assert_eq!(hour["record"]["oee"], computed["oee"]);

    let reliability = run_ok(
        oee(temp.path())
            .args(["query", "reliability", "press-01", "--json"])
            .args(["--start", "2025-03-03", "--end", "2025-03-04"]),
    );
    let reliability: serde_json::Value = serde_json::from_str(&reliability).unwrap();
    assert_eq!(reliability["status"], "ready");
    assert_eq!(reliability["record"]["failure_count"], 1);
}

#[test]
fn test_single_tick_respects_env_budget() {
    let temp = TempDir::new().unwrap();
    seed(temp.path());

    let ticked = run_ok(
        oee(temp.path())
            .env("OEE_SCHEDULER__MAX_WINDOWS_PER_TICK", "50")
            .args(["refresh", "--once"]),
    );
    assert!(
        ticked.contains("50 claimed, 50 completed, 0 failed"),
        "{ticked}"
    );

    let status = run_ok(oee(temp.path()).args(["status", "--json"]));
    let status: serde_json::Value = serde_json::from_str(&status).unwrap();
    assert!(!status["watermarks"].as_array().unwrap().is_empty());
}

#[test]
fn test_rejected_master_data_fails() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("master.toml");
    std::fs::write(
        &path,
        "[[reason_codes]]\ncode = \"SLOW\"\nloss_category = \"speed_loss\"\ndowntime = \"unplanned\"\n",
    )
    .unwrap();
    let output = oee(temp.path())
        .args(["master", "load"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_no_subcommand_prints_help() {
    let temp = TempDir::new().unwrap();
    let stdout = run_ok(&mut oee(temp.path()));
    assert!(stdout.contains("Usage:"), "{stdout}");
}

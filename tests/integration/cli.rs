//! Binary-level tests of the pvoutput-backfill command line

use assert_cmd::Command;
use httpmock::{Method::GET, MockServer};
use std::fs;
use tempfile::TempDir;

const CREDENTIAL_VARS: [&str; 3] = [
    "PVOUTPUT_AUTH_APIKEY",
    "PVOUTPUT_AUTH_SYSTEMID",
    "DATA_SERVICE_URL",
];

/// Binary with a clean credential environment, run from `dir`
fn backfill(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("pvoutput-backfill").unwrap();
    cmd.current_dir(dir.path());
    for var in CREDENTIAL_VARS {
        cmd.env_remove(var);
    }
    cmd
}

fn stdout_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_help_lists_commands() {
    let dir = TempDir::new().unwrap();
    let output = backfill(&dir).arg("--help").output().unwrap();
    assert!(output.status.success());
    let help = stdout_of(&output);
    for command in ["download", "search", "purge", "validate"] {
        assert!(help.contains(command), "help is missing '{command}'");
    }
}

#[test]
fn test_validate_systems() {
    let dir = TempDir::new().unwrap();
    let output = backfill(&dir)
        .args(["validate", "systems", "6112,4232"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout_of(&output).contains("Valid system ids: 2"));

    backfill(&dir)
        .args(["validate", "systems", "6112,abc"])
        .assert()
        .failure();
}

#[test]
fn test_validate_empty_resume_dir() {
    let dir = TempDir::new().unwrap();
    let resume = dir.path().join(".resume");
    fs::create_dir_all(&resume).unwrap();

    let output = backfill(&dir)
        .args(["validate", "resume-state", "--resume-dir"])
        .arg(&resume)
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout_of(&output).contains("no state files"));
}

#[test]
fn test_validate_detects_corrupt_state() {
    let dir = TempDir::new().unwrap();
    let resume = dir.path().join(".resume");
    fs::create_dir_all(&resume).unwrap();
    fs::write(resume.join("6112.json"), "{ not json").unwrap();

    backfill(&dir)
        .args(["validate", "resume-state", "--resume-dir"])
        .arg(&resume)
        .assert()
        .failure();
}

#[test]
fn test_invalid_tier_is_rejected() {
    let dir = TempDir::new().unwrap();
    let output = backfill(&dir)
        .args([
            "download",
            "--systems",
            "6112",
            "--start-date",
            "2023-06-01",
            "--end-date",
            "2023-06-02",
            "--tier",
            "gold",
        ])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("gold"));
}

#[test]
fn test_missing_api_key_fails() {
    let dir = TempDir::new().unwrap();
    let output = backfill(&dir)
        .args([
            "download",
            "--systems",
            "6112",
            "--start-date",
            "2023-06-01",
            "--end-date",
            "2023-06-02",
            "--owner-system-id",
            "1234",
        ])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("missing API key"));
}

#[test]
fn test_batch_tier_requires_data_service() {
    let dir = TempDir::new().unwrap();
    let output = backfill(&dir)
        .args([
            "download",
            "--systems",
            "6112",
            "--start-date",
            "2023-06-01",
            "--end-date",
            "2023-06-02",
            "--tier",
            "batch",
            "--api-key",
            "key",
            "--owner-system-id",
            "1234",
        ])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("data service URL"));
}

#[test]
fn test_download_end_to_end() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start();
    let day_mock = |date: &'static str| {
        server.mock(|when, then| {
            when.method(GET)
                .path("/service/r2/getstatus.jsp")
                .query_param("d", date)
                .header("X-Pvoutput-Apikey", "key");
            then.status(200)
                .header("X-Rate-Limit-Remaining", "58")
                .header("X-Rate-Limit-Limit", "60")
                .header("X-Rate-Limit-Reset", "4102444800")
                .body(format!("{date},12:00,1000,0.2,800,700,0.18,NaN,NaN,25.0,240.0"));
        })
    };
    let first = day_mock("20230601");
    let second = day_mock("20230602");

    let output = backfill(&dir)
        .args([
            "--output-format",
            "json",
            "--output-dir",
            "data",
            "--resume-dir",
            ".resume",
            "download",
            "--systems",
            "6112",
            "--start-date",
            "2023-06-01",
            "--end-date",
            "2023-06-02",
            "--api-key",
            "key",
            "--owner-system-id",
            "1234",
            "--base-url",
        ])
        .arg(server.base_url())
        .output()
        .unwrap();

    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
    first.assert_hits(1);
    second.assert_hits(1);

    let report: serde_json::Value = serde_json::from_str(stdout_of(&output).trim()).unwrap();
    let entity = &report["entities"][0];
    assert_eq!(entity["status"], "completed");
    assert_eq!(entity["cursor"], "2023-06-02");
    assert_eq!(entity["requests"], 2);

    assert!(dir.path().join("data/6112/20230601_20230601.csv").exists());
    assert!(dir.path().join("data/6112/20230602_20230602.csv").exists());
    let state: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join(".resume/6112.json")).unwrap()).unwrap();
    assert_eq!(state["cursor"], "2023-06-02");
    assert!(state["missing"].as_array().unwrap().is_empty());

    // Nothing left to fetch on a second run
    let rerun = backfill(&dir)
        .args([
            "--output-format",
            "json",
            "--output-dir",
            "data",
            "--resume-dir",
            ".resume",
            "download",
            "--systems",
            "6112",
            "--start-date",
            "2023-06-01",
            "--end-date",
            "2023-06-02",
            "--api-key",
            "key",
            "--owner-system-id",
            "1234",
            "--base-url",
        ])
        .arg(server.base_url())
        .output()
        .unwrap();
    assert!(rerun.status.success());
    first.assert_hits(1);
    second.assert_hits(1);
}

//! Integration test: the `harness` binary end to end.
//!
//! Run: cargo test -p hotbin-harness --test harness_cli_test

use std::path::PathBuf;
use std::process::Command;

fn harness() -> Command {
    Command::new(env!("CARGO_BIN_EXE_harness"))
}

fn temp_dir(prefix: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn workload_writes_report_log_and_index() {
    let dir = temp_dir("hotbin-cli");
    let log = dir.join("run.jsonl");
    let index = dir.join("index.json");
    let report = dir.join("report.json");
    let output = harness()
        .args(["workload", "--threads", "2", "--ops", "2000", "--seed", "0x1234"])
        .args(["--hook-interval", "4096", "--toggle-slow"])
        .arg("--log")
        .arg(&log)
        .arg("--artifact-index")
        .arg(&index)
        .arg("--output")
        .arg(&report)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();
    assert_eq!(report["seed"], 0x1234);
    assert_eq!(report["threads"].as_array().unwrap().len(), 2);
    assert_eq!(report["arena"]["live_objects"], 0);

    let index: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&index).unwrap()).unwrap();
    let kinds: Vec<_> = index["artifacts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["kind"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(kinds, ["log", "report"]);

    let validate = harness().arg("validate-log").arg("--input").arg(&log).output().unwrap();
    assert!(validate.status.success());
    let last_line = std::fs::read_to_string(&log).unwrap().lines().last().unwrap().to_string();
    let last: serde_json::Value = serde_json::from_str(&last_line).unwrap();
    assert_eq!(last["event"], "workload_end");
    assert_eq!(last["outcome"], "pass");
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn validate_log_rejects_bad_lines() {
    let dir = temp_dir("hotbin-cli-bad");
    let log = dir.join("bad.jsonl");
    std::fs::write(
        &log,
        "{\"timestamp\":\"t\",\"trace_id\":\"a::b\",\"level\":\"info\",\"event\":\"ok\"}\nnot json\n",
    )
    .unwrap();
    let output = harness().arg("validate-log").arg("--input").arg(&log).output().unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("line 2"), "{stderr}");
    assert!(stderr.contains("1 of 2 log lines"), "{stderr}");
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn bin_info_reports_overrides() {
    let output = harness()
        .args(["bin-info", "--json", "--conf", "tcache_max:4096,tcache_ncached_max:16-16:5"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let rows = rows.as_array().unwrap();
    let sixteen = rows.iter().find(|r| r["size"] == 16).unwrap();
    assert_eq!(sixteen["ncached_max"], 5);
    let enabled = rows.iter().filter(|r| r["enabled"] == true).count();
    let last = rows.iter().rfind(|r| r["enabled"] == true).unwrap();
    assert_eq!(last["size"], 4096);
    assert!(enabled < rows.len());

    let bad = harness().args(["bin-info", "--conf", "bogus:1"]).output().unwrap();
    assert!(!bad.status.success());
}

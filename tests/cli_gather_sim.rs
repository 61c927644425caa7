use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "collsim-rs-{prefix}-{}-{nanos}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn write_file(dir: &PathBuf, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write temp file");
    path
}

fn gather_sim(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_gather_sim"))
        .args(args)
        .output()
        .expect("run gather_sim")
}

fn gather_done_line(stdout: &str) -> &str {
    stdout
        .lines()
        .find(|line| line.starts_with("gather_done "))
        .expect("missing gather_done line")
}

#[test]
fn gather_sim_reports_timing_for_four_ranks() {
    let output = gather_sim(&["--nproc", "4", "--root", "0"]);
    assert!(
        output.status.success(),
        "gather_sim failed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        gather_done_line(&stdout),
        "gather_done at_ns=2003 transfers=3 bytes=32 shuffles=0 verified=true"
    );
    let rank_lines: Vec<&str> = stdout
        .lines()
        .filter(|line| line.starts_with("rank_done "))
        .collect();
    assert_eq!(rank_lines.len(), 4);
    assert!(rank_lines.contains(&"rank_done rank=1 at_ns=1001"));
}

#[test]
fn gather_sim_runs_scenario_file_with_midpoint_root() {
    let dir = unique_temp_dir("scenario");
    let scenario = write_file(
        &dir,
        "scenario.json",
        r#"
{
    "schema_version": 1,
    "meta": { "name": "midpoint-root" },
    "comm": { "nproc": 6, "root": 4, "nelems": 3, "elem_size": 4 },
    "link": { "latency_us": 2, "gbps": 10 }
}
        "#,
    );

    let output = gather_sim(&["--scenario", scenario.to_str().unwrap(), "--check"]);
    assert!(
        output.status.success(),
        "gather_sim failed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = gather_done_line(&stdout);
    assert!(line.contains("shuffles=1"), "{line}");
    assert!(line.ends_with("verified=true"), "{line}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn gather_sim_timing_only_skips_verification() {
    let output = gather_sim(&["--nproc", "9", "--root", "5", "--timing-only"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(gather_done_line(&stdout).ends_with("verified=skipped"));
}

#[test]
fn gather_sim_dumps_one_dag_per_rank() {
    let output = gather_sim(&["--nproc", "5", "--root", "3", "--dump-dag"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).expect("dag line is JSON"))
        .collect();
    assert_eq!(lines.len(), 5);
    for (rank, line) in lines.iter().enumerate() {
        assert_eq!(line.get("rank").and_then(Value::as_u64), Some(rank as u64));
    }

    let root_actions = lines[3]
        .get("actions")
        .and_then(Value::as_array)
        .expect("actions array");
    let kinds: Vec<&str> = root_actions
        .iter()
        .filter_map(|a| a.get("kind").and_then(Value::as_str))
        .collect();
    assert_eq!(kinds, vec!["send", "recv", "recv"]);
    assert!(
        !stdout.contains("gather_done"),
        "dump should not simulate: {stdout}"
    );
}

#[test]
fn gather_sim_rejects_root_outside_communicator() {
    let output = gather_sim(&["--nproc", "4", "--root", "4"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error:"), "stderr={stderr}");
}

#[test]
fn gather_sim_reports_public_memory_exhaustion() {
    let output = gather_sim(&["--nproc", "4", "--public-memory-bytes", "50"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error:"), "stderr={stderr}");
}

#[test]
fn gather_sim_rejects_result_that_overflows() {
    let output = gather_sim(&["--dump-dag", "--nproc", "8", "--nelems", "4611686018427387904"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid gather configuration"), "stderr={stderr}");
}

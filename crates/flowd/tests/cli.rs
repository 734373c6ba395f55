//! End-to-end tests of the `flowd` binary.
//!
//! Each test writes a config into a temporary directory and runs the
//! binary against it, so the whole stack (config, graph, worker,
//! coordinator) runs in the child process.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use flow_core::FlowConfig;

fn flowd(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_flowd"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("flowd runs")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn write_scaffold(dir: &Path) -> PathBuf {
    let path = dir.join("flowgrid.toml");
    let mut config = FlowConfig::scaffold("wordcount");
    config.coordinator.rpc_timeout = "2s".to_string();
    config.coordinator.modification_timeout = "5s".to_string();
    std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();
    path
}

fn modify(config: &Path, command: &str, args: &[&str]) -> Output {
    let config = config.to_str().unwrap();
    let mut argv = vec!["modify", "--config", config, "--command", command];
    argv.extend_from_slice(args);
    flowd(&argv)
}

#[test]
fn init_prints_a_parseable_config() {
    let output = flowd(&["init", "--name", "wordcount"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let config = FlowConfig::from_toml_str(&stdout(&output)).unwrap();
    assert_eq!(config.job.name, "wordcount");
    assert_eq!(config.job.vertices.len(), 2);
    config.validate().unwrap();
}

#[test]
fn init_writes_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("job.toml");

    let output = flowd(&["init", "--name", "clicks", "--output", path.to_str().unwrap()]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("Generated"));

    let config = FlowConfig::from_file(&path).unwrap();
    assert_eq!(config.job.name, "clicks");
}

#[test]
fn describe_prints_the_running_plan() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_scaffold(dir.path());

    let output = modify(&config, "describe", &[]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let plan = stdout(&output);
    assert!(plan.contains("Job 'wordcount'"));
    assert!(plan.contains("status RUNNING"));
    assert!(plan.contains("Vertex Source: Collection"));
    assert!(plan.contains("Vertex Map"));
}

#[test]
fn insert_after_source_adds_a_vertex() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_scaffold(dir.path());

    let output = modify(&config, "insert", &["source"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("inserted 'Inserted Operator'"));
    assert!(out.contains("Vertex Inserted Operator"));
}

#[test]
fn trigger_reports_json_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_scaffold(dir.path());

    let output = modify(&config, "trigger", &["source", "map", "--format", "json"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(json["outcome"]["outcome"], "control");
    assert_eq!(json["outcome"]["kind"], "trigger");
    assert_eq!(json["outcome"]["acknowledged"].as_array().unwrap().len(), 1);
    assert!(json["plan"].is_object() || json["plan"].is_array());
}

#[test]
fn restart_replaces_map_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_scaffold(dir.path());

    let output = modify(&config, "restart", &["map", "--format", "json"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(json["outcome"]["outcome"], "restarted");
    assert_eq!(json["outcome"]["previous"].as_array().unwrap().len(), 2);
    assert_eq!(json["outcome"]["attempts"].as_array().unwrap().len(), 2);
    assert_eq!(json["plan"]["status"], "RUNNING");
}

#[test]
fn pause_on_source_without_input_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_scaffold(dir.path());

    let output = modify(&config, "pause", &["source"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("consumed datasets"));
}

#[test]
fn insert_after_operator_without_output_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_scaffold(dir.path());

    // The last vertex of the scaffold produces nothing.
    let output = modify(&config, "insert", &["map"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("produced datasets"));
}

#[test]
fn unknown_modify_command_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_scaffold(dir.path());

    let output = modify(&config, "explode", &[]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("unknown modify command 'explode'"));
}

#[test]
fn missing_config_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let output = modify(&dir.path().join("absent.toml"), "describe", &[]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("absent.toml"));
}

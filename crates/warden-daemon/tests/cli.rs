use std::io::Write;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;

fn daemon() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("warden-daemon").unwrap()
}

fn write_temp(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("warden-cli-{}-{}", std::process::id(), name));
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    path
}

#[test]
fn test_help_exits_successfully() {
    daemon().arg("--help").assert().success();
}

#[test]
fn test_help_documents_flags() {
    let assert = daemon().arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    for flag in ["-f", "-w", "-m", "-d", "-b", "-n"] {
        assert!(output.contains(flag), "Help should document '{}'", flag);
    }
}

#[test]
fn test_missing_config_file_flag_fails() {
    daemon()
        .args(["-w", "/bin/sh"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("-f"));
}

#[test]
fn test_missing_worker_flag_fails() {
    daemon()
        .args(["-f", "/tmp/gpus.conf"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("-w"));
}

#[test]
fn test_unresolvable_worker_path_fails() {
    let config = write_temp("gpus.conf", "gpu0=GPU-aaaa\n");
    daemon()
        .args(["-f", config.to_str().unwrap()])
        .args(["-w", "/nonexistent/worker"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
    std::fs::remove_file(&config).unwrap();
}

#[test]
fn test_missing_gpu_config_file_fails() {
    daemon()
        .args(["-f", "/nonexistent/gpus.conf"])
        .args(["-w", "/bin/sh"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("gpus.conf"));
}

#[test]
fn test_malformed_gpu_config_fails() {
    let config = write_temp("gpus-bad.conf", "not-a-descriptor\n");
    daemon()
        .args(["-f", config.to_str().unwrap()])
        .args(["-w", "/bin/sh"])
        .arg("--fixed-gpu-memory")
        .arg("1073741824")
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing '='"));
    std::fs::remove_file(&config).unwrap();
}

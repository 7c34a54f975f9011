use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;

fn demo(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../demos").join(name)
}

fn nreduce() -> Command {
    let mut cmd = Command::cargo_bin("nreduce").expect("binary built");
    cmd.env_remove("NREDUCE_LOG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn runs_a_program_on_one_task() {
    nreduce()
        .arg("run")
        .arg(demo("fact.json"))
        .assert()
        .success()
        .stdout("3628800\n");
}

#[test]
fn runs_a_program_on_a_group() {
    nreduce()
        .args(["run", "-n", "3", "--seed", "5"])
        .arg(demo("fact.json"))
        .assert()
        .success()
        .stdout("3628800\n");
}

#[test]
fn printed_output_precedes_the_result() {
    nreduce()
        .arg("run")
        .arg(demo("hello.json"))
        .assert()
        .success()
        .stdout("hello, world\n42\n");
}

#[test]
fn json_results() {
    nreduce()
        .args(["run", "--json"])
        .arg(demo("fact.json"))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"type\":\"number\""));
}

#[test]
fn application_errors_fail_the_run() {
    nreduce()
        .arg("run")
        .arg(demo("divzero.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("division by zero"))
        .stderr(predicate::str::contains("main+"));
}

#[test]
fn check_validates_without_running() {
    nreduce()
        .arg("check")
        .arg(demo("fact.json"))
        .assert()
        .success()
        .stdout(predicate::str::starts_with("ok:"));
}

#[test]
fn malformed_programs_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(&path, r#"{"functions": [], "code": ["Begin", "End"], "main": 0}"#).unwrap();
    nreduce()
        .arg("check")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no functions"));
}

#[test]
fn master_spawns_local_workers() {
    let dir = tempfile::tempdir().unwrap();
    let hosts = dir.path().join("hosts");
    std::fs::write(&hosts, "127.0.0.1\n127.0.0.1\n").unwrap();
    nreduce()
        .args(["master", "--spawn", "--bootstrap", "127.0.0.1:0", "--hosts"])
        .arg(&hosts)
        .arg(demo("fact.json"))
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .success()
        .stdout("3628800\n");
}

//! The `specrun` binary: exit status and report formats

use std::path::Path;
use std::process::{Command, Output};

use specrun::Results;

const PASSING: &str = r#"
name: prebuilt-pass
prebuilt_tests:
  - name: echo
    args: [echo, hi]
    expect:
      stdout_contains: hi
"#;

const FAILING: &str = r#"
name: prebuilt-fail
prebuilt_tests:
  - name: wrong-exit
    args: [exit, "2"]
"#;

fn specrun(cwd: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_specrun"))
        .args(args)
        .arg("--prebuilt-binary")
        .arg(env!("CARGO_BIN_EXE_specrun-fixture"))
        .current_dir(cwd)
        .env_remove("CI")
        .env_remove("RUST_LOG")
        .env_remove("SPECRUN_CONFIG")
        .env("NO_COLOR", "1")
        .output()
        .unwrap()
}

fn write_spec(root: &Path, name: &str, yaml: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("test.yaml"), yaml).unwrap();
}

#[test]
fn test_all_passing_exits_zero_with_json_report() {
    let root = tempfile::tempdir().unwrap();
    write_spec(root.path(), "pass", PASSING);

    let output = specrun(root.path(), &["pass", "--format", "json", "--output", "out"]);
    assert_eq!(output.status.code(), Some(0), "{}", String::from_utf8_lossy(&output.stderr));

    let results: Results = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!((results.total, results.passed), (1, 1));
    assert!(root.path().join("out/test-results.json").is_file());
}

#[test]
fn test_any_failure_exits_one() {
    let root = tempfile::tempdir().unwrap();
    write_spec(root.path(), "pass", PASSING);
    write_spec(root.path(), "fail", FAILING);

    let output = specrun(root.path(), &["./...", "--format", "plain"]);
    assert_eq!(output.status.code(), Some(1));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("FAIL prebuilt-fail"), "{stdout}");
    assert!(stdout.contains("exit_code: expected 0, got 2"), "{stdout}");
    assert!(stdout.contains("FAILED: 1/2"), "{stdout}");
}

#[test]
fn test_name_filter_selects_specs() {
    let root = tempfile::tempdir().unwrap();
    write_spec(root.path(), "pass", PASSING);
    write_spec(root.path(), "fail", FAILING);

    let output = specrun(root.path(), &["./...", "--name", "pass", "--format", "plain"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).contains("PASSED: 1/1"));
}

#[test]
fn test_orchestration_errors_exit_two() {
    let root = tempfile::tempdir().unwrap();

    let output = specrun(root.path(), &["./..."]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no test.yaml files found"));

    write_spec(root.path(), "broken", "name: broken\ntests: [{name: a, path: /}]\ncli_tests: [{name: b}]\n");
    let output = specrun(root.path(), &["broken"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("broken"));
}

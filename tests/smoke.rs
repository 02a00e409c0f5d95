//! Smoke tests -- verify the binary runs and the cycle contract holds end to end.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn smokewatch() -> Command {
    let mut cmd = Command::cargo_bin("smokewatch").unwrap();
    cmd.env_remove("SMOKEWATCH_CONFIG")
        .env_remove("SMOKE_BASE_URL")
        .env_remove("SMOKE_MEMORY_PATH")
        .env_remove("SMOKE_VERBOSE")
        .env("RUST_LOG", "warn");
    cmd
}

/// A project where two of three filesystem probes pass.
fn project() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("src/app")).unwrap();
    std::fs::write(dir.path().join("package.json"), r#"{"name":"app"}"#).unwrap();
    std::fs::write(dir.path().join("src/app/layout.tsx"), "export default 1").unwrap();

    let config = format!(
        r#"
[target]
workdir = '{}'

[[probes.files]]
name = "Package"
paths = ["package.json"]

[[probes.files]]
name = "Layout"
paths = ["src/app/layout.tsx"]

[[probes.files]]
name = "Build Directory"
paths = [".next"]
"#,
        dir.path().display()
    );
    std::fs::write(dir.path().join("smokewatch.toml"), config).unwrap();
    dir
}

fn memory(dir: &Path) -> serde_json::Value {
    let raw = std::fs::read_to_string(dir.join(".smokewatch-memory.json")).unwrap();
    serde_json::from_str(&raw).unwrap()
}

#[test]
fn test_cli_help() {
    smokewatch()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Smoke tests with memory"));
}

#[test]
fn test_cli_version() {
    smokewatch()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("smokewatch"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["run", "watch", "report", "recover"] {
        smokewatch().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_watch_rejects_unknown_mode() {
    smokewatch()
        .args(["watch", "--mode", "eager"])
        .assert()
        .failure();
}

#[test]
fn test_run_fresh_memory_two_pass_one_fail() {
    let dir = project();

    smokewatch()
        .current_dir(dir.path())
        .arg("run")
        .assert()
        .code(1)
        .stdout(predicates::str::contains("Build Directory"))
        .stdout(predicates::str::contains("FAIL"))
        .stdout(predicates::str::contains("Passed: 2/3"));

    let m = memory(dir.path());
    assert_eq!(m["totalRuns"], 1);
    assert_eq!(m["consecutiveFails"], 1);
    assert_eq!(m["consecutivePasses"], 0);
    assert_eq!(m["testHistory"].as_array().unwrap().len(), 1);
    assert_eq!(m["testHistory"][0]["passed"], false);
}

#[test]
fn test_run_all_pass_exits_zero() {
    let dir = project();
    std::fs::create_dir_all(dir.path().join(".next")).unwrap();

    smokewatch()
        .current_dir(dir.path())
        .args(["run", "--json"])
        .assert()
        .success()
        .stdout(predicates::str::contains("\"passed\": true"));

    assert_eq!(memory(dir.path())["consecutivePasses"], 1);
}

#[test]
fn test_explicit_config_and_memory_override() {
    let dir = project();
    let elsewhere = TempDir::new().unwrap();
    let memory_path = elsewhere.path().join("health.json");

    smokewatch()
        .current_dir(elsewhere.path())
        .arg("--config")
        .arg(dir.path().join("smokewatch.toml"))
        .arg("--memory")
        .arg(&memory_path)
        .arg("run")
        .assert()
        .code(1);

    assert!(memory_path.exists());
    assert!(!dir.path().join(".smokewatch-memory.json").exists());
}

#[test]
fn test_missing_explicit_config_fails() {
    let dir = TempDir::new().unwrap();
    smokewatch()
        .current_dir(dir.path())
        .args(["--config", "nope.toml", "report"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("nope.toml"));
}

#[test]
fn test_report_on_fresh_memory() {
    let dir = project();
    smokewatch()
        .current_dir(dir.path())
        .args(["report", "--json"])
        .assert()
        .success()
        .stdout(predicates::str::contains("\"totalRuns\": 0"));
}

#[test]
fn test_report_after_failed_run() {
    let dir = project();
    smokewatch().current_dir(dir.path()).arg("run").assert().code(1);

    smokewatch()
        .current_dir(dir.path())
        .arg("report")
        .assert()
        .success()
        .stdout(predicates::str::contains("DEGRADED"))
        .stdout(predicates::str::contains("Pass rate:   0%"));
}

#[test]
fn test_recover_lists_last_failures() {
    let dir = project();

    smokewatch()
        .current_dir(dir.path())
        .arg("recover")
        .assert()
        .success()
        .stdout(predicates::str::contains("No runs recorded yet"));

    smokewatch().current_dir(dir.path()).arg("run").assert().code(1);

    smokewatch()
        .current_dir(dir.path())
        .arg("recover")
        .assert()
        .success()
        .stdout(predicates::str::contains("Build Directory failing"))
        .stdout(predicates::str::contains("rm -rf .next && npm run build"))
        .stdout(predicates::str::contains("Layout failing").not());
}

//! Smoke tests -- verify the binary runs and the config commands behave.

use assert_cmd::Command;
use predicates::prelude::*;

const DEPLOY_ENV: [&str; 6] = [
    "CENTER_HOST",
    "CENTER_TOKEN",
    "PROJECT_ID",
    "PROJECT_NS",
    "ORG_NAME",
    "WORKSPACE",
];

fn covagent() -> Command {
    let mut cmd = Command::cargo_bin("covagent").unwrap();
    cmd.env_remove("COVAGENT_CONFIG");
    for var in DEPLOY_ENV {
        cmd.env_remove(var);
    }
    cmd
}

fn write_config(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("covagent.toml");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_cli_help() {
    covagent()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("code coverage"));
}

#[test]
fn test_cli_version() {
    covagent()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("covagent"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["serve", "show-config", "check-config"] {
        covagent().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_show_config_prints_effective_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "[coordinator]\nhost = \"https://erda.example.com\"\n\n[dump]\nconcurrency = 3\n",
    );

    covagent()
        .args(["show-config", "--config"])
        .arg(&path)
        .env("PROJECT_NS", "project-7-dev")
        .assert()
        .success()
        .stdout(predicate::str::contains("[coordinator]"))
        .stdout(predicate::str::contains("https://erda.example.com"))
        .stdout(predicate::str::contains("concurrency = 3"))
        .stdout(predicate::str::contains("project-7-dev"));
}

#[test]
fn test_check_config_rejects_missing_host() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "[cluster]\nnamespace = \"default\"\n");

    covagent()
        .args(["check-config", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("coordinator.host"));
}

#[test]
fn test_check_config_accepts_env_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "");

    covagent()
        .args(["check-config", "--config"])
        .arg(&path)
        .env("CENTER_HOST", "https://erda.example.com")
        .env("CENTER_TOKEN", "secret")
        .env("PROJECT_NS", "project-7-dev")
        .env("PROJECT_ID", "7")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"));
}

#[test]
fn test_check_config_rejects_bad_project_id() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "");

    covagent()
        .args(["check-config", "--config"])
        .arg(&path)
        .env("PROJECT_ID", "seven")
        .assert()
        .failure()
        .stderr(predicate::str::contains("PROJECT_ID"));
}

#[test]
fn test_missing_config_file_fails() {
    covagent()
        .args(["check-config", "--config", "/nonexistent/covagent.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read config file"));
}

//! CLI smoke tests for the taskify binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn taskify() -> Command {
    let mut cmd = cargo_bin_cmd!("taskify");
    // Keep the developer's environment out of the layering under test.
    for key in [
        "DATABASE_URL",
        "JWT_ACCESS_SECRET",
        "JWT_REFRESH_SECRET",
        "SENDGRID_API_KEY",
        "GOOGLE_CLIENT_SECRET",
        "PORT",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

#[test]
fn test_help_lists_commands() {
    taskify()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("init-db"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_version() {
    taskify().arg("--version").assert().success();
}

#[test]
fn test_init_db_creates_file() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("data").join("taskify.db");

    taskify()
        .current_dir(dir.path())
        .arg("init-db")
        .arg("--db-path")
        .arg(&db_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Database initialized"));

    assert!(db_path.exists());

    // Running again migrates in place.
    taskify()
        .current_dir(dir.path())
        .arg("init-db")
        .arg("--db-path")
        .arg(&db_path)
        .assert()
        .success();
}

#[test]
fn test_config_redacts_secrets() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("taskify.toml");
    fs::write(
        &config_path,
        r#"
[server]
port = 7000

[auth]
access_secret = "super-secret-access"
refresh_secret = "super-secret-refresh"
"#,
    )
    .unwrap();

    taskify()
        .current_dir(dir.path())
        .arg("config")
        .arg("--config")
        .arg(&config_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("port = 7000"))
        .stdout(predicate::str::contains("********"))
        .stdout(predicate::str::contains("super-secret").not());
}

#[test]
fn test_env_overrides_config_file() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("taskify.toml"), "[server]\nport = 7000\n").unwrap();

    taskify()
        .current_dir(dir.path())
        .env("PORT", "7100")
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("port = 7100"));
}

#[test]
fn test_missing_config_file_fails() {
    let dir = TempDir::new().unwrap();
    taskify()
        .current_dir(dir.path())
        .arg("config")
        .arg("--config")
        .arg("nope.toml")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

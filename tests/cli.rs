//! End-to-end tests for the `downly` binary. None of these reach the network.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Binary running in an isolated directory with its own config home
fn downly(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("downly").unwrap();
    cmd.current_dir(home.path())
        .env("XDG_CONFIG_HOME", home.path().join("config"))
        .env("HOME", home.path())
        .env("DOWNLY_CACHE_DIR", home.path().join("cache"))
        .env("DOWNLY_TOOLS_DIR", home.path().join("bin"))
        .env_remove("DOWNLY_BIND")
        .env_remove("DOWNLY_COOKIE")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_lists_commands() {
    let home = tempfile::tempdir().unwrap();

    downly(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("inspect"))
        .stdout(predicate::str::contains("download"))
        .stdout(predicate::str::contains("serve"));
}

#[test]
fn test_config_show_prints_defaults() {
    let home = tempfile::tempdir().unwrap();

    downly(&home)
        .args(["config", "--show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("First Byte Timeout: 90s"))
        .stdout(predicate::str::contains("Extractor Retries: 3"));
}

#[test]
fn test_invalid_bind_is_rejected() {
    let home = tempfile::tempdir().unwrap();

    downly(&home)
        .env("DOWNLY_BIND", "not-an-address")
        .args(["config", "--show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid bind address"));
}

#[test]
fn test_download_requires_url() {
    let home = tempfile::tempdir().unwrap();

    downly(&home)
        .args(["download", "   ", "--format", "18"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Missing url"));
}

#[test]
fn test_inspect_rejects_non_http_urls() {
    let home = tempfile::tempdir().unwrap();

    downly(&home)
        .args(["inspect", "ftp://example.com/video"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("HTTP or HTTPS"));
}

#[test]
fn test_download_rejects_unknown_output() {
    let home = tempfile::tempdir().unwrap();

    downly(&home)
        .args(["download", "https://youtu.be/x", "-f", "18", "-o", "flac"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

//! Binary-level CLI tests: flag surface, validation, and exit codes.

use assert_cmd::Command;
use predicates::prelude::*;

fn hubproxy() -> Command {
    let mut cmd = Command::cargo_bin("hubproxy").unwrap();
    // A hermetic environment: no Hub contract, no spawner port.
    for key in [
        "JUPYTERHUB_API_URL",
        "JUPYTERHUB_API_TOKEN",
        "JUPYTERHUB_USER",
        "JUPYTERHUB_BASE_URL",
        "JUPYTERHUB_SERVICE_PREFIX",
        "JUPYTERHUB_CLIENT_ID",
        "JUPYTERHUB_HOST",
        "JHUB_APPS_SPAWNER_PORT",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

#[test]
fn help_shows_usage() {
    hubproxy()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--authtype"))
        .stdout(predicate::str::contains("--destport"))
        .stdout(predicate::str::contains("--ready-check-path"))
        .stdout(predicate::str::contains("--interim-page-auth"));
}

#[test]
fn version_flag_works() {
    hubproxy()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn missing_command_is_a_fatal_config_error() {
    hubproxy()
        .args(["--authtype", "none"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("no command specified"));
}

#[test]
fn oauth_mode_without_hub_env_fails_fast() {
    hubproxy()
        .args(["--authtype", "oauth", "--", "myapp"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("JUPYTERHUB_API_TOKEN"));
}

#[test]
fn invalid_authtype_is_rejected() {
    hubproxy()
        .args(["--authtype", "basic", "--", "myapp"])
        .assert()
        .failure();
}

#[test]
fn conflicting_keep_alive_flags_are_rejected() {
    hubproxy()
        .args(["--keep-alive", "--no-force-alive", "--", "myapp"])
        .assert()
        .failure();
}

#[test]
fn failing_git_clone_aborts_startup() {
    let dir = tempfile::tempdir().unwrap();
    hubproxy()
        .args([
            "--authtype",
            "none",
            "--repo",
            &format!("{}/no-such-repo.git", dir.path().display()),
            "--repofolder",
            &format!("{}/dest", dir.path().display()),
            "--",
            "myapp",
        ])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("git clone failed"));
}

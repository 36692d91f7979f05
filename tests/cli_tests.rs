//! CLI integration tests for the `depman` binary.
//!
//! These exercise the legacy `-nue <k> -f <hostfile> <restart_exec> <exec...>
//! <grid_x> <grid_y>` grammar by spawning the compiled binary and asserting
//! on its exit code and stderr, the way `assert_cmd` is used throughout this
//! codebase. None of these reach the point of launching a worker process —
//! they only cover argument validation and startup-time configuration
//! errors, which is everything that can be asserted on without a real
//! `rccerun`-style runner on `PATH`.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn missing_nue_flag_is_an_argument_error() {
    Command::cargo_bin("depman")
        .unwrap()
        .args(["-f", "hosts.txt", "restart", "worker", "8", "6"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("-nue"));
}

#[test]
fn missing_f_flag_is_an_argument_error() {
    Command::cargo_bin("depman")
        .unwrap()
        .args(["-nue", "2", "restart", "worker", "8", "6"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("-f"));
}

#[test]
fn too_few_trailing_arguments_is_an_argument_error() {
    Command::cargo_bin("depman")
        .unwrap()
        .args(["-nue", "2", "-f", "hosts.txt", "worker", "8"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("restart_exec"));
}

#[test]
fn non_numeric_core_count_is_an_argument_error() {
    Command::cargo_bin("depman")
        .unwrap()
        .args(["-nue", "not-a-number", "-f", "hosts.txt", "restart", "worker", "8", "6"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("invalid core count"));
}

#[test]
fn unreadable_hostfile_exits_with_code_one() {
    // Parses fine, but the supervisor fails to construct once it tries to
    // read a hostfile that does not exist.
    Command::cargo_bin("depman")
        .unwrap()
        .args([
            "-nue",
            "2",
            "-f",
            "/nonexistent/path/to/a/hostfile.txt",
            "restart",
            "worker",
            "8",
            "6",
        ])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn bad_config_path_exits_with_code_one() {
    Command::cargo_bin("depman")
        .unwrap()
        .args([
            "--config",
            "/nonexistent/depman.toml",
            "-nue",
            "2",
            "-f",
            "hosts.txt",
            "restart",
            "worker",
            "8",
            "6",
        ])
        .assert()
        .failure()
        .code(1);
}

//! End-to-end supervisor scenarios.
//!
//! These drive `depman::supervisor::Supervisor` as a library rather than
//! through the compiled binary: `rccerun_path` is pointed at a throwaway
//! shell script standing in for the real SCC runner, so the whole
//! spawn -> stdout-scan -> diagnostic -> escalation path runs for real, just
//! against a fake worker instead of actual hardware.
//!
//! The synthetic `FAILURE` lines below reproduce the exact byte layout
//! `ProcessExit::process_line` expects: 23 filler bytes, a 6-byte core field
//! at `[23, 29)`, the literal word `FAILURE`, and an error code in the final
//! 4 bytes before the last one.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use depman::config::{Config, DiagnosticKind};
use depman::error::DepmanError;
use depman::handle::SupervisorHandle;
use depman::supervisor::Supervisor;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn write_hostfile(dir: &Path) -> PathBuf {
    let path = dir.join("hosts.txt");
    fs::write(&path, "00\n01\n").unwrap();
    path
}

fn base_config(dir: &Path, rccerun: PathBuf) -> Config {
    Config {
        diagnostics: vec![DiagnosticKind::ProcessExit],
        moving_avg_n: 50,
        file_poll_interval: Duration::from_millis(20),
        ping_interval: Duration::from_millis(20),
        injector_min_dt: Duration::from_millis(20),
        sim_dump_location: dir.join("dump"),
        safe_location: dir.join("safe"),
        dev_mode: true,
        cellstate_size: depman::config::CELLSTATE_SIZE_DEV,
        cellcount: 10,
        use_sdc_checkpoints: false,
        rccerun_path: rccerun,
        sccreset_path: PathBuf::from("sccReset"),
        sccboot_path: PathBuf::from("sccBoot"),
        sccbmc_path: PathBuf::from("sccBmc"),
        injectors_dir: dir.join("injectors"),
        injection_enabled: false,
        num_cores: 2,
        hostfile: write_hostfile(dir),
        restart_exec: "worker".into(),
        exec_argv: vec!["worker".into()],
        grid_x: 8,
        grid_y: 6,
    }
}

/// A worker that runs for a bit and then exits cleanly: with only the
/// process-exit diagnostic enabled, `completed()` is unconditionally `true`
/// (it has no notion of simulation progress of its own), so the run loop
/// should wind down as soon as the worker process itself has exited (§4.8),
/// not before.
#[test]
fn healthy_worker_completes_once_it_exits() {
    let dir = tempfile::tempdir().unwrap();
    let rccerun = write_script(dir.path(), "rccerun", "sleep 0.2\nexit 0");
    let config = base_config(dir.path(), rccerun);

    let supervisor = Supervisor::new(config).unwrap();
    let result = supervisor.start();

    assert!(result.is_ok());
    assert!(supervisor.stopped());
}

/// A worker that is still running when the poll tick fires must never be
/// declared complete: the healthy-completion branch is gated on the worker
/// process actually having exited (§4.8), not merely on diagnostics
/// reporting `completed()`. The worker outlives a few poll intervals before
/// exiting on its own, and the run must not have finished before then.
#[test]
fn healthy_completion_is_not_declared_while_the_worker_is_still_running() {
    let dir = tempfile::tempdir().unwrap();
    let rccerun = write_script(dir.path(), "rccerun", "sleep 0.3\nexit 0");
    let config = base_config(dir.path(), rccerun);

    let supervisor = Supervisor::new(config).unwrap();
    let watcher = supervisor.clone();
    let handle = std::thread::spawn(move || watcher.start());

    std::thread::sleep(Duration::from_millis(60));
    assert!(!handle.is_finished(), "worker is still running; the run must not have completed yet");

    let result = handle.join().unwrap();
    assert!(result.is_ok());
    assert!(supervisor.stopped());
}

/// A worker that immediately reports a process-exit failure, with no
/// checkpoint ever having been produced: the escalation ladder is never even
/// consulted because the "no checkpoint ever existed" short-circuit (S4.5)
/// fires first, declaring the run unrecoverable.
#[test]
fn process_exit_failure_with_no_checkpoints_is_unrecoverable() {
    let dir = tempfile::tempdir().unwrap();
    // 23 filler bytes, then the 6-byte core field `rck001` at [23, 29), then
    // the marker text, then an error code whose last 4 bytes are "0171"
    // (trailing_slice(4, 1) yields "017" -> code 17).
    let failure_line = format!("{}{}", "A".repeat(23), "rck001 middle FAILURE middle 0171");

    let rccerun = write_script(
        dir.path(),
        "rccerun",
        &format!("printf '%s\\n' \"{failure_line}\"\nsleep 30"),
    );
    let config = base_config(dir.path(), rccerun);

    let supervisor = Supervisor::new(config).unwrap();
    let result = supervisor.start();

    assert!(matches!(result, Err(DepmanError::Unrecoverable)));
}

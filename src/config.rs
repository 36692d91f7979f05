//! # Configuration — CLI grammar, `depman.toml` overlay, and the layered record
//!
//! Three layers, applied in this order: built-in defaults, an optional
//! `depman.toml` file, then CLI flags. The result is a single immutable
//! [`Config`] constructed once at startup and passed by reference from then
//! on (§10.2, §9 "Global configuration module").
//!
//! The CLI grammar (§6) mixes a legacy single-dash multi-letter flag
//! (`-nue <k>`), a trailing executable-argument vector, and two trailing
//! positional integers — a shape `clap`'s derive macros cannot express
//! directly, so it is parsed by hand below.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Deserialize;

use crate::error::DepmanError;
use crate::grid::CoreId;

/// Search for a binary in `PATH` via `which`. Mirrors the pattern every
/// external-tool lookup in this crate follows: shell out rather than walk
/// `$PATH` by hand.
fn find_in_path(name: &str) -> Option<PathBuf> {
    Command::new("which")
        .arg(name)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| PathBuf::from(s.trim()))
        .filter(|p| p.exists())
}

/// Environment check (§6): `sccReset` must be resolvable in `PATH` before the
/// supervisor launches anything. In dev mode every reset/boot tool is
/// replaced by `echo`, which is always present, so the check is skipped.
pub fn check_environment(dev_mode: bool) -> Result<(), DepmanError> {
    if dev_mode {
        return Ok(());
    }
    if find_in_path("sccReset").is_none() {
        return Err(DepmanError::Environment {
            tool: "sccReset".into(),
        });
    }
    Ok(())
}

/// `cellstate_size` in bytes, production build.
pub const CELLSTATE_SIZE_PRODUCTION: usize = 168;
/// `cellstate_size` in bytes, dev build (used whenever `dev_mode` is set).
pub const CELLSTATE_SIZE_DEV: usize = 172;

/// Which diagnostics are enabled for a run. Absent ones are silently
/// disabled (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    InfoliOutputDivergence,
    ProcessExit,
    CoreReachability,
}

/// Raw CLI surface, parsed from `argv` before any config-file layering.
#[derive(Debug, Clone)]
pub struct CliArgs {
    pub injection_enabled: bool,
    pub dev_mode: bool,
    pub num_cores: usize,
    pub hostfile: PathBuf,
    pub restart_exec: String,
    pub exec_argv: Vec<String>,
    pub grid_x: usize,
    pub grid_y: usize,
    pub config_path: Option<PathBuf>,
}

/// `supervisor [-i] [--dev] [--config <path>] -nue <k> -f <hostfile>
/// <restart_exec> <exec...> <grid_x> <grid_y>`
pub fn parse_cli(argv: &[String]) -> Result<CliArgs, DepmanError> {
    let mut injection_enabled = false;
    let mut dev_mode = false;
    let mut num_cores: Option<usize> = None;
    let mut hostfile: Option<PathBuf> = None;
    let mut config_path: Option<PathBuf> = None;
    let mut rest: Vec<String> = Vec::new();

    let mut i = 0;
    while i < argv.len() {
        match argv[i].as_str() {
            "-i" => injection_enabled = true,
            "--dev" | "--dry-run" => dev_mode = true,
            "-nue" => {
                i += 1;
                let value = argv
                    .get(i)
                    .ok_or_else(|| DepmanError::Argument("-nue requires a core count".into()))?;
                num_cores = Some(
                    value
                        .parse()
                        .map_err(|_| DepmanError::Argument(format!("invalid core count: {value}")))?,
                );
            }
            "-f" => {
                i += 1;
                let value = argv
                    .get(i)
                    .ok_or_else(|| DepmanError::Argument("-f requires a hostfile path".into()))?;
                hostfile = Some(PathBuf::from(value));
            }
            "--config" => {
                i += 1;
                let value = argv
                    .get(i)
                    .ok_or_else(|| DepmanError::Argument("--config requires a path".into()))?;
                config_path = Some(PathBuf::from(value));
            }
            other => rest.push(other.to_string()),
        }
        i += 1;
    }

    let num_cores = num_cores.ok_or_else(|| DepmanError::Argument("missing required -nue <k>".into()))?;
    let hostfile = hostfile.ok_or_else(|| DepmanError::Argument("missing required -f <hostfile>".into()))?;

    // `rest` is now: <restart_exec> <exec...> <grid_x> <grid_y>
    if rest.len() < 3 {
        return Err(DepmanError::Argument(
            "expected <restart_exec> <exec...> <grid_x> <grid_y>".into(),
        ));
    }
    let grid_y: usize = rest
        .pop()
        .unwrap()
        .parse()
        .map_err(|_| DepmanError::Argument("grid_y must be an integer".into()))?;
    let grid_x: usize = rest
        .pop()
        .unwrap()
        .parse()
        .map_err(|_| DepmanError::Argument("grid_x must be an integer".into()))?;
    let restart_exec = rest.remove(0);
    let exec_argv = rest;

    Ok(CliArgs {
        injection_enabled,
        dev_mode,
        num_cores,
        hostfile,
        restart_exec,
        exec_argv,
        grid_x,
        grid_y,
        config_path,
    })
}

/// Parse a hostfile: one two-digit core number per non-empty line. Keeps the
/// *first* `num_cores` entries if the file has more lines than requested
/// (§9 open question 3 — the original dropped the first `num_cores` entries
/// instead, which the spec treats as a bug).
pub fn read_hostfile(path: &Path, num_cores: usize) -> Result<Vec<CoreId>, DepmanError> {
    let text = std::fs::read_to_string(path).map_err(|source| DepmanError::IoTransient {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cores = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let core = CoreId::parse(line)
            .ok_or_else(|| DepmanError::Argument(format!("invalid core id in hostfile: {line}")))?;
        cores.push(core);
    }
    cores.truncate(num_cores);
    if cores.len() < num_cores {
        return Err(DepmanError::Argument(format!(
            "hostfile {} has only {} entries but {} cores were requested",
            path.display(),
            cores.len(),
            num_cores
        )));
    }
    Ok(cores)
}

/// Optional `depman.toml` overlay. Every field is optional; absent ones fall
/// through to the built-in default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub diagnostics: Option<Vec<DiagnosticKind>>,
    pub moving_avg_n: Option<usize>,
    pub file_poll_ms: Option<u64>,
    pub ping_interval_ms: Option<u64>,
    pub injector_min_dt_ms: Option<u64>,
    pub sim_dump_location: Option<PathBuf>,
    pub safe_location: Option<PathBuf>,
    pub use_sdc_checkpoints: Option<bool>,
    pub rccerun_path: Option<PathBuf>,
    pub sccreset_path: Option<PathBuf>,
    pub sccboot_path: Option<PathBuf>,
    pub sccbmc_path: Option<PathBuf>,
    pub injectors_dir: Option<PathBuf>,
    pub cellcount: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, DepmanError> {
        let text = std::fs::read_to_string(path).map_err(|source| DepmanError::IoTransient {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|e| DepmanError::Argument(format!("invalid config file {}: {e}", path.display())))
    }
}

/// The supervisor's single immutable configuration record, built once at
/// startup and passed by reference everywhere (§9 "Global configuration
/// module").
#[derive(Debug, Clone)]
pub struct Config {
    pub diagnostics: Vec<DiagnosticKind>,
    pub moving_avg_n: usize,
    pub file_poll_interval: std::time::Duration,
    pub ping_interval: std::time::Duration,
    pub injector_min_dt: std::time::Duration,
    pub sim_dump_location: PathBuf,
    pub safe_location: PathBuf,
    pub dev_mode: bool,
    pub cellstate_size: usize,
    pub cellcount: usize,
    pub use_sdc_checkpoints: bool,
    pub rccerun_path: PathBuf,
    pub sccreset_path: PathBuf,
    pub sccboot_path: PathBuf,
    pub sccbmc_path: PathBuf,
    pub injectors_dir: PathBuf,
    pub injection_enabled: bool,
    pub num_cores: usize,
    pub hostfile: PathBuf,
    pub restart_exec: String,
    pub exec_argv: Vec<String>,
    pub grid_x: usize,
    pub grid_y: usize,
}

impl Config {
    /// Layer built-in defaults -> `depman.toml` (if present) -> CLI flags.
    pub fn build(args: CliArgs) -> Result<Self, DepmanError> {
        let file = match &args.config_path {
            Some(p) => FileConfig::load(p)?,
            None => {
                let default_path = PathBuf::from("depman.toml");
                if default_path.exists() {
                    FileConfig::load(&default_path)?
                } else {
                    FileConfig::default()
                }
            }
        };

        let diagnostics = file.diagnostics.unwrap_or_else(|| {
            vec![
                DiagnosticKind::InfoliOutputDivergence,
                DiagnosticKind::ProcessExit,
                DiagnosticKind::CoreReachability,
            ]
        });

        let use_sdc_checkpoints = file.use_sdc_checkpoints.unwrap_or(true);
        let has_sdc_detector = diagnostics.contains(&DiagnosticKind::InfoliOutputDivergence);
        let use_sdc_checkpoints = if use_sdc_checkpoints && !has_sdc_detector {
            tracing::warn!("SDC checkpoints requested but no SDC detector is enabled; downgrading to DUE-only");
            false
        } else {
            use_sdc_checkpoints
        };

        let cellstate_size = if args.dev_mode {
            CELLSTATE_SIZE_DEV
        } else {
            CELLSTATE_SIZE_PRODUCTION
        };

        Ok(Config {
            diagnostics,
            moving_avg_n: file.moving_avg_n.unwrap_or(50),
            file_poll_interval: std::time::Duration::from_millis(file.file_poll_ms.unwrap_or(400)),
            ping_interval: std::time::Duration::from_millis(file.ping_interval_ms.unwrap_or(500)),
            injector_min_dt: std::time::Duration::from_millis(file.injector_min_dt_ms.unwrap_or(1000)),
            sim_dump_location: file.sim_dump_location.unwrap_or_else(|| PathBuf::from("sim_dump")),
            safe_location: file.safe_location.unwrap_or_else(|| PathBuf::from("safe")),
            dev_mode: args.dev_mode,
            cellstate_size,
            cellcount: file.cellcount.unwrap_or(2000),
            use_sdc_checkpoints,
            rccerun_path: file.rccerun_path.unwrap_or_else(|| PathBuf::from("rccerun")),
            sccreset_path: file.sccreset_path.unwrap_or_else(|| PathBuf::from("sccReset")),
            sccboot_path: file.sccboot_path.unwrap_or_else(|| PathBuf::from("sccBoot")),
            sccbmc_path: file.sccbmc_path.unwrap_or_else(|| PathBuf::from("sccBmc")),
            injectors_dir: file
                .injectors_dir
                .unwrap_or_else(|| PathBuf::from("sim_dump/injectors")),
            injection_enabled: args.injection_enabled,
            num_cores: args.num_cores,
            hostfile: args.hostfile,
            restart_exec: args.restart_exec,
            exec_argv: args.exec_argv,
            grid_x: args.grid_x,
            grid_y: args.grid_y,
        })
    }
}

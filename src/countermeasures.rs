//! # Countermeasures — Escalating Repair Actions
//!
//! Each countermeasure is one rung on a diagnostic's escalation ladder.
//! Cost is a compile-time property of the type rather than a name looked up
//! in a table at runtime, so `determine_countermeasures` in
//! [`crate::supervisor`] compares `u32`s directly instead of re-deriving a
//! class name from `__name__`.

use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::grid::CoreId;
use crate::handle::SupervisorHandle;

/// Relative time-to-repair ranking. Higher costs escalate to more invasive
/// repairs and are only tried once cheaper ones are exhausted.
pub const COST_RESTART_SIMULATION: u32 = 0;
pub const COST_CORE_REBOOT: u32 = 1;
pub const COST_PLATFORM_REINITIALIZATION: u32 = 2;

/// One repair action in an escalation tier.
pub trait CountermeasureStep: Send + Sync {
    /// Human-readable name, used in logs and in [`crate::error::DepmanError`].
    fn name(&self) -> &'static str;

    /// This step's place in the cost ordering.
    fn cost(&self) -> u32;

    /// Attempt the repair. `false` means this tier has failed and the
    /// supervisor should fall through to the next one.
    fn perform(&self) -> bool;
}

/// Whether the platform tools are stubbed out (development/CI) rather than
/// talking to real SCC hardware. When set, `sccBoot`/`sccReset`/`sccBmc`
/// calls are replaced with `echo` so the escalation ladder can be exercised
/// without a board attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformMode {
    Hardware,
    Devel,
}

impl PlatformMode {
    fn tool(self, hardware_name: &'static str) -> &'static str {
        match self {
            PlatformMode::Hardware => hardware_name,
            PlatformMode::Devel => "echo",
        }
    }
}

/// Restart the simulation from the newest validated checkpoint. Always the
/// cheapest option: no hardware is touched, just a process relaunch.
pub struct RestartSimulation {
    manager: Arc<dyn SupervisorHandle>,
}

impl RestartSimulation {
    pub fn new(manager: Arc<dyn SupervisorHandle>) -> Self {
        RestartSimulation { manager }
    }
}

impl RestartSimulation {
    /// Pick the checkpoint to resume from (§4.5): checkpoints strictly below
    /// `min_step` are pruned except for the single largest one, which is
    /// always retained — not just as a fallback — so an SDC failure has a
    /// pre-detection-window checkpoint to rewind to even when newer
    /// checkpoints at or above `min_step` exist. Among what remains, an SDC
    /// failure resumes from the *oldest* retained checkpoint — the
    /// corruption could already be baked into newer ones — while any other
    /// failure resumes from the newest.
    fn select_checkpoint(&self) -> Option<u32> {
        let min_step = self.manager.min_step() as u32;
        let mut checkpoints = self.manager.checkpoints();
        checkpoints.sort_unstable();

        let mut retained: Vec<u32> = checkpoints.iter().copied().filter(|&c| c >= min_step).collect();
        if let Some(&largest_below) = checkpoints.iter().filter(|&&c| c < min_step).max() {
            retained.push(largest_below);
        }
        if retained.is_empty() {
            return None;
        }

        let sdc_failed = self
            .manager
            .failed_diagnostics()
            .iter()
            .any(|d| d.is_sdc());

        Some(if sdc_failed {
            *retained.iter().min().unwrap()
        } else {
            *retained.iter().max().unwrap()
        })
    }
}

impl CountermeasureStep for RestartSimulation {
    fn name(&self) -> &'static str {
        "restart_simulation"
    }

    fn cost(&self) -> u32 {
        COST_RESTART_SIMULATION
    }

    fn perform(&self) -> bool {
        info!("performing the restart simulation countermeasure");
        let checkpoint = match self.select_checkpoint() {
            Some(c) => c,
            None => {
                warn!("restart requested with no validated checkpoints available");
                return false;
            }
        };
        info!(step = checkpoint, "restarting from checkpoint");

        let safe_dir = self.manager.safe_location().join(checkpoint.to_string());
        let dump_dir = self.manager.sim_dump_location();
        for core in 0..self.manager.num_cores() {
            let ckpt = safe_dir.join(format!("ckptFile{core}.bin"));
            let output = safe_dir.join(format!("InferiorOlive_Output{core}.txt"));
            copy_if_newer(&ckpt, &dump_dir);
            copy_if_newer(&output, &dump_dir);
        }

        let mut argv = self.manager.restart_argv();
        if argv.is_empty() {
            warn!("no restart argv recorded; cannot relaunch the simulation");
            return false;
        }
        // argv[0] is the ordinary launch executable; swap it for the
        // restart-specific one while keeping the rest of the parameter list.
        argv.remove(0);
        self.manager.rccerun(argv);
        info!("restart simulation countermeasure completed");
        true
    }
}

fn copy_if_newer(src: &std::path::Path, dest_dir: &std::path::Path) {
    if !src.exists() {
        return;
    }
    let Some(name) = src.file_name() else { return };
    let dest = dest_dir.join(name);
    let should_copy = match (std::fs::metadata(src), std::fs::metadata(&dest)) {
        (Ok(s), Ok(d)) => s.modified().ok() > d.modified().ok(),
        _ => true,
    };
    if should_copy {
        if let Err(e) = std::fs::copy(src, &dest) {
            warn!(path = %src.display(), error = %e, "failed to copy checkpoint file");
        }
    }
}

/// Power-cycle a subset of cores and wait for them to rejoin the platform.
pub struct CoreReboot {
    reboot_cores: Vec<CoreId>,
    all_cores: Vec<CoreId>,
    mode: PlatformMode,
}

impl CoreReboot {
    pub fn new(reboot_cores: Vec<CoreId>, all_cores: Vec<CoreId>, mode: PlatformMode) -> Self {
        CoreReboot {
            reboot_cores,
            all_cores,
            mode,
        }
    }
}

impl CountermeasureStep for CoreReboot {
    fn name(&self) -> &'static str {
        "core_reboot"
    }

    fn cost(&self) -> u32 {
        COST_CORE_REBOOT
    }

    fn perform(&self) -> bool {
        let tool = self.mode.tool("sccReset");
        info!(count = self.reboot_cores.len(), "core reboot countermeasure started");
        let numbers: Vec<String> = self.reboot_cores.iter().map(|c| c.0.to_string()).collect();

        let mut power = Command::new(tool);
        power.arg("-p").args(&numbers);
        let _ = power.status();

        let mut reset = Command::new(tool);
        reset.arg("-r").args(&numbers);
        let _ = reset.status();

        if !boot_linux(self.mode) {
            return false;
        }
        info!(count = self.all_cores.len(), "waiting for response from rebooted cores");
        if !wait_for_cores(&self.all_cores, Duration::from_secs(180), self.mode) {
            return false;
        }
        info!("core reboot countermeasure completed");
        true
    }
}

/// Reinitialize the whole SCC board — the most invasive and most expensive
/// countermeasure, used once core-level reboots stop being enough.
pub struct PlatformReinitialization {
    expected_cores: Vec<CoreId>,
    mode: PlatformMode,
}

impl PlatformReinitialization {
    pub fn new(expected_cores: Vec<CoreId>, mode: PlatformMode) -> Self {
        PlatformReinitialization {
            expected_cores,
            mode,
        }
    }
}

impl CountermeasureStep for PlatformReinitialization {
    fn name(&self) -> &'static str {
        "platform_reinitialization"
    }

    fn cost(&self) -> u32 {
        COST_PLATFORM_REINITIALIZATION
    }

    fn perform(&self) -> bool {
        info!("reinitializing the platform");
        let tool = self.mode.tool("sccBmc");
        let status = Command::new(tool).args(["-i", "Tile533_Mesh800_DDR800"]).status();
        match status {
            Ok(s) if s.success() => {}
            Ok(s) => {
                warn!(code = s.code(), "platform reinitialization tool returned a nonzero exit code");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "failed to invoke the platform reinitialization tool");
                return false;
            }
        }
        if !boot_linux(self.mode) {
            return false;
        }
        info!(count = self.expected_cores.len(), "waiting for response after platform reinit");
        if !wait_for_cores(&self.expected_cores, Duration::from_secs(180), self.mode) {
            return false;
        }
        info!("platform reinitialization countermeasure completed");
        true
    }
}

fn boot_linux(mode: PlatformMode) -> bool {
    info!("booting linux on all cores");
    let tool = mode.tool("sccBoot");
    let status = Command::new(tool).arg("-l").status();
    match status {
        Ok(s) if s.success() => true,
        Ok(s) => {
            warn!(code = s.code(), "sccBoot returned a nonzero exit code during boot_linux");
            false
        }
        Err(e) => {
            warn!(error = %e, "failed to invoke sccBoot during boot_linux");
            false
        }
    }
}

/// Poll `sccBoot -s` until `core_names` are all reporting in, or `timeout`
/// elapses. In [`PlatformMode::Devel`] this is a no-op success.
fn wait_for_cores(core_names: &[CoreId], timeout: Duration, mode: PlatformMode) -> bool {
    if mode == PlatformMode::Devel {
        return true;
    }

    let deadline = Instant::now() + timeout;
    let mut available = 0usize;
    while available < core_names.len() {
        let Ok(output) = Command::new("sccBoot").arg("-s").output() else {
            return false;
        };
        let status = String::from_utf8_lossy(&output.stdout);
        available = parse_core_count(&status);

        if Instant::now() > deadline {
            warn!(expected = core_names.len(), "timeout exceeded waiting for cores");
            return false;
        }
    }
    std::thread::sleep(Duration::from_secs(10));
    true
}

/// Parses the tail of an `sccBoot -s` status line: `"All"` means every core
/// of the 48 is up, `"No"` none are, otherwise a two-digit count precedes it.
fn parse_core_count(status: &str) -> usize {
    let trimmed = status.trim_end();
    if trimmed.ends_with("All") {
        48
    } else if trimmed.ends_with("No") {
        0
    } else {
        trimmed
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .chars()
            .rev()
            .collect::<String>()
            .parse()
            .unwrap_or(0)
    }
}

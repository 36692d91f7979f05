//! # Fault Injector — stochastic synthetic failures
//!
//! Optional. Each injector kind reads its own schedule file of
//! `(time_offset_seconds, mttf_seconds)` rows, advances through it as wall
//! time passes, and on every tick draws against an exponential failure law
//! to decide whether to strike. At most one injector fires per tick across
//! the whole set (§4.7).

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{info, warn};

use crate::countermeasures::PlatformMode;
use crate::error::DepmanError;
use crate::grid::CoreId;
use crate::handle::SupervisorHandle;

/// One row of an injector schedule: `mttf` in seconds becomes active once
/// `time_offset` seconds have elapsed since the injector was (re)started.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleRow {
    pub time_offset: f64,
    pub mttf: f64,
}

/// Parses a schedule file: non-empty lines of two whitespace-separated
/// floats, `time_offset` then `mttf`.
pub fn parse_schedule(path: &Path) -> std::io::Result<Vec<ScheduleRow>> {
    let text = std::fs::read_to_string(path)?;
    let mut rows = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(a), Some(b)) = (fields.next(), fields.next()) else {
            continue;
        };
        if let (Ok(time_offset), Ok(mttf)) = (a.parse(), b.parse()) {
            rows.push(ScheduleRow { time_offset, mttf });
        }
    }
    Ok(rows)
}

/// The failure effect a given injector kind performs when it fires.
#[derive(Debug, Clone)]
pub enum InjectorKind {
    /// `procexitjector` — a synthetic `FAILURE` line on the worker's stdout.
    ProcessExit,
    /// `infolijector` — a first-four-bits flip in a random core's output file.
    OutputCorruption,
    /// `corefailjector` — a platform reset against a random active core.
    CoreFailure { mode: PlatformMode },
    /// `coreshutjector` — marks a random active core permanently unreachable.
    CoreShutdown,
}

impl InjectorKind {
    fn name(&self) -> &'static str {
        match self {
            InjectorKind::ProcessExit => "procexitjector",
            InjectorKind::OutputCorruption => "infolijector",
            InjectorKind::CoreFailure { .. } => "corefailjector",
            InjectorKind::CoreShutdown => "coreshutjector",
        }
    }

    fn fire(&self, manager: &Arc<dyn SupervisorHandle>, rng: &mut impl Rng) {
        let cores = manager.cores();
        if cores.is_empty() {
            return;
        }
        let target = cores[rng.gen_range(0..cores.len())];
        info!(kind = self.name(), core = %target, "fault injector firing");

        match self {
            InjectorKind::ProcessExit => {
                manager.inject_stdout_failure(&format!(
                    "injected synthetic FAILURE core {target} code 17"
                ));
            }
            InjectorKind::OutputCorruption => {
                manager.inject_output_bitflip(target);
            }
            InjectorKind::CoreFailure { mode } => {
                let tool = mode.tool("sccReset");
                let status = Command::new(tool).arg("-r").arg(target.0.to_string()).status();
                if let Err(e) = status {
                    warn!(error = %e, "fault injector failed to invoke the reset tool");
                }
            }
            InjectorKind::CoreShutdown => {
                manager.inject_unreachable(target);
            }
        }
    }
}

/// Drives one injector's schedule forward over time. `tick()` is meant to be
/// called on the configured polling cadence (`min_Δt`, §5).
pub struct Injector {
    kind: InjectorKind,
    schedule: Vec<ScheduleRow>,
    schedule_path: PathBuf,
    index: usize,
    mttf: f64,
    start: Instant,
    last_tick: Instant,
    disabled: bool,
}

impl Injector {
    pub fn new(kind: InjectorKind, schedule_path: PathBuf) -> Result<Self, DepmanError> {
        let schedule = parse_schedule(&schedule_path).map_err(|source| DepmanError::IoTransient {
            path: schedule_path.clone(),
            source,
        })?;
        let now = Instant::now();
        let mttf = schedule.first().map(|r| r.mttf).unwrap_or(0.0);
        let mut this = Injector {
            kind,
            schedule,
            schedule_path,
            index: 0,
            mttf,
            start: now,
            last_tick: now,
            disabled: false,
        };
        this.disabled = this.mttf == 0.0;
        Ok(this)
    }

    pub fn disabled(&self) -> bool {
        self.disabled
    }

    /// Advance the schedule row if enough wall time has elapsed, recompute
    /// the tick's instantaneous failure probability, and draw against it.
    /// Returns `true` if this injector fired (at most one effect per call).
    pub fn tick(&mut self, manager: &Arc<dyn SupervisorHandle>, rng: &mut impl Rng) -> bool {
        if self.disabled {
            return false;
        }

        let elapsed_since_start = self.start.elapsed().as_secs_f64();
        while self.index + 1 < self.schedule.len()
            && elapsed_since_start >= self.schedule[self.index + 1].time_offset
        {
            self.index += 1;
            self.mttf = self.schedule[self.index].mttf;
            if self.mttf == 0.0 {
                warn!(schedule = %self.schedule_path.display(), "zero MTTF in injector schedule; halting injection");
                self.disabled = true;
                return false;
            }
        }

        let now = Instant::now();
        let dt = now.duration_since(self.last_tick).as_secs_f64();
        self.last_tick = now;

        let p = probability(dt, self.mttf);
        let draw: f64 = rng.gen_range(0.0..1.0);
        if draw < p {
            self.kind.fire(manager, rng);
            true
        } else {
            false
        }
    }

    /// Rebase all timestamps to "now", as if the injector had just started.
    /// Called after a recovery so a long countermeasure episode doesn't
    /// leave a backlog of elapsed time that piles probability onto the next
    /// tick.
    pub fn reinit(&mut self) {
        let now = Instant::now();
        self.start = now;
        self.last_tick = now;
        self.index = 0;
        self.mttf = self.schedule.first().map(|r| r.mttf).unwrap_or(0.0);
        self.disabled = self.mttf == 0.0;
    }
}

/// `p = 1 - e^(-Δt / mttf)`.
pub fn probability(dt: f64, mttf: f64) -> f64 {
    if mttf <= 0.0 {
        return 0.0;
    }
    1.0 - (-dt / mttf).exp()
}

/// Runs a tick of every configured injector, enforcing the at-most-one-
/// injection-per-tick rule across the whole set (§4.7 step 3, §8 property 7).
pub struct InjectorSet {
    injectors: Vec<Injector>,
}

impl InjectorSet {
    pub fn new(injectors: Vec<Injector>) -> Self {
        InjectorSet { injectors }
    }

    pub fn is_empty(&self) -> bool {
        self.injectors.is_empty()
    }

    /// Tick every injector in turn, stopping at the first one that fires.
    pub fn tick(&mut self, manager: &Arc<dyn SupervisorHandle>, rng: &mut impl Rng) {
        for injector in &mut self.injectors {
            if injector.tick(manager, rng) {
                break;
            }
        }
    }

    pub fn reinit(&mut self) {
        for injector in &mut self.injectors {
            injector.reinit();
        }
    }
}

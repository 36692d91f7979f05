//! # Supervisor — the event loop that ties every other module together
//!
//! Owns the worker process, the fixed core assignment, the checkpoint
//! validator, and the diagnostics watching them. [`Supervisor::start`] is the
//! only place all of those get wired together; everything else in this
//! crate only ever sees the narrow [`SupervisorHandle`] seam.
//!
//! Two-phase construction (§9): [`Supervisor::new`] builds an inert struct
//! with no running threads, so the `Arc<dyn SupervisorHandle>` clones handed
//! to the diagnostics are always complete by the time anything can call back
//! into them. [`Supervisor::start`] is what actually spawns the worker and
//! enters the escalation loop.

use std::collections::VecDeque;
use std::fs;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

/// Set by the process's SIGINT handler (installed in `main`). The event loop
/// checks this once per polling interval rather than the handler doing any
/// work beyond the store itself (§5).
static HALT_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Request that every running supervisor wind down at the next poll. Safe to
/// call from a signal handler: it only performs an atomic store.
pub fn request_halt() {
    HALT_REQUESTED.store(true, Ordering::SeqCst);
}

use tracing::{error, info, warn};

use crate::checkpoint::{ValidationOutcome, Validator};
use crate::config::{Config, DiagnosticKind};
use crate::countermeasures::{CountermeasureStep, PlatformMode};
use crate::diagnostics::{
    lock_or_recover, CoreReachability, Diagnostic, EscalationTier, InfoliOutputDivergence, ProcessExit,
};
use crate::error::DepmanError;
use crate::grid::CoreId;
use crate::handle::SupervisorHandle;
use crate::injector::{Injector, InjectorKind, InjectorSet};
use crate::metrics::Metrics;
use crate::monitors::pinger::UnreachableHandler;

/// Everything the event loop needs to run one simulation under supervision.
pub struct Supervisor {
    config: Config,
    cores: Mutex<Vec<CoreId>>,
    initial_cores: Mutex<Vec<CoreId>>,
    min_step: AtomicUsize,
    stopped: AtomicBool,
    child: Mutex<Option<Child>>,
    diagnostics: Mutex<Vec<Arc<dyn Diagnostic>>>,
    process_exit: Mutex<Option<Arc<ProcessExit>>>,
    sdc: Mutex<Option<Arc<InfoliOutputDivergence>>>,
    reachability: Mutex<Option<Arc<CoreReachability>>>,
    checkpoints: Mutex<Vec<u32>>,
    mttf_samples: Mutex<VecDeque<f64>>,
    mttr_samples: Mutex<Vec<f64>>,
    pub metrics: Metrics,
}

/// Push `sample` onto a bounded FIFO (evicting the oldest entry once past
/// `capacity`) and return the arithmetic mean over what remains (§3 "MTTF/MTTR buffers").
fn push_bounded_mean(buffer: &mut VecDeque<f64>, capacity: usize, sample: f64) -> f64 {
    buffer.push_back(sample);
    while buffer.len() > capacity {
        buffer.pop_front();
    }
    buffer.iter().sum::<f64>() / buffer.len() as f64
}

/// Push `sample` onto an unbounded list and return the arithmetic mean over
/// every sample recorded so far.
fn push_unbounded_mean(buffer: &mut Vec<f64>, sample: f64) -> f64 {
    buffer.push(sample);
    buffer.iter().sum::<f64>() / buffer.len() as f64
}

impl Supervisor {
    /// Build an inert supervisor: reads the hostfile, resolves the fixed
    /// core assignment, but spawns nothing. Call [`start`](Self::start) to
    /// actually launch the worker and run the escalation loop.
    pub fn new(config: Config) -> Result<Arc<Self>, DepmanError> {
        let cores = crate::config::read_hostfile(&config.hostfile, config.num_cores)?;
        let initial_cores = cores.clone();
        Ok(Arc::new(Supervisor {
            config,
            cores: Mutex::new(cores),
            initial_cores: Mutex::new(initial_cores),
            min_step: AtomicUsize::new(0),
            stopped: AtomicBool::new(true),
            child: Mutex::new(None),
            diagnostics: Mutex::new(Vec::new()),
            process_exit: Mutex::new(None),
            sdc: Mutex::new(None),
            reachability: Mutex::new(None),
            checkpoints: Mutex::new(Vec::new()),
            mttf_samples: Mutex::new(VecDeque::new()),
            mttr_samples: Mutex::new(Vec::new()),
            metrics: Metrics::new(),
        }))
    }

    /// Wire up the configured diagnostics, launch the worker, and run the
    /// escalation loop until the simulation completes or becomes
    /// unrecoverable.
    pub fn start(self: &Arc<Self>) -> Result<(), DepmanError> {
        let handle: Arc<dyn SupervisorHandle> = self.clone();
        let mode = if self.config.dev_mode {
            PlatformMode::Devel
        } else {
            PlatformMode::Hardware
        };

        let mut diagnostics: Vec<Arc<dyn Diagnostic>> = Vec::new();
        for kind in &self.config.diagnostics {
            match kind {
                DiagnosticKind::InfoliOutputDivergence => {
                    let sdc = InfoliOutputDivergence::new(handle.clone(), mode);
                    *lock_or_recover(&self.sdc) = Some(sdc.clone());
                    diagnostics.push(sdc);
                }
                DiagnosticKind::ProcessExit => {
                    let pe = ProcessExit::new(handle.clone(), mode);
                    *lock_or_recover(&self.process_exit) = Some(pe.clone());
                    diagnostics.push(pe);
                }
                DiagnosticKind::CoreReachability => {
                    let cr = CoreReachability::new(handle.clone(), mode, 4);
                    *lock_or_recover(&self.reachability) = Some(cr.clone());
                    diagnostics.push(cr);
                }
            }
        }
        *lock_or_recover(&self.diagnostics) = diagnostics;

        self.spawn_worker(&self.initial_executable(), &self.initial_trailing_argv());
        self.metrics.host_set_size.set(self.cores().len() as i64);

        self.run_loop()
    }

    fn initial_executable(&self) -> String {
        self.config.exec_argv.first().cloned().unwrap_or_default()
    }

    fn initial_trailing_argv(&self) -> Vec<String> {
        let mut argv: Vec<String> = self.config.exec_argv.iter().skip(1).cloned().collect();
        argv.push(self.config.grid_x.to_string());
        argv.push(self.config.grid_y.to_string());
        argv
    }

    /// Write the active hostfile and launch `executable` over the current
    /// core set via the configured `rccerun`-style runner, attaching the
    /// process-exit diagnostic to its stdout. Used both for the initial
    /// launch and for every relaunch a countermeasure performs.
    fn spawn_worker(&self, executable: &str, trailing: &[String]) {
        let cores = self.cores();
        if let Err(e) = fs::create_dir_all(&self.config.sim_dump_location) {
            warn!(error = %e, "failed to create the simulation dump directory");
        }

        let hostfile_path = self.config.sim_dump_location.join("hostfile.active");
        let contents: String = cores.iter().map(|c| format!("{:02}\n", c.0)).collect();
        if let Err(e) = fs::write(&hostfile_path, contents) {
            error!(path = %hostfile_path.display(), error = %e, "failed to write the active hostfile");
            return;
        }

        let mut cmd = Command::new(&self.config.rccerun_path);
        cmd.arg("-nue")
            .arg(cores.len().to_string())
            .arg("-f")
            .arg(&hostfile_path)
            .arg(executable)
            .args(trailing)
            .stdout(Stdio::piped());

        match cmd.spawn() {
            Ok(mut child) => {
                if let Some(stdout) = child.stdout.take() {
                    if let Some(pe) = lock_or_recover(&self.process_exit).as_ref() {
                        pe.attach(stdout);
                    }
                }
                info!(executable, cores = cores.len(), "worker launched");
                *lock_or_recover(&self.child) = Some(child);
                self.stopped.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                error!(executable, error = %e, "failed to launch the worker process");
            }
        }
    }

    fn build_injector_set(&self) -> Result<InjectorSet, DepmanError> {
        if !self.config.injection_enabled {
            return Ok(InjectorSet::new(Vec::new()));
        }
        let mode = if self.config.dev_mode {
            PlatformMode::Devel
        } else {
            PlatformMode::Hardware
        };
        let specs: [(InjectorKind, &str); 4] = [
            (InjectorKind::ProcessExit, "procexitjector.txt"),
            (InjectorKind::OutputCorruption, "infolijector.txt"),
            (InjectorKind::CoreFailure { mode }, "corefailjector.txt"),
            (InjectorKind::CoreShutdown, "coreshutjector.txt"),
        ];

        let mut injectors = Vec::new();
        for (kind, filename) in specs {
            let path = self.config.injectors_dir.join(filename);
            if !path.exists() {
                continue;
            }
            injectors.push(Injector::new(kind, path)?);
        }
        Ok(InjectorSet::new(injectors))
    }

    fn quiesce_diagnostics(&self) {
        for d in lock_or_recover(&self.diagnostics).iter() {
            d.wait();
        }
    }

    fn diagnostics_completed(&self) -> bool {
        lock_or_recover(&self.diagnostics).iter().all(|d| d.completed())
    }

    /// Non-blocking check for whether the worker process has exited on its
    /// own (§4.8's "wait for worker to exit"). Reaps the child once it has,
    /// so a later [`Supervisor::stop`] on an already-dead worker is a no-op.
    fn worker_exited(&self) -> bool {
        let mut guard = lock_or_recover(&self.child);
        match guard.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(_status)) => {
                    *guard = None;
                    true
                }
                Ok(None) => false,
                Err(_) => false,
            },
            None => true,
        }
    }

    /// Pick the escalation ladder of whichever failed diagnostic's first
    /// tier is the most expensive one (§4.5): the costlier problem gets
    /// addressed first rather than letting a cheap diagnostic's restart
    /// mask a core that actually needs rebooting.
    fn determine_escalation(&self, failed: &[Arc<dyn Diagnostic>]) -> VecDeque<EscalationTier> {
        fn tier_cost(tier: &EscalationTier) -> u32 {
            tier.iter().map(|s| s.cost()).max().unwrap_or(0)
        }
        failed
            .iter()
            .max_by_key(|d| d.countermeasure_procedure().first().map(tier_cost).unwrap_or(0))
            .map(|d| d.countermeasure_procedure().into_iter().collect())
            .unwrap_or_default()
    }

    /// The escalation loop (§4.8): alternate between waiting for progress
    /// and, once a diagnostic fails, walking its (or the costliest failed
    /// diagnostic's) escalation ladder one tier at a time until a
    /// countermeasure restores forward progress.
    fn run_loop(self: &Arc<Self>) -> Result<(), DepmanError> {
        let mut validator = Validator::new(
            self.config.cellcount,
            self.config.cellstate_size,
            self.config.sim_dump_location.clone(),
            self.config.safe_location.clone(),
        );
        let mut injector_set = self.build_injector_set()?;
        let mut current_procedure: VecDeque<EscalationTier> = VecDeque::new();
        let mut fail_started_at: Option<Instant> = None;
        let mut last_recovery_at = Instant::now();
        let mut progressed_since_escalation = true;

        loop {
            thread::sleep(self.config.file_poll_interval);

            if HALT_REQUESTED.load(Ordering::SeqCst) {
                info!("SIGINT received; stopping the worker and exiting");
                self.stop();
                self.quiesce_diagnostics();
                return Ok(());
            }

            if !injector_set.is_empty() {
                let handle: Arc<dyn SupervisorHandle> = self.clone();
                let mut rng = rand::thread_rng();
                injector_set.tick(&handle, &mut rng);
            }

            let failed = self.failed_diagnostics();

            if failed.is_empty() {
                match validator.try_new_checkpoint(&self.cores()) {
                    Ok(ValidationOutcome::NewCheckpoint(step)) => {
                        let len = {
                            let mut checkpoints = lock_or_recover(&self.checkpoints);
                            checkpoints.push(step);
                            checkpoints.len()
                        };
                        self.metrics.checkpoints_total.set(len as i64);
                        progressed_since_escalation = true;
                    }
                    Ok(ValidationOutcome::NoProgress) => {}
                    Err(e) => warn!(error = %e, "checkpoint validation failed"),
                }

                if self.worker_exited() && self.diagnostics_completed() {
                    info!("simulation completed");
                    self.stop();
                    self.quiesce_diagnostics();
                    return Ok(());
                }
                continue;
            }

            if fail_started_at.is_none() {
                let now = Instant::now();
                let sample = now.duration_since(last_recovery_at).as_secs_f64();
                let mean = push_bounded_mean(
                    &mut lock_or_recover(&self.mttf_samples),
                    self.config.moving_avg_n,
                    sample,
                );
                self.metrics.mttf_seconds.set(mean);
                fail_started_at = Some(now);
            }

            self.stop();
            self.quiesce_diagnostics();

            if current_procedure.is_empty() {
                if !progressed_since_escalation {
                    for d in &failed {
                        d.degrade();
                    }
                }
                if lock_or_recover(&self.checkpoints).is_empty() {
                    return Err(DepmanError::Unrecoverable);
                }
                current_procedure = self.determine_escalation(&failed);
                progressed_since_escalation = false;
            }

            if let Some(tier) = current_procedure.pop_front() {
                for step in &tier {
                    self.metrics.record_countermeasure(step.name());
                    if !step.perform() {
                        warn!(step = step.name(), "countermeasure step failed; escalating");
                        break;
                    }
                }
            }

            for d in &failed {
                d.reinit();
            }

            if let Some(start) = fail_started_at.take() {
                let mean = push_unbounded_mean(&mut lock_or_recover(&self.mttr_samples), start.elapsed().as_secs_f64());
                self.metrics.mttr_seconds.set(mean);
            }
            last_recovery_at = Instant::now();
            injector_set.reinit();
        }
    }
}

impl SupervisorHandle for Supervisor {
    fn cores(&self) -> Vec<CoreId> {
        lock_or_recover(&self.cores).clone()
    }

    fn initial_cores(&self) -> Vec<CoreId> {
        lock_or_recover(&self.initial_cores).clone()
    }

    fn set_initial_cores(&self, cores: Vec<CoreId>) {
        *lock_or_recover(&self.initial_cores) = cores;
    }

    fn change_cores(&self, new_cores: Vec<CoreId>) {
        *lock_or_recover(&self.cores) = new_cores;
        self.metrics.host_set_size.set(self.cores().len() as i64);
    }

    fn cellcount(&self) -> usize {
        self.config.cellcount
    }

    fn sim_dir(&self) -> std::path::PathBuf {
        self.config.sim_dump_location.clone()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(mut child) = lock_or_recover(&self.child).take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn min_step(&self) -> usize {
        self.min_step.load(Ordering::SeqCst)
    }

    fn set_min_step(&self, step: usize) {
        self.min_step.store(step, Ordering::SeqCst);
    }

    fn failed_diagnostics(&self) -> Vec<Arc<dyn Diagnostic>> {
        lock_or_recover(&self.diagnostics)
            .iter()
            .filter(|d| d.failed())
            .cloned()
            .collect()
    }

    fn checkpoints(&self) -> Vec<u32> {
        lock_or_recover(&self.checkpoints).clone()
    }

    fn safe_location(&self) -> std::path::PathBuf {
        self.config.safe_location.clone()
    }

    fn sim_dump_location(&self) -> std::path::PathBuf {
        self.config.sim_dump_location.clone()
    }

    fn num_cores(&self) -> usize {
        self.config.num_cores
    }

    fn rccerun(&self, argv: Vec<String>) {
        let restart_exec = self.config.restart_exec.clone();
        self.spawn_worker(&restart_exec, &argv);
    }

    fn restart_argv(&self) -> Vec<String> {
        let mut argv = vec![self.initial_executable()];
        argv.extend(self.initial_trailing_argv());
        argv
    }

    fn inject_stdout_failure(&self, line: &str) {
        if let Some(pe) = lock_or_recover(&self.process_exit).as_ref() {
            warn!(line, "fault injector forcing a process-exit failure");
            pe.fail();
        }
    }

    fn inject_output_bitflip(&self, core: CoreId) {
        if let Some(sdc) = lock_or_recover(&self.sdc).as_ref() {
            sdc.inject_sdc(core);
        }
    }

    fn inject_unreachable(&self, core: CoreId) {
        if let Some(cr) = lock_or_recover(&self.reachability).as_ref() {
            let mut set = std::collections::HashSet::new();
            set.insert(core.to_string());
            cr.handle_unreachables(&set);
        }
    }
}

//! Output-divergence diagnostic — the SDC detector. Follows every core's
//! voltage trace file and fails the run the moment a step can't be parsed or
//! a voltage drifts outside the physiologically plausible range.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{error, info};

use crate::countermeasures::{CoreReboot, PlatformMode, PlatformReinitialization, RestartSimulation};
use crate::diagnostics::{lock_or_recover, Diagnostic, EscalationTier};
use crate::grid::CoreId;
use crate::handle::SupervisorHandle;
use crate::monitors::follower::{FileFollower, LineProcessor};

/// Simulation step count a fully-completed Infoli run reaches.
const COMPLETION_STEP: usize = 120_000;

/// Voltage magnitude past which a sample is physiologically implausible and
/// treated as a silent data corruption.
const VOLTAGE_THRESHOLD: f64 = 100.0;

struct ReaderHandle {
    processor: Arc<InfoliLineProcessor>,
    follower: FileFollower,
}

pub struct InfoliOutputDivergence {
    manager: Arc<dyn SupervisorHandle>,
    mode: PlatformMode,
    failed: Mutex<bool>,
    min_step: AtomicUsize,
    readers: Mutex<Vec<ReaderHandle>>,
}

impl InfoliOutputDivergence {
    pub fn new(manager: Arc<dyn SupervisorHandle>, mode: PlatformMode) -> Arc<Self> {
        let this = Arc::new(InfoliOutputDivergence {
            manager,
            mode,
            failed: Mutex::new(false),
            min_step: AtomicUsize::new(0),
            readers: Mutex::new(Vec::new()),
        });
        this.spawn_readers();
        this
    }

    fn spawn_readers(self: &Arc<Self>) {
        let start_step = self.min_step.load(Ordering::SeqCst);
        let mut readers = Vec::new();
        for core in self.manager.cores() {
            let outfile = self
                .manager
                .sim_dir()
                .join(format!("InferiorOlive_Output{}.txt", core.0));
            let processor = Arc::new(InfoliLineProcessor::new(core, self.clone(), start_step));
            let sink: Arc<dyn LineProcessor> = processor.clone();
            let follower = FileFollower::start(outfile, sink);
            readers.push(ReaderHandle { processor, follower });
        }
        *lock_or_recover(&self.readers) = readers;
    }

    /// Arm a first-four-bits corruption injection on the next line the given
    /// core's reader processes.
    pub fn inject_sdc(&self, core: CoreId) {
        if let Some(reader) = lock_or_recover(&self.readers)
            .iter()
            .find(|r| r.processor.core == core)
        {
            reader.follower.inject_sdc();
        }
    }
}

impl Diagnostic for InfoliOutputDivergence {
    fn fail(&self) {
        let mut failed = lock_or_recover(&self.failed);
        if !*failed {
            error!("output divergence diagnostic failed");
            *failed = true;
        }
        if !self.manager.stopped() {
            self.manager.stop();
        }
    }

    fn failed(&self) -> bool {
        *lock_or_recover(&self.failed)
    }

    fn reinit(&self) {
        *lock_or_recover(&self.failed) = false;
        self.spawn_readers();
        thread::sleep(Duration::from_secs(2));
    }

    fn wait(&self) {
        let min_step = {
            let readers = lock_or_recover(&self.readers);
            readers
                .iter()
                .map(|r| r.processor.current_step())
                .min()
                .unwrap_or(0)
        };
        self.min_step.store(min_step, Ordering::SeqCst);

        if !self.manager.failed_diagnostics().is_empty() {
            self.manager.set_min_step(min_step);
            info!(min_step, "SDC detection will continue from this step");
            let mut readers = lock_or_recover(&self.readers);
            for reader in readers.iter_mut() {
                reader.follower.wait();
            }
            thread::sleep(Duration::from_secs(2));
        }
    }

    fn completed(&self) -> bool {
        lock_or_recover(&self.readers)
            .iter()
            .all(|r| r.processor.current_step() >= COMPLETION_STEP)
    }

    fn countermeasure_procedure(&self) -> Vec<EscalationTier> {
        let cores = self.manager.cores();
        vec![
            vec![Arc::new(RestartSimulation::new(self.manager.clone()))],
            vec![
                Arc::new(CoreReboot::new(cores.clone(), cores.clone(), self.mode)),
                Arc::new(RestartSimulation::new(self.manager.clone())),
            ],
            vec![
                Arc::new(PlatformReinitialization::new(cores, self.mode)),
                Arc::new(RestartSimulation::new(self.manager.clone())),
            ],
        ]
    }

    fn is_sdc(&self) -> bool {
        true
    }
}

/// Parses and validates one core's voltage trace, one line at a time.
pub struct InfoliLineProcessor {
    core: CoreId,
    expected_fields: usize,
    current_step: AtomicUsize,
    diagnostic: Arc<InfoliOutputDivergence>,
}

impl InfoliLineProcessor {
    fn new(core: CoreId, diagnostic: Arc<InfoliOutputDivergence>, start_step: usize) -> Self {
        let expected_fields = diagnostic.manager.cellcount() + 3;
        InfoliLineProcessor {
            core,
            expected_fields,
            current_step: AtomicUsize::new(start_step),
            diagnostic,
        }
    }

    fn current_step(&self) -> usize {
        self.current_step.load(Ordering::SeqCst)
    }
}

impl LineProcessor for InfoliLineProcessor {
    fn assert_line(&self, line: &str) -> bool {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != self.expected_fields {
            return false;
        }
        if fields[0].parse::<i64>().is_err() {
            return false;
        }
        fields[3..].iter().all(|f| f.parse::<f64>().is_ok())
    }

    fn process_line(&self, line: &str) {
        let fields: Vec<&str> = line.split_whitespace().collect();

        let step = match fields.first().and_then(|f| f.parse::<usize>().ok()) {
            Some(step) => step,
            None => {
                error!(core = self.core.0, "possible SDC: simstep could not be parsed as int");
                self.diagnostic.fail();
                return;
            }
        };

        if step <= self.current_step() {
            return; // already-seen steps from a previous chunk
        }
        self.current_step.store(step, Ordering::SeqCst);

        for raw_voltage in &fields[3..] {
            let voltage = match raw_voltage.parse::<f64>() {
                Ok(v) => v,
                Err(_) => {
                    error!(core = self.core.0, "possible SDC: voltage could not be parsed as float");
                    self.diagnostic.fail();
                    return;
                }
            };
            if voltage.abs() > VOLTAGE_THRESHOLD {
                error!(core = self.core.0, voltage, "voltage exceeded threshold");
                self.diagnostic.fail();
                return;
            }
        }
    }

    fn break_condition(&self, line: &str) -> bool {
        line.split_whitespace().next() == Some("#simSteps")
    }

    fn expected_length(&self) -> usize {
        self.expected_fields
    }

    fn sim_step(&self) -> usize {
        self.current_step()
    }

    fn fail(&self) {
        self.diagnostic.fail();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;

    struct StubManager {
        cores: Vec<CoreId>,
        cellcount: usize,
        sim_dir: PathBuf,
        stopped: AtomicBool,
        failed_list: Mutex<Vec<Arc<dyn Diagnostic>>>,
    }

    impl SupervisorHandle for StubManager {
        fn cores(&self) -> Vec<CoreId> {
            self.cores.clone()
        }
        fn initial_cores(&self) -> Vec<CoreId> {
            self.cores.clone()
        }
        fn set_initial_cores(&self, _cores: Vec<CoreId>) {}
        fn change_cores(&self, _new_cores: Vec<CoreId>) {}
        fn cellcount(&self) -> usize {
            self.cellcount
        }
        fn sim_dir(&self) -> PathBuf {
            self.sim_dir.clone()
        }
        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
        fn stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
        fn min_step(&self) -> usize {
            0
        }
        fn set_min_step(&self, _step: usize) {}
        fn failed_diagnostics(&self) -> Vec<Arc<dyn Diagnostic>> {
            self.failed_list.lock().unwrap().clone()
        }
        fn checkpoints(&self) -> Vec<u32> {
            Vec::new()
        }
        fn safe_location(&self) -> PathBuf {
            PathBuf::from("/tmp/safe")
        }
        fn sim_dump_location(&self) -> PathBuf {
            PathBuf::from("/tmp/dump")
        }
        fn num_cores(&self) -> usize {
            self.cores.len()
        }
        fn rccerun(&self, _argv: Vec<String>) {}
        fn restart_argv(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn line_processor(cellcount: usize) -> (tempfile::TempDir, Arc<StubManager>, Arc<InfoliOutputDivergence>) {
        let dir = tempfile::tempdir().unwrap();
        // pre-create the per-core output files so the follower can open them.
        std::fs::write(dir.path().join("InferiorOlive_Output0.txt"), "").unwrap();
        let manager = Arc::new(StubManager {
            cores: vec![CoreId::new(0)],
            cellcount,
            sim_dir: dir.path().to_path_buf(),
            stopped: AtomicBool::new(false),
            failed_list: Mutex::new(Vec::new()),
        });
        let diag = InfoliOutputDivergence::new(manager.clone() as Arc<dyn SupervisorHandle>, PlatformMode::Devel);
        (dir, manager, diag)
    }

    fn processor_for(diag: &Arc<InfoliOutputDivergence>) -> Arc<InfoliLineProcessor> {
        lock_or_recover(&diag.readers)[0].processor.clone()
    }

    #[test]
    fn assert_line_requires_exact_field_count() {
        let (_dir, _m, diag) = line_processor(2);
        let p = processor_for(&diag);
        assert_eq!(p.expected_length(), 5);
        assert!(p.assert_line("1 0 0 -10.0 20.0"));
        assert!(!p.assert_line("1 0 0 -10.0"));
    }

    #[test]
    fn process_line_flags_out_of_range_voltage() {
        let (_dir, _m, diag) = line_processor(1);
        let p = processor_for(&diag);
        p.process_line("1 0 0 150.0");
        assert!(diag.failed());
    }

    #[test]
    fn process_line_accepts_in_range_voltage_and_advances_step() {
        let (_dir, _m, diag) = line_processor(1);
        let p = processor_for(&diag);
        p.process_line("5 0 0 -70.0");
        assert!(!diag.failed());
        assert_eq!(p.current_step(), 5);
    }

    #[test]
    fn process_line_ignores_steps_not_past_the_current_one() {
        let (_dir, _m, diag) = line_processor(1);
        let p = processor_for(&diag);
        p.process_line("5 0 0 -70.0");
        p.process_line("3 0 0 999.0"); // stale chunk; must not be evaluated
        assert!(!diag.failed());
        assert_eq!(p.current_step(), 5);
    }

    #[test]
    fn break_condition_matches_the_simsteps_marker() {
        let (_dir, _m, diag) = line_processor(1);
        let p = processor_for(&diag);
        assert!(p.break_condition("#simSteps 120000"));
        assert!(!p.break_condition("5 0 0 -70.0"));
    }

    #[test]
    fn completed_is_false_until_every_reader_reaches_the_completion_step() {
        let (_dir, _m, diag) = line_processor(1);
        assert!(!diag.completed());
    }
}

//! Process-exit diagnostic — watches the worker's stdout for SCC `FAILURE`
//! messages and the error codes that follow them.

use std::process::ChildStdout;
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::countermeasures::{CoreReboot, PlatformMode, PlatformReinitialization, RestartSimulation};
use crate::diagnostics::{lock_or_recover, Diagnostic, EscalationTier};
use crate::handle::SupervisorHandle;
use crate::monitors::stdout::{LineSink, StdoutScanner};

/// Fails the run when the worker's stdout reports a non-benign `FAILURE`
/// line. Error code `255` is ignored (it's what a manually killed process
/// reports) and `Interrupted` lines are treated as benign shutdown noise.
pub struct ProcessExit {
    manager: Arc<dyn SupervisorHandle>,
    mode: PlatformMode,
    failed: Mutex<bool>,
    scanner: Mutex<Option<StdoutScanner>>,
}

impl ProcessExit {
    /// Build an unattached diagnostic. Call [`attach`](Self::attach) once the
    /// worker process and its stdout handle exist.
    pub fn new(manager: Arc<dyn SupervisorHandle>, mode: PlatformMode) -> Arc<Self> {
        Arc::new(ProcessExit {
            manager,
            mode,
            failed: Mutex::new(false),
            scanner: Mutex::new(None),
        })
    }

    /// Start scanning `stdout`, tearing down any previous scan thread first.
    pub fn attach(self: &Arc<Self>, stdout: ChildStdout) {
        let mut slot = lock_or_recover(&self.scanner);
        if let Some(mut old) = slot.take() {
            old.wait();
        }
        let sink: Arc<dyn LineSink> = self.clone();
        *slot = Some(StdoutScanner::start(stdout, sink));
    }
}

impl LineSink for ProcessExit {
    fn process_line(&self, line: &str) -> bool {
        if !line.contains("FAILURE") {
            return true;
        }

        let Some(core) = line.get(23..line.len().min(29)) else {
            return true;
        };

        if let Some(tail) = trailing_slice(line, 12, 1) {
            if tail == "Interrupted" {
                return true;
            }
        }

        let Some(code) = trailing_slice(line, 4, 1) else {
            return true;
        };
        let Ok(error_code) = code.trim().parse::<i32>() else {
            return true; // not an SCC-formatted message
        };

        if error_code != 255 {
            error!(core, error_code, "process exited with a failure code");
            self.fail();
            return false;
        }
        true
    }
}

/// Python's `line[-a:-b]` slicing, safely bounds-checked: the substring
/// starting `a` characters from the end and ending `b` characters from the
/// end (exclusive). Returns `None` if the line is too short.
fn trailing_slice(line: &str, from_end: usize, to_end: usize) -> Option<&str> {
    let len = line.len();
    if len < from_end || to_end >= from_end {
        return None;
    }
    line.get(len - from_end..len - to_end)
}

impl Diagnostic for ProcessExit {
    fn fail(&self) {
        let mut failed = lock_or_recover(&self.failed);
        if !*failed {
            error!("process exit diagnostic failed");
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
        // the supervisor re-attaches us to the relaunched worker's stdout
        // once it has a new child handle; nothing else to reset here.
    }

    fn wait(&self) {
        if let Some(scanner) = lock_or_recover(&self.scanner).as_mut() {
            scanner.wait();
        }
    }

    fn countermeasure_procedure(&self) -> Vec<EscalationTier> {
        let initial = self.manager.initial_cores();
        vec![
            vec![Arc::new(RestartSimulation::new(self.manager.clone()))],
            vec![
                Arc::new(CoreReboot::new(initial.clone(), initial.clone(), self.mode)),
                Arc::new(RestartSimulation::new(self.manager.clone())),
            ],
            vec![
                Arc::new(PlatformReinitialization::new(initial, self.mode)),
                Arc::new(RestartSimulation::new(self.manager.clone())),
            ],
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubManager {
        stopped: AtomicBool,
        stop_calls: AtomicUsize,
    }

    impl SupervisorHandle for StubManager {
        fn cores(&self) -> Vec<crate::grid::CoreId> {
            Vec::new()
        }
        fn initial_cores(&self) -> Vec<crate::grid::CoreId> {
            vec![crate::grid::CoreId::new(0), crate::grid::CoreId::new(1)]
        }
        fn set_initial_cores(&self, _cores: Vec<crate::grid::CoreId>) {}
        fn change_cores(&self, _new_cores: Vec<crate::grid::CoreId>) {}
        fn cellcount(&self) -> usize {
            1
        }
        fn sim_dir(&self) -> PathBuf {
            PathBuf::from("/tmp")
        }
        fn stop(&self) {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
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
            Vec::new()
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
            2
        }
        fn rccerun(&self, _argv: Vec<String>) {}
        fn restart_argv(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn process_exit() -> Arc<ProcessExit> {
        let manager = Arc::new(StubManager {
            stopped: AtomicBool::new(false),
            stop_calls: AtomicUsize::new(0),
        });
        ProcessExit::new(manager, PlatformMode::Devel)
    }

    #[test]
    fn non_failure_lines_pass_through() {
        let p = process_exit();
        assert!(p.process_line("step 10 core rck00 voltage -65.0"));
        assert!(!p.failed());
    }

    /// Builds a line with the core-id field at bytes [23, 29) and `suffix`
    /// as its final characters, the way the real tail-slicing checks expect.
    fn failure_line(suffix: &str) -> String {
        let mut line = "A".repeat(23);
        line.push_str("rck001"); // core field, line[23..29]
        line.push_str(" middle FAILURE middle ");
        line.push_str(suffix);
        line
    }

    #[test]
    fn benign_error_255_does_not_fail() {
        let p = process_exit();
        // last 4 chars "2551": trailing_slice(4,1) yields "255".
        let line = failure_line("2551");
        assert!(p.process_line(&line));
        assert!(!p.failed());
    }

    #[test]
    fn interrupted_messages_are_benign() {
        let p = process_exit();
        // last 12 chars "Interrupted!": trailing_slice(12,1) yields "Interrupted".
        let line = failure_line("Interrupted!");
        assert!(p.process_line(&line));
        assert!(!p.failed());
    }

    #[test]
    fn real_failure_fails_the_diagnostic_and_stops_the_run() {
        let p = process_exit();
        // last 4 chars "0171": trailing_slice(4,1) yields "017" (code 17).
        let line = failure_line("0171");
        assert!(!p.process_line(&line));
        assert!(p.failed());
    }

    #[test]
    fn fail_is_idempotent_about_logging_but_always_stops() {
        let p = process_exit();
        p.fail();
        p.fail();
        assert!(p.failed());
    }
}

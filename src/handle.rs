//! # Supervisor Handle — the seam between the event loop and everything else
//!
//! Diagnostics and countermeasures never hold the concrete supervisor type;
//! they hold an `Arc<dyn SupervisorHandle>`, the same inversion the
//! coordination client trait gives the search engines against whatever is
//! collecting their results.

use std::path::PathBuf;
use std::sync::Arc;

use crate::diagnostics::Diagnostic;
use crate::grid::CoreId;

/// Narrow view of the supervisor that diagnostics and countermeasures act
/// through.
pub trait SupervisorHandle: Send + Sync {
    /// Cores currently assigned to the simulation.
    fn cores(&self) -> Vec<CoreId>;

    /// Cores assigned at the very start of the run, before any degradation.
    fn initial_cores(&self) -> Vec<CoreId>;

    /// Permanently shrink the pool of cores considered available, after a
    /// diagnostic has scratched out ones it no longer trusts.
    fn set_initial_cores(&self, cores: Vec<CoreId>);

    /// Tear down the simulation on `cores()` and relaunch it on `new_cores`.
    fn change_cores(&self, new_cores: Vec<CoreId>);

    /// Per-core cell count the simulation was configured with.
    fn cellcount(&self) -> usize;

    /// Directory the simulation writes its per-core output files into.
    fn sim_dir(&self) -> PathBuf;

    /// Ask the supervisor to stop the running simulation.
    fn stop(&self);

    /// Whether the supervisor believes the simulation is currently stopped.
    fn stopped(&self) -> bool;

    /// Lowest simulation step every diagnostic has confirmed as valid —
    /// the point a restart should resume from.
    fn min_step(&self) -> usize;

    /// Record a new minimum validated step.
    fn set_min_step(&self, step: usize);

    /// Diagnostics currently in a failed state.
    fn failed_diagnostics(&self) -> Vec<Arc<dyn Diagnostic>>;

    /// Simulation steps for which a validated checkpoint exists, newest last.
    fn checkpoints(&self) -> Vec<u32>;

    /// Directory checkpoints are validated into before being trusted.
    fn safe_location(&self) -> PathBuf;

    /// Directory the running simulation reads/writes its live state from.
    fn sim_dump_location(&self) -> PathBuf;

    /// Total number of cores the simulation was launched with.
    fn num_cores(&self) -> usize;

    /// Relaunch the worker process with the given argv, replacing whatever
    /// is currently running.
    fn rccerun(&self, argv: Vec<String>);

    /// Executable used for a cold start, and the trailing parameter list the
    /// simulation was originally invoked with (argv[1:] of the exec line).
    fn restart_argv(&self) -> Vec<String>;

    /// Inject a synthetic stdout line (as if the worker itself had printed
    /// it) into the process-exit diagnostic. No-op where no such diagnostic
    /// is enabled.
    fn inject_stdout_failure(&self, _line: &str) {}

    /// Arm a one-shot first-four-bits corruption on `core`'s output file,
    /// the same path a real silent data corruption would take.
    fn inject_output_bitflip(&self, _core: CoreId) {}

    /// Mark `core` as permanently unreachable and let the reachability
    /// diagnostic fail as if a real ping sweep had found it dark.
    fn inject_unreachable(&self, _core: CoreId) {}
}

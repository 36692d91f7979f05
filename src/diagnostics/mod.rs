//! # Diagnostics — Fault Detection and Escalation Procedures
//!
//! A diagnostic owns one piece of evidence about the running simulation (its
//! stdout, its per-core voltage traces, or core reachability) and decides
//! when that evidence means the run has failed. When it does, the
//! supervisor walks the diagnostic's `countermeasure_procedure` — an
//! escalation ladder of increasingly invasive repair attempts — until one
//! succeeds or the ladder is exhausted.

pub mod output_divergence;
pub mod process_exit;
pub mod reachability;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::countermeasures::CountermeasureStep;

pub use output_divergence::InfoliOutputDivergence;
pub use process_exit::ProcessExit;
pub use reachability::CoreReachability;

/// Lock a mutex, recovering from poisoning — a diagnostic panicking mid-fail
/// shouldn't take the rest of the supervisor down with it.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A single escalation tier: every step in the inner `Vec` runs in order,
/// and the tier as a whole either restores the simulation or the supervisor
/// moves on to the next tier.
pub type EscalationTier = Vec<Arc<dyn CountermeasureStep>>;

/// Common behavior every fault detector implements.
pub trait Diagnostic: Send + Sync {
    /// Mark the diagnostic failed and ask the supervisor to stop the run.
    /// Idempotent — a diagnostic that has already failed does not log or
    /// stop twice.
    fn fail(&self);

    /// Whether [`fail`](Diagnostic::fail) has been called since the last
    /// [`reinit`](Diagnostic::reinit).
    fn failed(&self) -> bool;

    /// Clear the failed flag and reinitialize whatever monitor backs this
    /// diagnostic (e.g. reattach to a relaunched worker's stdout).
    fn reinit(&self);

    /// Permanently reduce what this diagnostic watches in response to a
    /// partial failure (e.g. drop unreachable cores from the active set).
    /// Most diagnostics have no degraded mode and leave this a no-op.
    fn degrade(&self) {}

    /// Whether the diagnostic considers the simulation finished. Most
    /// diagnostics have no notion of completion distinct from failure and
    /// report `true` unconditionally.
    fn completed(&self) -> bool {
        true
    }

    /// Whether this diagnostic detects silent data corruption rather than a
    /// clean process exit. The restart countermeasure treats an SDC failure
    /// differently: it must not resume from a checkpoint that might already
    /// hold the corrupted state, so it prefers the oldest retained one.
    fn is_sdc(&self) -> bool {
        false
    }

    /// Block until whatever this diagnostic watches has wound down —
    /// called during a supervised stop, before countermeasures run.
    fn wait(&self);

    /// Ordered escalation ladder to try when this diagnostic has failed.
    fn countermeasure_procedure(&self) -> Vec<EscalationTier>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubDiagnostic {
        failed: Mutex<bool>,
    }

    impl Diagnostic for StubDiagnostic {
        fn fail(&self) {
            *lock_or_recover(&self.failed) = true;
        }
        fn failed(&self) -> bool {
            *lock_or_recover(&self.failed)
        }
        fn reinit(&self) {
            *lock_or_recover(&self.failed) = false;
        }
        fn wait(&self) {}
        fn countermeasure_procedure(&self) -> Vec<EscalationTier> {
            Vec::new()
        }
    }

    #[test]
    fn default_degrade_and_completed_are_no_op_and_true() {
        let d = StubDiagnostic {
            failed: Mutex::new(false),
        };
        d.degrade();
        assert!(d.completed());
    }

    #[test]
    fn reinit_clears_failed_flag() {
        let d = StubDiagnostic {
            failed: Mutex::new(false),
        };
        d.fail();
        assert!(d.failed());
        d.reinit();
        assert!(!d.failed());
    }

    #[test]
    fn lock_or_recover_survives_a_poisoned_mutex() {
        use std::panic;
        let mutex = Arc::new(Mutex::new(0));
        let clone = mutex.clone();
        let _ = panic::catch_unwind(move || {
            let _guard = clone.lock().unwrap();
            panic!("simulated poison");
        });
        let guard = lock_or_recover(&mutex);
        assert_eq!(*guard, 0);
    }
}

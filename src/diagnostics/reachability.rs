//! Core-reachability diagnostic — pings the assigned cores on a cycle and
//! fails the run when any of them stop answering.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rand::thread_rng;
use tracing::{error, info, warn};

use crate::countermeasures::{CoreReboot, PlatformMode, PlatformReinitialization, RestartSimulation};
use crate::diagnostics::{lock_or_recover, Diagnostic, EscalationTier};
use crate::grid::{self, CoreId};
use crate::handle::SupervisorHandle;
use crate::monitors::pinger::{CorePinger, UnreachableHandler};

/// Divisors of the full 48-core grid that a degraded run can fall back to,
/// tried from largest to smallest.
const DEGRADE_DIVISORS: [usize; 8] = [24, 16, 12, 8, 6, 4, 3, 2];

pub struct CoreReachability {
    manager: Arc<dyn SupervisorHandle>,
    mode: PlatformMode,
    num_threads: usize,
    failed: Mutex<bool>,
    unreachable: Mutex<Vec<CoreId>>,
    pinger: Mutex<Option<CorePinger>>,
}

impl CoreReachability {
    pub fn new(manager: Arc<dyn SupervisorHandle>, mode: PlatformMode, num_threads: usize) -> Arc<Self> {
        let this = Arc::new(CoreReachability {
            manager,
            mode,
            num_threads,
            failed: Mutex::new(false),
            unreachable: Mutex::new(Vec::new()),
            pinger: Mutex::new(None),
        });
        this.spawn_pinger();
        this
    }

    fn spawn_pinger(self: &Arc<Self>) {
        let targets: Vec<String> = self.manager.cores().iter().map(|c| c.to_string()).collect();
        let handler: Arc<dyn UnreachableHandler> = self.clone();
        let pinger = CorePinger::start(self.num_threads, targets, handler);
        *lock_or_recover(&self.pinger) = Some(pinger);
    }
}

impl UnreachableHandler for CoreReachability {
    fn handle_unreachables(&self, unreachable: &HashSet<String>) -> bool {
        let active_cores = self.manager.cores();
        let unreachable_cores: Vec<CoreId> = unreachable.iter().filter_map(|s| CoreId::parse(s)).collect();
        *lock_or_recover(&self.unreachable) = unreachable_cores.clone();

        let still_matters = unreachable_cores.iter().any(|c| active_cores.contains(c));
        if still_matters {
            error!(count = unreachable_cores.len(), "cores are not responding");
            self.fail();
            false
        } else {
            true
        }
    }
}

impl Diagnostic for CoreReachability {
    fn fail(&self) {
        let mut failed = lock_or_recover(&self.failed);
        if !*failed {
            error!("core reachability diagnostic failed");
            *failed = true;
        }
        if !self.manager.stopped() {
            // Temporarily drop the unreachable cores so the stop sequence
            // doesn't itself hang waiting on them, then restore the full
            // set for whatever countermeasure runs next.
            let prev_cores = self.manager.cores();
            let unreachable = lock_or_recover(&self.unreachable).clone();
            let reduced: Vec<CoreId> = prev_cores
                .iter()
                .copied()
                .filter(|c| !unreachable.contains(c))
                .collect();
            self.manager.change_cores(reduced);
            self.manager.stop();
            self.manager.change_cores(prev_cores);
        }
    }

    fn failed(&self) -> bool {
        *lock_or_recover(&self.failed)
    }

    fn reinit(&self) {
        *lock_or_recover(&self.failed) = false;
        lock_or_recover(&self.unreachable).clear();
        let targets: Vec<String> = self.manager.cores().iter().map(|c| c.to_string()).collect();
        if let Some(pinger) = lock_or_recover(&self.pinger).as_ref() {
            pinger.switch_cores(targets);
        }
    }

    fn degrade(&self) {
        let unreachable = lock_or_recover(&self.unreachable).clone();
        let mut remaining = self.manager.initial_cores();
        remaining.retain(|c| !unreachable.contains(c));

        let mut new_task_count = 1usize;
        for &divisor in DEGRADE_DIVISORS.iter() {
            if remaining.len() >= divisor {
                new_task_count = divisor;
                break;
            }
        }

        let mut rng = thread_rng();
        match grid::allocate(new_task_count, &remaining, &mut rng) {
            Ok(placed) => {
                self.manager.set_initial_cores(remaining);
                self.manager.change_cores(placed);
                info!(new_task_count, "reduced core count after unreachable cores were scratched");
            }
            Err(e) => warn!(error = %e, "could not reallocate the reduced core set"),
        }
    }

    fn wait(&self) {
        if let Some(pinger) = lock_or_recover(&self.pinger).as_ref() {
            pinger.hold();
        }
    }

    fn countermeasure_procedure(&self) -> Vec<EscalationTier> {
        let unreachable = lock_or_recover(&self.unreachable).clone();
        let initial = self.manager.initial_cores();
        let cores = self.manager.cores();
        vec![
            vec![
                Arc::new(CoreReboot::new(unreachable, initial, self.mode)),
                Arc::new(RestartSimulation::new(self.manager.clone())),
            ],
            vec![
                Arc::new(PlatformReinitialization::new(cores, self.mode)),
                Arc::new(RestartSimulation::new(self.manager.clone())),
            ],
        ]
    }
}

impl Drop for CoreReachability {
    fn drop(&mut self) {
        if let Some(pinger) = lock_or_recover(&self.pinger).take() {
            pinger.stop();
        }
    }
}

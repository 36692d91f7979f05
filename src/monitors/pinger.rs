//! Reachability pinger — sweeps a list of core IPs on a fixed cadence using a
//! small worker pool, and reports the set that failed to respond.

use std::collections::HashSet;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Delay between consecutive sweeps once the queue drains.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Implemented by the diagnostic that owns a pinger, to decide what happens
/// once a sweep's unreachable set is known — e.g. trigger a grid reshuffle,
/// or simply record the finding and keep going.
pub trait UnreachableHandler: Send + Sync {
    /// Returns `false` to pause further sweeps (mirrors `hold_threads`).
    fn handle_unreachables(&self, unreachable: &HashSet<String>) -> bool;
}

enum Job {
    Ping(String),
    Stop,
}

/// Controller + worker-pool pinger. `num_threads` pingers pull targets off a
/// shared queue; the controller thread drives one full sweep per cycle and
/// unions transient misses with any targets that have stayed unreachable
/// across sweeps.
pub struct CorePinger {
    hold: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    targets: Arc<Mutex<Vec<String>>>,
    controller: Option<JoinHandle<()>>,
    job_tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl CorePinger {
    /// Start `num_threads` worker threads and a controller thread sweeping
    /// `targets` (hostnames or IPs) at [`SWEEP_INTERVAL`].
    pub fn start(num_threads: usize, targets: Vec<String>, handler: Arc<dyn UnreachableHandler>) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, result_rx) = mpsc::channel::<Option<String>>();

        let workers: Vec<JoinHandle<()>> = (0..num_threads.max(1))
            .map(|_| spawn_worker(job_rx.clone(), result_tx.clone()))
            .collect();

        let hold = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let targets = Arc::new(Mutex::new(targets));

        let controller = {
            let hold = hold.clone();
            let stop = stop.clone();
            let targets = targets.clone();
            let job_tx = job_tx.clone();
            thread::spawn(move || {
                let mut perm_unreachable: HashSet<String> = HashSet::new();
                loop {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if hold.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(100));
                        continue;
                    }

                    let batch = targets.lock().unwrap().clone();
                    for ip in &batch {
                        let _ = job_tx.send(Job::Ping(ip.clone()));
                    }
                    let mut unreachable = HashSet::new();
                    for _ in 0..batch.len() {
                        if let Ok(Some(ip)) = result_rx.recv() {
                            unreachable.insert(ip);
                        }
                    }
                    for perm in &perm_unreachable {
                        unreachable.insert(perm.clone());
                    }
                    perm_unreachable = unreachable.clone();

                    if !hold.load(Ordering::SeqCst) && !handler.handle_unreachables(&unreachable) {
                        hold.store(true, Ordering::SeqCst);
                    }

                    thread::sleep(SWEEP_INTERVAL);
                }
            })
        };

        CorePinger {
            hold,
            stop,
            targets,
            controller: Some(controller),
            job_tx,
            workers,
        }
    }

    /// Pause sweeping (the current sweep, if any, still completes).
    pub fn hold(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    /// Replace the list of pinged targets and resume sweeping from scratch.
    pub fn switch_cores(&self, targets: Vec<String>) {
        *self.targets.lock().unwrap() = targets;
        self.hold.store(false, Ordering::SeqCst);
    }

    /// Stop the controller and all worker threads.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(c) = self.controller.take() {
            let _ = c.join();
        }
        for _ in 0..self.workers.len() {
            let _ = self.job_tx.send(Job::Stop);
        }
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

fn spawn_worker(job_rx: Arc<Mutex<Receiver<Job>>>, result_tx: Sender<Option<String>>) -> JoinHandle<()> {
    thread::spawn(move || loop {
        let job = job_rx.lock().unwrap().recv();
        match job {
            Ok(Job::Ping(ip)) => {
                let reachable = ping_once(&ip) || ping_once(&ip);
                let _ = result_tx.send(if reachable { None } else { Some(ip) });
            }
            Ok(Job::Stop) | Err(_) => break,
        }
    })
}

/// Single ICMP probe via the system `ping` binary. One packet, three second
/// timeout; a missing host or a firewalled one both read as unreachable.
fn ping_once(ip: &str) -> bool {
    Command::new("ping")
        .args(["-c", "1", "-W", "3", ip])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

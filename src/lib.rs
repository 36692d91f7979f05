//! # depman — Dependability Manager for Fault-Tolerant Grid Simulation
//!
//! Supervises a simulation worker process running across a fixed grid of
//! cores, watching for process exits, silent data corruption in its output,
//! and core unreachability. When a diagnostic fails, the supervisor walks an
//! escalation ladder of countermeasures — restart from checkpoint, reboot the
//! affected cores, reinitialize the platform — until forward progress
//! resumes or the run is declared unrecoverable.
//!
//! ## Module organization
//!
//! - [`grid`] — core addressing and the thermal-dispersion allocation heuristic
//! - [`config`] — CLI grammar, `depman.toml` overlay, the layered config record
//! - [`error`] — the typed control-plane error taxonomy
//! - [`handle`] — [`handle::SupervisorHandle`], the narrow seam every other module calls back through
//! - [`checkpoint`] — DUE checkpoint parsing and the cross-core globalmax agreement
//! - [`countermeasures`] — restart / core reboot / platform reinitialization steps
//! - [`diagnostics`] — process-exit, output-divergence, and core-reachability fault detectors
//! - [`monitors`] — the polling primitives diagnostics are built on: file following, stdout scanning, pinging
//! - [`injector`] — optional stochastic fault injection for testing the escalation ladder itself
//! - [`metrics`] — Prometheus exposition of the supervisor's operational gauges
//! - [`supervisor`] — ties all of the above together into the escalation event loop

pub mod checkpoint;
pub mod config;
pub mod countermeasures;
pub mod diagnostics;
pub mod error;
pub mod grid;
pub mod handle;
pub mod injector;
pub mod metrics;
pub mod monitors;
pub mod supervisor;

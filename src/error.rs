//! # Error Taxonomy
//!
//! Typed error kinds for the supervisor's control plane. Most call sites
//! outside this module still return `anyhow::Result` for ad hoc context, but
//! the kinds below are the ones the event loop and exit-code mapping in
//! [`crate::main`] actually match on.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for the supervisor's typed control-plane results.
#[derive(Debug, Error)]
pub enum DepmanError {
    /// Missing or malformed CLI flags. Fatal at startup (exit code 1).
    #[error("argument error: {0}")]
    Argument(String),

    /// A required external tool could not be resolved in `PATH`. Fatal (exit code 1).
    #[error("environment error: `{tool}` not found in PATH")]
    Environment { tool: String },

    /// A file open/read glitch that is worth retrying with bounded backoff.
    #[error("transient I/O error on {path}: {source}")]
    IoTransient {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A checkpoint file was shorter than its declared layout required.
    #[error("checkpoint file for core {core} is too short (expected at least {expected} bytes, got {got})")]
    CheckpointShort {
        core: u8,
        expected: usize,
        got: usize,
    },

    /// A checkpoint file's header failed the `N1 * N2 == n * cellcount` invariant.
    #[error("checkpoint file for core {core} has an invalid header: {detail}")]
    CheckpointBadHeader { core: u8, detail: String },

    /// A core's checkpoint does not contain the agreed-upon `globalmax` step.
    #[error("checkpoint file for core {core} does not contain simulation step {step}")]
    CheckpointMissingStep { core: u8, step: u32 },

    /// A countermeasure step failed; the escalation loop moves to the next procedure.
    #[error("countermeasure step `{step}` failed: {reason}")]
    CountermeasureStepFailed { step: &'static str, reason: String },

    /// No checkpoint has ever been produced and the escalation chain is exhausted.
    #[error("simulation is unrecoverable: no valid checkpoint was ever created and all countermeasures are exhausted")]
    Unrecoverable,

    /// An injector's configured MTTF is zero; injection halts but the run continues.
    #[error("zero MTTF specified in injector schedule `{schedule}`; injection halted")]
    ZeroMttf { schedule: PathBuf },
}

impl DepmanError {
    /// Process exit code this error kind should map to at the CLI boundary.
    /// Returns `None` for kinds that never reach `main` (they are handled
    /// internally by the event loop, e.g. `CheckpointShort`).
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            DepmanError::Argument(_) => Some(1),
            DepmanError::Environment { .. } => Some(1),
            DepmanError::Unrecoverable => Some(2),
            _ => None,
        }
    }
}

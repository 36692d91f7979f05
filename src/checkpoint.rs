//! # Checkpoint Validator — the DUE-checkpoint rule
//!
//! Walks each active core's binary checkpoint file, agrees on the highest
//! simulation step every core has durably persisted (the *globalmax*), and
//! promotes that step into the validated safe store. This is the only place
//! that parses the worker's on-disk checkpoint format; nothing else in the
//! supervisor reaches into `ckptFile<i>.bin` directly.
//!
//! File layout (little-endian):
//! `[N1: i32][N2: i32][step_a: i32][cellcount * cellstate_size bytes][step_b: i32]`
//! with the invariant `N1 * N2 == n * cellcount`, `n` being the number of
//! active cores.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::DepmanError;
use crate::grid::CoreId;

/// Outcome of one validation pass over the live checkpoint directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// `globalmax` advanced past the previous one; a new safe checkpoint was written.
    NewCheckpoint(u32),
    /// No core had made progress past the previous `globalmax`.
    NoProgress,
}

/// Validates and promotes checkpoints for a fixed cell layout.
pub struct Validator {
    cellcount: usize,
    cellstate_size: usize,
    sim_dump_location: PathBuf,
    safe_location: PathBuf,
    previous_globalmax: u32,
}

/// `(step_a, step_b)` read from one core's checkpoint header and trailer.
#[derive(Debug, Clone, Copy)]
struct CoreSteps {
    step_a: u32,
    step_b: u32,
}

impl CoreSteps {
    fn localmax(&self) -> u32 {
        self.step_a.max(self.step_b)
    }

    fn contains(&self, step: u32) -> bool {
        self.step_a == step || self.step_b == step
    }
}

impl Validator {
    pub fn new(
        cellcount: usize,
        cellstate_size: usize,
        sim_dump_location: impl Into<PathBuf>,
        safe_location: impl Into<PathBuf>,
    ) -> Self {
        Validator {
            cellcount,
            cellstate_size,
            sim_dump_location: sim_dump_location.into(),
            safe_location: safe_location.into(),
            previous_globalmax: 0,
        }
    }

    pub fn previous_globalmax(&self) -> u32 {
        self.previous_globalmax
    }

    /// Read every active core's checkpoint file, agree on `globalmax`, and
    /// — if it advanced — copy the live files into a new safe-store
    /// directory named after it. Returns `Ok(NoProgress)` for any transient
    /// parse failure (§7: checkpoint errors drive escalation, they are
    /// never fatal on their own); the `Err` variants exist for callers that
    /// want to distinguish the specific cause (tests, logging).
    pub fn try_new_checkpoint(&mut self, cores: &[CoreId]) -> Result<ValidationOutcome, DepmanError> {
        let n = cores.len();
        let mut per_core = Vec::with_capacity(n);

        for core in cores {
            let path = self.sim_dump_location.join(format!("ckptFile{}.bin", core.0));
            let steps = self.read_core_checkpoint(core.0, &path, n)?;
            per_core.push((core, steps));
        }

        let globalmax = per_core.iter().map(|(_, s)| s.localmax()).min().unwrap_or(0);

        if globalmax <= self.previous_globalmax {
            return Ok(ValidationOutcome::NoProgress);
        }

        for (core, steps) in &per_core {
            if !steps.contains(globalmax) {
                return Err(DepmanError::CheckpointMissingStep {
                    core: core.0,
                    step: globalmax,
                });
            }
        }

        self.promote(cores, globalmax)?;
        self.previous_globalmax = globalmax;
        info!(step = globalmax, "new checkpoint validated");
        Ok(ValidationOutcome::NewCheckpoint(globalmax))
    }

    fn read_core_checkpoint(&self, core: u8, path: &Path, n: usize) -> Result<CoreSteps, DepmanError> {
        let mut file = File::open(path).map_err(|source| DepmanError::IoTransient {
            path: path.to_path_buf(),
            source,
        })?;

        let mut header = [0u8; 12];
        file.read_exact(&mut header).map_err(|_| DepmanError::CheckpointShort {
            core,
            expected: 12,
            got: fs::metadata(path).map(|m| m.len() as usize).unwrap_or(0),
        })?;
        let n1 = i32::from_le_bytes(header[0..4].try_into().unwrap());
        let n2 = i32::from_le_bytes(header[4..8].try_into().unwrap());
        let step_a = i32::from_le_bytes(header[8..12].try_into().unwrap());

        let expected = n as i64 * self.cellcount as i64;
        if n1 as i64 * n2 as i64 != expected {
            return Err(DepmanError::CheckpointBadHeader {
                core,
                detail: format!("N1*N2 = {} but n*cellcount = {expected}", n1 as i64 * n2 as i64),
            });
        }

        let body_len = self.cellcount * self.cellstate_size;
        let mut body = vec![0u8; body_len];
        file.read_exact(&mut body).map_err(|_| DepmanError::CheckpointShort {
            core,
            expected: 12 + body_len + 4,
            got: fs::metadata(path).map(|m| m.len() as usize).unwrap_or(0),
        })?;

        let mut trailer = [0u8; 4];
        file.read_exact(&mut trailer).map_err(|_| DepmanError::CheckpointShort {
            core,
            expected: 12 + body_len + 4,
            got: fs::metadata(path).map(|m| m.len() as usize).unwrap_or(0),
        })?;
        let step_b = i32::from_le_bytes(trailer);

        Ok(CoreSteps {
            step_a: step_a.max(0) as u32,
            step_b: step_b.max(0) as u32,
        })
    }

    fn promote(&self, cores: &[CoreId], globalmax: u32) -> Result<(), DepmanError> {
        let dest = self.safe_location.join(globalmax.to_string());
        fs::create_dir_all(&dest).map_err(|source| DepmanError::IoTransient {
            path: dest.clone(),
            source,
        })?;
        for core in cores {
            for name in [
                format!("ckptFile{}.bin", core.0),
                format!("InferiorOlive_Output{}.txt", core.0),
            ] {
                let src = self.sim_dump_location.join(&name);
                let dst = dest.join(&name);
                if let Err(source) = fs::copy(&src, &dst) {
                    warn!(path = %src.display(), error = %source, "failed to copy checkpoint artifact into safe store");
                }
            }
        }
        Ok(())
    }
}

//! # Core Grid Allocator — Thermal-Aware Placement
//!
//! Places a requested number of worker cores on the 8x6 SCC tile grid so that
//! active cores are spread as far apart as possible, maximizing the thermal
//! dispersion between them. Generalizes the original allocator's tie-break to
//! a seedable RNG so placement is reproducible in tests.

use rand::seq::SliceRandom;
use rand::RngCore;
use std::collections::HashSet;
use std::fmt;

/// Grid dimensions. Two logical cores share each physical tile, hence 8 rows
/// by 6 columns holding 48 cores in total.
pub const ROWS: usize = 8;
pub const COLS: usize = 6;
pub const TOTAL_CORES: usize = ROWS * COLS;

/// A two-digit SCC core identifier in `[0, 48)`, rendered as `rckNN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoreId(pub u8);

impl CoreId {
    pub fn new(index: u8) -> Self {
        debug_assert!((index as usize) < TOTAL_CORES, "core index out of range");
        CoreId(index)
    }

    /// `(row, col)` coordinates of this core on the 8x6 grid.
    pub fn coords(self) -> (usize, usize) {
        coords_from_index(self.0 as usize)
    }

    /// Parse a core identifier from its bare two-digit number (as stored in a
    /// hostfile line) or from an `rckNN` name.
    pub fn parse(s: &str) -> Option<Self> {
        let digits = s.strip_prefix("rck").unwrap_or(s);
        let n: u8 = digits.trim().parse().ok()?;
        if (n as usize) < TOTAL_CORES {
            Some(CoreId(n))
        } else {
            None
        }
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rck{:02}", self.0)
    }
}

/// `index(r,c) = 2*c + (r - r%2)*6 + r%2`, derived from the grid's fixed 2-col-per-tile layout.
pub fn index_from_coords(row: usize, col: usize) -> usize {
    let base_row = row - (row % 2);
    2 * col + base_row * COLS + (row % 2)
}

/// Inverse of [`index_from_coords`].
pub fn coords_from_index(index: usize) -> (usize, usize) {
    let tile = index / 2;
    let row = (tile / COLS) * 2 + index % 2;
    let col = tile % COLS;
    (row, col)
}

/// Errors the allocator can return.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("requested {requested} cores but only {available} are available")]
    InsufficientCores { requested: usize, available: usize },
}

/// Manhattan distance between two grid positions.
fn manhattan(a: (usize, usize), b: (usize, usize)) -> i64 {
    (a.0 as i64 - b.0 as i64).abs() + (a.1 as i64 - b.1 as i64).abs()
}

/// Distance of `(row, col)` to the nearest edge of the grid — edges radiate
/// heat best, so placements close to an edge are preferred among ties.
fn distance_to_edge(row: usize, col: usize) -> usize {
    [row, col, ROWS - 1 - row, COLS - 1 - col]
        .into_iter()
        .min()
        .unwrap()
}

const FORBIDDEN: f64 = -1.0;
const PLACED: f64 = -2.0;
const UNPLACED_SENTINEL: f64 = 1000.0;

/// Place `k` cores among `available`, maximizing pairwise thermal dispersion.
/// `rng` drives the tie-break among equally-far, equally-edge-close
/// candidates; pass a seeded `StdRng` for reproducible tests.
pub fn allocate(
    k: usize,
    available: &[CoreId],
    rng: &mut dyn RngCore,
) -> Result<Vec<CoreId>, AllocatorError> {
    if k > available.len() {
        return Err(AllocatorError::InsufficientCores {
            requested: k,
            available: available.len(),
        });
    }
    if k == 0 {
        return Ok(Vec::new());
    }

    let available_set: HashSet<(usize, usize)> = available.iter().map(|c| c.coords()).collect();

    let mut matrix = [[UNPLACED_SENTINEL; COLS]; ROWS];
    for row in 0..ROWS {
        for col in 0..COLS {
            if !available_set.contains(&(row, col)) {
                matrix[row][col] = FORBIDDEN;
            }
        }
    }

    let mut seed = seed_position(&matrix);

    let mut placed: Vec<(usize, usize)> = Vec::with_capacity(k);
    for _ in 0..k {
        matrix[seed.0][seed.1] = PLACED;
        placed.push(seed);

        for row in 0..ROWS {
            for col in 0..COLS {
                if matrix[row][col] > 0.0 {
                    let r = manhattan(seed, (row, col)) as f64;
                    if r < matrix[row][col] {
                        matrix[row][col] = r;
                    } else if r - 1.0 < matrix[row][col] && matrix[row][col] <= r {
                        matrix[row][col] -= 0.01;
                    }
                }
            }
        }

        if placed.len() == k {
            break;
        }

        let overall_max = matrix
            .iter()
            .flatten()
            .cloned()
            .fold(f64::MIN, f64::max);

        let max_set: Vec<(usize, usize)> = (0..ROWS)
            .flat_map(|row| (0..COLS).map(move |col| (row, col)))
            .filter(|&(row, col)| matrix[row][col] == overall_max)
            .collect();

        let min_edge_distance = max_set
            .iter()
            .map(|&(row, col)| distance_to_edge(row, col))
            .min()
            .unwrap();

        let edge_most: Vec<(usize, usize)> = max_set
            .into_iter()
            .filter(|&(row, col)| distance_to_edge(row, col) == min_edge_distance)
            .collect();

        seed = *edge_most
            .choose(rng)
            .expect("edge_most is nonempty: max_set always contains at least the seed itself");
    }

    Ok(placed
        .into_iter()
        .map(|(row, col)| CoreId(index_from_coords(row, col) as u8))
        .collect())
}

/// Seed position for placement: prefer an available corner, else the first
/// available position in row-major order.
fn seed_position(matrix: &[[f64; COLS]; ROWS]) -> (usize, usize) {
    const CORNERS: [(usize, usize); 4] = [(0, 0), (0, COLS - 1), (ROWS - 1, 0), (ROWS - 1, COLS - 1)];
    for &(row, col) in &CORNERS {
        if matrix[row][col] != FORBIDDEN {
            return (row, col);
        }
    }
    for row in 0..ROWS {
        for col in 0..COLS {
            if matrix[row][col] != FORBIDDEN {
                return (row, col);
            }
        }
    }
    unreachable!("caller already checked k <= available.len() > 0");
}

/// All 48 core identifiers on the grid, in index order.
pub fn all_cores() -> Vec<CoreId> {
    (0..TOTAL_CORES as u8).map(CoreId).collect()
}

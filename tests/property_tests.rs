//! Property-based tests for the core grid allocator.
//!
//! `depman::grid::allocate` is a pure function over a small, fully enumerable
//! state space (48 cores), which makes it a good fit for `proptest`: rather
//! than hand-picking a handful of core counts, we throw arbitrary `k` and
//! arbitrary available subsets at it and check the invariants that must hold
//! no matter which cores the thermal-dispersion heuristic happens to pick.

use std::collections::HashSet;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use depman::grid::{self, CoreId, TOTAL_CORES};

fn arbitrary_available() -> impl Strategy<Value = Vec<CoreId>> {
    proptest::collection::hash_set(0u8..TOTAL_CORES as u8, 1..=TOTAL_CORES)
        .prop_map(|set| set.into_iter().map(CoreId::new).collect())
}

proptest! {
    /// Any successful placement is a subset of `available`, has exactly `k`
    /// entries, and never repeats a core.
    #[test]
    fn allocate_never_invents_or_duplicates_cores(
        available in arbitrary_available(),
        k_raw in 0usize..TOTAL_CORES,
        seed in any::<u64>(),
    ) {
        let k = k_raw.min(available.len());
        let mut rng = StdRng::seed_from_u64(seed);
        let placed = grid::allocate(k, &available, &mut rng).unwrap();

        prop_assert_eq!(placed.len(), k);
        let unique: HashSet<_> = placed.iter().collect();
        prop_assert_eq!(unique.len(), k);
        for core in &placed {
            prop_assert!(available.contains(core));
        }
    }

    /// Requesting more cores than are available is always rejected, never
    /// silently truncated.
    #[test]
    fn allocate_rejects_oversubscription(
        available in arbitrary_available(),
        extra in 1usize..8,
        seed in any::<u64>(),
    ) {
        let k = available.len() + extra;
        let mut rng = StdRng::seed_from_u64(seed);
        let err = grid::allocate(k, &available, &mut rng).unwrap_err();
        prop_assert_eq!(
            err,
            grid::AllocatorError::InsufficientCores {
                requested: k,
                available: available.len(),
            }
        );
    }

    /// A fixed seed is fully deterministic regardless of how many times the
    /// same request is replayed.
    #[test]
    fn allocate_is_reproducible_for_a_fixed_seed(
        available in arbitrary_available(),
        k_raw in 0usize..TOTAL_CORES,
        seed in any::<u64>(),
    ) {
        let k = k_raw.min(available.len());
        let mut rng_a = StdRng::seed_from_u64(seed);
        let mut rng_b = StdRng::seed_from_u64(seed);
        let a = grid::allocate(k, &available, &mut rng_a).unwrap();
        let b = grid::allocate(k, &available, &mut rng_b).unwrap();
        prop_assert_eq!(a, b);
    }
}

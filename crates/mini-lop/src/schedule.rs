//! Seed scheduling: favoured marking, cycle-fair selection, and the power
//! schedule that decides how many children a seed gets per visit.

use std::collections::HashSet;

use libafl_bolts::rands::{Rand, StdRand};
use tracing::debug;

use crate::corpus::{Seed, SeedStore};

/// Probability of picking from the favoured subset when one is available.
const FAVOURED_BIAS: f64 = 0.9;

/// Bounds for the per-visit mutation budget.
const MIN_ENERGY: u32 = 1;
const MAX_ENERGY: u32 = 1000;

#[derive(Debug, Default)]
pub struct Scheduler {
    used_in_cycle: HashSet<usize>,
    cycle: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed passes over the queue so far.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Recomputes the favoured marking from scratch: for every covered edge,
    /// the covering seed with the smallest `size * exec_time` wins, and any
    /// seed that wins at least one edge is favoured.
    pub fn refresh_favoured(&self, store: &mut SeedStore) {
        let mut winners = HashSet::new();
        for (_, candidates) in store.edge_entries() {
            let mut best: Option<usize> = None;
            for &id in candidates {
                match best {
                    None => best = Some(id),
                    Some(current) => {
                        if store.get(id).valuation() < store.get(current).valuation() {
                            best = Some(id);
                        }
                    }
                }
            }
            if let Some(id) = best {
                winners.insert(id);
            }
        }
        store.set_favoured(&winners);
        debug!(favoured = winners.len(), queue = store.len(), "favoured seeds refreshed");
    }

    /// Picks the next seed to fuzz. Within a cycle every seed is selected at
    /// most once; when the queue is exhausted a new cycle begins.
    pub fn select_next(&mut self, store: &SeedStore, rand: &mut StdRand) -> usize {
        debug_assert!(!store.is_empty());

        let mut unused: Vec<usize> = store
            .seeds()
            .iter()
            .map(|seed| seed.id)
            .filter(|id| !self.used_in_cycle.contains(id))
            .collect();
        if unused.is_empty() {
            self.used_in_cycle.clear();
            self.cycle += 1;
            unused = store.seeds().iter().map(|seed| seed.id).collect();
        }

        let favoured_unused: Vec<usize> = unused
            .iter()
            .copied()
            .filter(|&id| store.get(id).favoured)
            .collect();

        let pool = if !favoured_unused.is_empty() && rand.coinflip(FAVOURED_BIAS) {
            &favoured_unused
        } else {
            &unused
        };
        let selected = *rand
            .choose(pool.iter())
            .expect("selection pool is never empty");
        self.used_in_cycle.insert(selected);
        selected
    }

    /// Number of mutated inputs to derive from `seed` on this visit. Fast
    /// seeds and seeds with wide coverage earn more.
    pub fn energy(seed: &Seed, avg_exec_time: f64) -> u32 {
        let mut perf = 100.0;
        if seed.exec_time > 0.0 && avg_exec_time > 0.0 {
            perf *= (avg_exec_time / seed.exec_time).clamp(0.1, 3.0);
        }
        perf *= 1.0 + seed.coverage.len() as f64 / 100.0;
        (perf.round() as u32).clamp(MIN_ENERGY, MAX_ENERGY)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use libafl_bolts::rands::StdRand;

    use super::*;
    use crate::corpus::SeedStore;

    fn store_with(seed_specs: &[(&[u8], &[usize], f64)]) -> (tempfile::TempDir, SeedStore) {
        let dir = tempfile::tempdir().unwrap();
        let queue = dir.path().join("queue");
        let crashes = dir.path().join("crashes");
        std::fs::create_dir_all(&queue).unwrap();
        std::fs::create_dir_all(&crashes).unwrap();
        let mut store = SeedStore::new(queue, crashes).unwrap();
        for (bytes, edges, exec_time) in seed_specs {
            let coverage: HashSet<usize> = edges.iter().copied().collect();
            store.admit(bytes, coverage, *exec_time).unwrap().unwrap();
        }
        (dir, store)
    }

    #[test]
    fn every_covered_edge_has_a_favoured_winner() {
        let (_dir, mut store) = store_with(&[
            (b"aaaaaaaa", &[1, 2, 3], 0.5),
            (b"bb", &[2, 4], 0.5),
            (b"cccccccccccc", &[4, 5], 0.1),
        ]);
        Scheduler::new().refresh_favoured(&mut store);

        for (edge, ids) in store.edge_entries() {
            assert!(
                ids.iter().any(|&id| store.get(id).favoured),
                "edge {edge} has no favoured seed"
            );
        }
        // Every favoured seed must actually win some edge.
        for seed in store.seeds().iter().filter(|seed| seed.favoured) {
            let wins_one = store.edge_entries().any(|(_, ids)| {
                ids.contains(&seed.id)
                    && ids
                        .iter()
                        .all(|&other| store.get(other).valuation() >= seed.valuation())
            });
            assert!(wins_one, "seed {} is favoured but wins nothing", seed.id);
        }
    }

    #[test]
    fn minimiser_of_size_times_time_wins() {
        // Both cover edge 7; the second is smaller, faster, and also the
        // only seed for edge 8, so it sweeps every edge the first covers.
        let (_dir, mut store) = store_with(&[
            (b"aaaaaaaaaaaaaaaa", &[7], 1.0),
            (b"bb", &[7, 8], 0.1),
        ]);
        Scheduler::new().refresh_favoured(&mut store);
        assert!(!store.get(0).favoured);
        assert!(store.get(1).favoured);
    }

    #[test]
    fn a_cycle_selects_every_seed_exactly_once() {
        let specs: Vec<(&[u8], Vec<usize>, f64)> = (0..10)
            .map(|edge| (b"seed".as_slice(), vec![edge], 0.1))
            .collect();
        let borrowed: Vec<(&[u8], &[usize], f64)> = specs
            .iter()
            .map(|(bytes, edges, time)| (*bytes, edges.as_slice(), *time))
            .collect();
        let (_dir, store) = store_with(&borrowed);

        let mut scheduler = Scheduler::new();
        let mut rand = StdRand::with_seed(7);

        let mut seen = HashSet::new();
        for _ in 0..10 {
            assert_eq!(scheduler.cycle(), 0);
            assert!(seen.insert(scheduler.select_next(&store, &mut rand)));
        }
        assert_eq!(seen.len(), 10);

        // The eleventh pick rolls the cycle over and starts repeating.
        let again = scheduler.select_next(&store, &mut rand);
        assert_eq!(scheduler.cycle(), 1);
        assert!(seen.contains(&again));
    }

    #[test]
    fn favoured_seeds_dominate_selection() {
        let (_dir, mut store) = store_with(&[
            (b"slow-and-large-seed-number-one", &[1], 5.0),
            (b"fast", &[1, 2], 0.01),
        ]);
        Scheduler::new().refresh_favoured(&mut store);
        assert!(!store.get(0).favoured);
        assert!(store.get(1).favoured);

        let mut scheduler = Scheduler::new();
        let mut rand = StdRand::with_seed(99);
        let mut favoured_first = 0;
        for _ in 0..200 {
            // Both rounds drain the queue, so every cycle starts fresh.
            let first = scheduler.select_next(&store, &mut rand);
            scheduler.select_next(&store, &mut rand);
            if first == 1 {
                favoured_first += 1;
            }
        }
        assert!(favoured_first > 150, "favoured picked first only {favoured_first}/200 times");
    }

    #[test]
    fn energy_stays_in_bounds() {
        let (_dir, store) = store_with(&[(b"abcdefgh", &[1, 2, 3], 0.5)]);
        let seed = store.get(0);
        for avg in [0.0, 0.0001, 0.5, 100.0] {
            let energy = Scheduler::energy(seed, avg);
            assert!((MIN_ENERGY..=MAX_ENERGY).contains(&energy));
        }
    }

    #[test]
    fn energy_rewards_speed_and_coverage() {
        let (_dir, store) = store_with(&[
            (b"quick", &[1], 0.1),
            (b"slack", &[2], 10.0),
            (b"broad", &(0..50).map(|e| e + 100).collect::<Vec<_>>()[..], 0.1),
        ]);
        let avg = 1.0;
        let quick = Scheduler::energy(store.get(0), avg);
        let slack = Scheduler::energy(store.get(1), avg);
        let broad = Scheduler::energy(store.get(2), avg);
        assert!(quick > slack);
        assert!(broad > quick);
    }
}

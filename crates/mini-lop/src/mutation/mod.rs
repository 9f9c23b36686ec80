//! Derives new inputs from seeds: havoc, splice, and the bandit that
//! arbitrates between them.

pub mod bandit;
pub mod havoc;

use std::{fs, num::NonZero};

use libafl_bolts::rands::{Rand, StdRand};

pub use self::bandit::{MutationOp, OperatorBandit, OpStats};
use crate::{corpus::SeedStore, error::Result};

/// Uniform draw in `[0, bound)`.
pub(crate) fn draw(rand: &mut StdRand, bound: usize) -> usize {
    rand.below(NonZero::new(bound).expect("draw bound must be positive"))
}

#[derive(Debug)]
pub struct MutationEngine {
    dictionary: Vec<Vec<u8>>,
}

impl MutationEngine {
    pub fn new(dictionary: Vec<Vec<u8>>) -> Self {
        Self { dictionary }
    }

    /// Produces one mutated input derived from the given seed. Seed bytes are
    /// re-read from disk on every call; the queue files are the source of
    /// truth.
    pub fn apply(
        &self,
        op: MutationOp,
        store: &SeedStore,
        seed_id: usize,
        rand: &mut StdRand,
    ) -> Result<Vec<u8>> {
        let mut data = fs::read(&store.get(seed_id).path)?;
        match op {
            MutationOp::Havoc => havoc::havoc(&mut data, &self.dictionary, rand),
            MutationOp::Splice => {
                if let Some(mut spliced) = self.splice(store, seed_id, &data, rand)? {
                    havoc::havoc(&mut spliced, &self.dictionary, rand);
                    return Ok(spliced);
                }
                // Not enough material to cross over; havoc the seed itself.
                havoc::havoc(&mut data, &self.dictionary, rand);
            }
        }
        Ok(data)
    }

    /// Crossover with a second, distinct seed: keep a prefix of the current
    /// input and adopt the partner's tail. `None` when the queue or the
    /// overlap is too small.
    fn splice(
        &self,
        store: &SeedStore,
        seed_id: usize,
        data: &[u8],
        rand: &mut StdRand,
    ) -> Result<Option<Vec<u8>>> {
        if store.len() < 2 {
            return Ok(None);
        }
        let partner_id = {
            let pick = draw(rand, store.len() - 1);
            if pick >= seed_id { pick + 1 } else { pick }
        };
        let partner = fs::read(&store.get(partner_id).path)?;
        Ok(splice_bytes(data, &partner, rand))
    }
}

/// Cuts at a point strictly inside the common prefix range of both buffers.
fn splice_bytes(a: &[u8], b: &[u8], rand: &mut StdRand) -> Option<Vec<u8>> {
    let overlap = a.len().min(b.len());
    if overlap < 2 {
        return None;
    }
    let point = 1 + draw(rand, overlap - 1);
    let mut out = Vec::with_capacity(b.len());
    out.extend_from_slice(&a[..point]);
    out.extend_from_slice(&b[point..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use libafl_bolts::rands::StdRand;

    use super::*;
    use crate::corpus::SeedStore;

    fn two_seed_store() -> (tempfile::TempDir, SeedStore) {
        let dir = tempfile::tempdir().unwrap();
        let queue = dir.path().join("queue");
        let crashes = dir.path().join("crashes");
        std::fs::create_dir_all(&queue).unwrap();
        std::fs::create_dir_all(&crashes).unwrap();
        let mut store = SeedStore::new(queue, crashes).unwrap();
        store
            .admit(&[b'A'; 32], HashSet::from([1]), 0.1)
            .unwrap()
            .unwrap();
        store
            .admit(&[b'B'; 48], HashSet::from([2]), 0.1)
            .unwrap()
            .unwrap();
        (dir, store)
    }

    #[test]
    fn splice_keeps_prefix_and_adopts_tail() {
        let a = [b'A'; 16];
        let b = [b'B'; 24];
        let mut rand = StdRand::with_seed(11);
        let out = splice_bytes(&a, &b, &mut rand).unwrap();

        assert_eq!(out.len(), b.len());
        let point = out.iter().position(|&byte| byte == b'B').unwrap();
        assert!((1..16).contains(&point));
        assert!(out[..point].iter().all(|&byte| byte == b'A'));
        assert!(out[point..].iter().all(|&byte| byte == b'B'));
    }

    #[test]
    fn splice_needs_two_usable_bytes() {
        let mut rand = StdRand::with_seed(11);
        assert!(splice_bytes(&[1], &[2, 3, 4], &mut rand).is_none());
        assert!(splice_bytes(&[], &[2, 3], &mut rand).is_none());
    }

    #[test]
    fn splice_output_mixes_both_parents() {
        let (_dir, store) = two_seed_store();
        let engine = MutationEngine::new(Vec::new());
        let mut rand = StdRand::with_seed(5);

        let mut mixed = false;
        for _ in 0..32 {
            let out = engine.apply(MutationOp::Splice, &store, 0, &mut rand).unwrap();
            if out.contains(&b'A') && out.contains(&b'B') {
                mixed = true;
                break;
            }
        }
        assert!(mixed, "splice never combined the two parents");
    }

    #[test]
    fn splice_falls_back_to_havoc_on_a_lone_seed() {
        let dir = tempfile::tempdir().unwrap();
        let queue = dir.path().join("queue");
        let crashes = dir.path().join("crashes");
        std::fs::create_dir_all(&queue).unwrap();
        std::fs::create_dir_all(&crashes).unwrap();
        let mut store = SeedStore::new(queue, crashes).unwrap();
        store
            .admit(&[7u8; 32], HashSet::from([1]), 0.1)
            .unwrap()
            .unwrap();

        let engine = MutationEngine::new(Vec::new());
        let mut rand = StdRand::with_seed(23);
        let out = engine.apply(MutationOp::Splice, &store, 0, &mut rand).unwrap();
        // One parent only: the result is a havoc pass over that parent.
        assert_eq!(out.len(), 32);
    }

    #[test]
    fn mutated_input_differs_from_the_seed() {
        let (_dir, store) = two_seed_store();
        let engine = MutationEngine::new(Vec::new());
        let mut rand = StdRand::with_seed(1);
        let mut changed = false;
        for _ in 0..16 {
            let out = engine.apply(MutationOp::Havoc, &store, 0, &mut rand).unwrap();
            if out != [b'A'; 32] {
                changed = true;
                break;
            }
        }
        assert!(changed);
    }
}

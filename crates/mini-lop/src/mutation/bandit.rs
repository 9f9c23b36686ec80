//! Epsilon-greedy choice between the top-level mutation operators, rewarded
//! by discovered edges and crashes.

use libafl_bolts::rands::{Rand, StdRand};
use serde::Serialize;

/// Fraction of selections spent exploring instead of exploiting.
const EPSILON: f64 = 0.1;

/// Weight of a crash relative to one newly covered edge.
const CRASH_WEIGHT: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    Havoc,
    Splice,
}

impl MutationOp {
    pub fn name(self) -> &'static str {
        match self {
            Self::Havoc => "havoc",
            Self::Splice => "splice",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct OpStats {
    pub uses: u64,
    pub coverage_reward: u64,
    pub crashes: u64,
}

impl OpStats {
    fn score(&self) -> f64 {
        (self.coverage_reward + CRASH_WEIGHT * self.crashes) as f64 / self.uses.max(1) as f64
    }
}

#[derive(Debug, Default)]
pub struct OperatorBandit {
    havoc: OpStats,
    splice: OpStats,
}

impl OperatorBandit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, rand: &mut StdRand) -> MutationOp {
        if rand.coinflip(EPSILON) {
            if rand.coinflip(0.5) {
                MutationOp::Splice
            } else {
                MutationOp::Havoc
            }
        } else {
            self.exploit()
        }
    }

    /// Highest average payoff wins; ties go to havoc.
    fn exploit(&self) -> MutationOp {
        if self.splice.score() > self.havoc.score() {
            MutationOp::Splice
        } else {
            MutationOp::Havoc
        }
    }

    pub fn reward(&mut self, op: MutationOp, new_edges: usize, crashed: bool) {
        let stats = self.stats_mut(op);
        stats.uses += 1;
        stats.coverage_reward += new_edges as u64;
        if crashed {
            stats.crashes += 1;
        }
    }

    pub fn stats(&self, op: MutationOp) -> OpStats {
        match op {
            MutationOp::Havoc => self.havoc,
            MutationOp::Splice => self.splice,
        }
    }

    fn stats_mut(&mut self, op: MutationOp) -> &mut OpStats {
        match op {
            MutationOp::Havoc => &mut self.havoc,
            MutationOp::Splice => &mut self.splice,
        }
    }
}

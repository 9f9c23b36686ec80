//! The fuzzing loop: dry run, seed selection, mutation, execution, and the
//! feedback-driven bookkeeping in between.

use std::{
    fs,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use itertools::Itertools;
use libafl_bolts::{current_nanos, rands::StdRand};
use tracing::{debug, info, warn};

use crate::{
    corpus::SeedStore,
    error::{FuzzerError, Result},
    execution::TargetHarness,
    feedback::{classify_status, observe_coverage, ExecVerdict},
    mutation::{MutationEngine, OperatorBandit},
    schedule::Scheduler,
    stats::RunStats,
};

/// Everything the fuzzer needs to start; assembling it (and creating the
/// directory tree) is the caller's job.
#[derive(Debug)]
pub struct FuzzConfig {
    pub target: PathBuf,
    /// Initial corpus files for the dry run.
    pub seed_files: Vec<PathBuf>,
    pub queue_dir: PathBuf,
    pub crashes_dir: PathBuf,
    pub current_input: PathBuf,
    pub timeout: Duration,
    pub dictionary: Vec<Vec<u8>>,
    /// Fixed RNG seed for reproducible runs; random otherwise.
    pub random_seed: Option<u64>,
    pub stats_file: Option<PathBuf>,
}

/// The complete mutable fuzzing state, owned in one place and passed by
/// reference; there are no ambient globals.
#[derive(Debug)]
pub struct Fuzzer {
    harness: TargetHarness,
    store: SeedStore,
    scheduler: Scheduler,
    bandit: OperatorBandit,
    engine: MutationEngine,
    rand: StdRand,
    stats: RunStats,
    stats_file: Option<PathBuf>,
}

impl Fuzzer {
    /// Brings up shared memory and the fork server, then dry-runs the
    /// initial corpus. Fails if no seed yields any coverage.
    pub fn init(config: FuzzConfig) -> Result<Self> {
        let harness = TargetHarness::start(config.target, config.current_input, config.timeout)?;
        let store = SeedStore::new(config.queue_dir, config.crashes_dir)?;

        let mut fuzzer = Self {
            harness,
            store,
            scheduler: Scheduler::new(),
            bandit: OperatorBandit::new(),
            engine: MutationEngine::new(config.dictionary),
            rand: StdRand::with_seed(config.random_seed.unwrap_or_else(current_nanos)),
            stats: RunStats::new(),
            stats_file: config.stats_file,
        };

        fuzzer.dry_run(&config.seed_files)?;
        if fuzzer.store.is_empty() {
            return Err(FuzzerError::init(
                "dry run admitted no seeds; is the target instrumented?",
            ));
        }
        fuzzer.scheduler.refresh_favoured(&mut fuzzer.store);
        info!(
            seeds = fuzzer.store.len(),
            edges = fuzzer.store.global_coverage().len(),
            "dry run complete"
        );
        Ok(fuzzer)
    }

    fn dry_run(&mut self, seed_files: &[PathBuf]) -> Result<()> {
        for path in seed_files.iter().sorted() {
            let input = fs::read(path).map_err(|err| {
                FuzzerError::init(format!("cannot read seed {}: {err}", path.display()))
            })?;
            let (status, elapsed) = self.harness.run_input(&input)?;
            let verdict = classify_status(status);
            self.stats.record_execution(elapsed, verdict);
            match verdict {
                ExecVerdict::Timeout => {
                    warn!(seed = %path.display(), "initial seed times out, skipping");
                }
                ExecVerdict::Crash => {
                    warn!(seed = %path.display(), status, "initial seed crashes, skipping");
                }
                ExecVerdict::Ok => {
                    let (new, edges) =
                        observe_coverage(self.harness.bitmap(), self.store.global_coverage());
                    if new {
                        self.store.admit(&input, edges, elapsed.as_secs_f64())?;
                    } else {
                        debug!(seed = %path.display(), "no new coverage, skipping");
                    }
                }
            }
        }
        Ok(())
    }

    /// Fuzzes until `stop` is raised. Returns cleanly on interruption; any
    /// error is fatal to the run.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        info!("entering the fuzz loop");
        while !stop.load(Ordering::Relaxed) {
            let cycle_before = self.scheduler.cycle();
            let seed_id = self.scheduler.select_next(&self.store, &mut self.rand);
            if self.scheduler.cycle() != cycle_before {
                self.scheduler.refresh_favoured(&mut self.store);
                info!(cycle = self.scheduler.cycle(), queue = self.store.len(), "new cycle");
            }

            let energy = Scheduler::energy(self.store.get(seed_id), self.stats.avg_exec_time());
            debug!(seed = seed_id, energy, "fuzzing seed");

            for _ in 0..energy {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let op = self.bandit.select(&mut self.rand);
                let input = self.engine.apply(op, &self.store, seed_id, &mut self.rand)?;
                let (status, elapsed) = self.harness.run_input(&input)?;
                let verdict = classify_status(status);
                self.stats.record_execution(elapsed, verdict);

                match verdict {
                    ExecVerdict::Timeout => {
                        self.bandit.reward(op, 0, false);
                    }
                    ExecVerdict::Crash => {
                        let origin = self.store.get(seed_id).path.clone();
                        let saved = self.store.save_crash(&input, Some(&origin), status)?;
                        info!(status, op = op.name(), path = %saved.display(), "crash found");
                        self.bandit.reward(op, 0, true);
                    }
                    ExecVerdict::Ok => {
                        let (new, edges) =
                            observe_coverage(self.harness.bitmap(), self.store.global_coverage());
                        if new {
                            // Credit is the edge gain over the global set as
                            // it stood before this admission.
                            let gained = self.store.novel_edge_count(&edges);
                            self.store.admit(&input, edges, elapsed.as_secs_f64())?;
                            self.bandit.reward(op, gained, false);
                            self.scheduler.refresh_favoured(&mut self.store);
                        } else {
                            self.bandit.reward(op, 0, false);
                        }
                    }
                }
                self.report_if_due()?;
            }
        }
        info!(executions = self.stats.executions(), "interrupted, shutting down");
        Ok(())
    }

    fn report_if_due(&mut self) -> Result<()> {
        if !self.stats.report_due() {
            return Ok(());
        }
        let snapshot = self.stats.snapshot(&self.store, &self.scheduler, &self.bandit);
        snapshot.log();
        if let Some(path) = &self.stats_file {
            snapshot.write_to(path)?;
        }
        Ok(())
    }
}

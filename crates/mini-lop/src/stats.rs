//! Run counters, the periodic status line, and the optional JSON snapshot.

use std::{
    path::Path,
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::info;

use crate::{
    corpus::SeedStore,
    error::Result,
    feedback::ExecVerdict,
    mutation::{MutationOp, OperatorBandit, OpStats},
    schedule::Scheduler,
    util::write_atomic,
};

/// How often the status line (and the snapshot file, if any) is refreshed.
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct RunStats {
    started: Instant,
    last_report: Instant,
    executions: u64,
    total_exec_time: Duration,
    crashes: u64,
    timeouts: u64,
}

impl RunStats {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_report: now,
            executions: 0,
            total_exec_time: Duration::ZERO,
            crashes: 0,
            timeouts: 0,
        }
    }

    pub fn record_execution(&mut self, elapsed: Duration, verdict: ExecVerdict) {
        self.executions += 1;
        self.total_exec_time += elapsed;
        match verdict {
            ExecVerdict::Crash => self.crashes += 1,
            ExecVerdict::Timeout => self.timeouts += 1,
            ExecVerdict::Ok => {}
        }
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    /// Arithmetic mean duration of every execution so far, in seconds.
    pub fn avg_exec_time(&self) -> f64 {
        if self.executions == 0 {
            return 0.0;
        }
        self.total_exec_time.as_secs_f64() / self.executions as f64
    }

    pub fn report_due(&mut self) -> bool {
        if self.last_report.elapsed() < REPORT_INTERVAL {
            return false;
        }
        self.last_report = Instant::now();
        true
    }

    pub fn snapshot(
        &self,
        store: &SeedStore,
        scheduler: &Scheduler,
        bandit: &OperatorBandit,
    ) -> Snapshot {
        let elapsed = self.started.elapsed().as_secs_f64();
        Snapshot {
            elapsed_secs: elapsed,
            executions: self.executions,
            execs_per_sec: if elapsed > 0.0 {
                self.executions as f64 / elapsed
            } else {
                0.0
            },
            avg_exec_ms: self.avg_exec_time() * 1000.0,
            queue_len: store.len(),
            favoured: store.favoured_count(),
            edges_covered: store.global_coverage().len(),
            crashes: self.crashes,
            timeouts: self.timeouts,
            cycles: scheduler.cycle(),
            havoc: bandit.stats(MutationOp::Havoc),
            splice: bandit.stats(MutationOp::Splice),
        }
    }
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub elapsed_secs: f64,
    pub executions: u64,
    pub execs_per_sec: f64,
    pub avg_exec_ms: f64,
    pub queue_len: usize,
    pub favoured: usize,
    pub edges_covered: usize,
    pub crashes: u64,
    pub timeouts: u64,
    pub cycles: u64,
    pub havoc: OpStats,
    pub splice: OpStats,
}

impl Snapshot {
    pub fn log(&self) {
        info!(
            execs = self.executions,
            execs_per_sec = format_args!("{:.0}", self.execs_per_sec),
            queue = self.queue_len,
            favoured = self.favoured,
            edges = self.edges_covered,
            crashes = self.crashes,
            timeouts = self.timeouts,
            cycle = self.cycles,
            "status"
        );
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn average_tracks_all_executions() {
        let mut stats = RunStats::new();
        assert_eq!(stats.avg_exec_time(), 0.0);
        stats.record_execution(Duration::from_millis(100), ExecVerdict::Ok);
        stats.record_execution(Duration::from_millis(300), ExecVerdict::Timeout);
        assert!((stats.avg_exec_time() - 0.2).abs() < 1e-9);
        assert_eq!(stats.executions(), 2);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.crashes, 0);
    }
}

//! Target execution: shared-memory trace bitmap, staged input file, and the
//! fork server lifecycle.

pub mod fork_server;

use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use libafl_bolts::{
    fs::InputFile,
    shmem::{ShMem, ShMemProvider, UnixShMem, UnixShMemProvider},
    AsSlice, AsSliceMut,
};
use nix::sys::time::TimeSpec;
use tracing::warn;

use self::fork_server::ForkServer;
use crate::{
    error::{FuzzerError, Result},
    feedback::TIMEOUT_STATUS,
};

/// Number of bytes in the edge-coverage bitmap shared with the target.
pub const MAP_SIZE: usize = 65536;

/// Owns everything needed to execute the target on the currently staged
/// input: the coverage shared memory, the staged input file, and the fork
/// server.
#[derive(Debug)]
pub struct TargetHarness {
    target: PathBuf,
    shmem: UnixShMem,
    input_file: InputFile,
    fork_server: ForkServer,
    timeout: TimeSpec,
}

impl TargetHarness {
    pub fn start(target: PathBuf, current_input: PathBuf, timeout: Duration) -> Result<Self> {
        let mut provider = UnixShMemProvider::new()
            .map_err(|err| FuzzerError::init(format!("cannot create shm provider: {err}")))?;
        let shmem = provider
            .new_shmem(MAP_SIZE)
            .map_err(|err| FuzzerError::init(format!("cannot allocate trace bitmap: {err}")))?;
        let input_file = InputFile::create(&current_input).map_err(|err| {
            FuzzerError::init(format!(
                "cannot create staged input {}: {err}",
                current_input.display()
            ))
        })?;
        let fork_server = ForkServer::spawn(&target, &input_file, shmem.id(), MAP_SIZE)?;

        Ok(Self {
            target,
            shmem,
            input_file,
            fork_server,
            timeout: TimeSpec::from_duration(timeout),
        })
    }

    /// Overwrites the staged input with `input`.
    pub fn stage(&mut self, input: &[u8]) -> Result<()> {
        self.input_file.write_buf(input)?;
        Ok(())
    }

    /// Stages `input` and executes the target on it.
    pub fn run_input(&mut self, input: &[u8]) -> Result<(i32, Duration)> {
        self.stage(input)?;
        self.run_once()
    }

    /// Executes the target on whatever is currently staged. A broken fork
    /// server channel is repaired by one respawn; failing again is fatal.
    pub fn run_once(&mut self) -> Result<(i32, Duration)> {
        match self.execute() {
            Err(FuzzerError::Harness(reason)) => {
                warn!(%reason, "fork server channel failed, respawning");
                self.respawn()?;
                self.execute().map_err(|err| {
                    FuzzerError::harness(format!("fork server failed again after respawn: {err}"))
                })
            }
            other => other,
        }
    }

    /// The trace bitmap of the most recent execution.
    pub fn bitmap(&self) -> &[u8] {
        self.shmem.as_slice()
    }

    fn execute(&mut self) -> Result<(i32, Duration)> {
        self.shmem.as_slice_mut().fill(0);
        let started = Instant::now();
        let status = self.fork_server.run_child(&self.timeout)?;
        let elapsed = started.elapsed();
        Ok((status.unwrap_or(TIMEOUT_STATUS), elapsed))
    }

    fn respawn(&mut self) -> Result<()> {
        let fork_server =
            ForkServer::spawn(&self.target, &self.input_file, self.shmem.id(), MAP_SIZE)
                .map_err(|err| FuzzerError::harness(format!("respawn failed: {err}")))?;
        self.fork_server = fork_server;
        Ok(())
    }
}

//! The fork server channel to the instrumented target.
//!
//! The target is spawned once and kept alive; every execution asks it to
//! fork a fresh child over a pair of pipes mapped to well-known descriptors
//! inside the target. This avoids paying exec and dynamic-linking cost per
//! input.

use std::{
    io::{self, Read, Write},
    os::fd::{AsRawFd, BorrowedFd, FromRawFd, RawFd},
    os::unix::process::CommandExt,
    path::Path,
    process::{Child, Command, Stdio},
};

use libafl_bolts::{fs::InputFile, shmem::ShMemId};
use nix::{
    errno::Errno,
    sys::{
        select::FdSet,
        signal::{self, SigSet, Signal},
        time::TimeSpec,
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use os_pipe::{PipeReader, PipeWriter};
use tracing::{debug, warn};

use crate::error::{FuzzerError, Result};

// Descriptors the target's instrumentation expects for the control channel.
mod fd {
    /// Write end inside the target: fuzzer commands arrive here.
    pub const CONTROL: i32 = 198;
    /// Read end inside the fuzzer: fork server status messages.
    pub const STATUS: i32 = CONTROL + 1;
}

/// Environment variable naming the shared-memory segment for the trace
/// bitmap, as the decimal SysV shm id.
const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

/// A running fork server and the pipes to drive it.
#[derive(Debug)]
pub struct ForkServer {
    /// The long-lived target process.
    child: Child,
    /// Status pipe: fork server to fuzzer.
    rx: PipeReader,
    /// Control pipe: fuzzer to fork server.
    tx: PipeWriter,
    /// PID of the forked child currently executing, if any.
    child_pid: Option<Pid>,
    /// Whether the previous round had to be killed; relayed to the fork
    /// server with the next request, per the wire protocol.
    last_run_timed_out: bool,
}

impl ForkServer {
    /// Spawns the target and completes the handshake. The target's stdin is
    /// the staged input file; its instrumentation attaches to `shm_id`.
    pub fn spawn(
        target: &Path,
        input_file: &InputFile,
        shm_id: ShMemId,
        map_size: usize,
    ) -> Result<Self> {
        let (rx, child_writer) = os_pipe::pipe()?;
        let (child_reader, tx) = os_pipe::pipe()?;

        // The target reads every input from the staged file; duplicate the
        // descriptor so respawns can hand it out again.
        let stdin_fd = unsafe { libc::dup(input_file.as_raw_fd()) };
        if stdin_fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: We own the freshly-duplicated descriptor.
        let stdin = unsafe { Stdio::from_raw_fd(stdin_fd) };

        let mut command = Command::new(target);
        command
            .stdin(stdin)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .env(SHM_ENV_VAR, shm_id.to_string())
            .env("AFL_MAP_SIZE", map_size.to_string())
            .env("LD_BIND_NOW", "1");

        let bind_pipes = {
            let ctl_read: RawFd = child_reader.as_raw_fd();
            let st_write: RawFd = child_writer.as_raw_fd();
            let fuzzer_fds: [RawFd; 2] = [rx.as_raw_fd(), tx.as_raw_fd()];
            move || {
                // SAFETY: Raw fd plumbing between fork and exec; all
                //         descriptors are valid in the freshly-forked child.
                unsafe {
                    if libc::setsid() < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::dup2(ctl_read, fd::CONTROL) < 0
                        || libc::dup2(st_write, fd::STATUS) < 0
                    {
                        return Err(io::Error::last_os_error());
                    }
                    for raw in [ctl_read, st_write, fuzzer_fds[0], fuzzer_fds[1]] {
                        libc::close(raw);
                    }
                }
                Ok(())
            }
        };
        unsafe { command.pre_exec(bind_pipes) };

        let child = command.spawn().map_err(|err| {
            FuzzerError::init(format!("cannot spawn fork server {}: {err}", target.display()))
        })?;

        let mut server = Self {
            child,
            rx,
            tx,
            child_pid: None,
            last_run_timed_out: false,
        };

        // Any four bytes announce a live fork server; their content is
        // unused.
        let hello = server
            .read_u32()
            .map_err(|err| FuzzerError::init(format!("fork server handshake failed: {err}")))?;
        debug!(hello, pid = server.child.id(), "fork server is up");

        Ok(server)
    }

    /// Requests one forked execution and waits for its wait status. `None`
    /// means the timeout fired; the child has already been killed and the
    /// channel drained by the time this returns.
    pub fn run_child(&mut self, timeout: &TimeSpec) -> Result<Option<i32>> {
        self.reap_zombies()?;

        let request = u32::from(self.last_run_timed_out);
        self.write_u32(request)
            .map_err(|err| FuzzerError::harness(format!("fork request failed: {err}")))?;

        let child_pid = self
            .read_u32()
            .map_err(|err| FuzzerError::harness(format!("reading child pid failed: {err}")))?;
        let child_pid = i32::try_from(child_pid)
            .ok()
            .filter(|&pid| pid > 0)
            .map(Pid::from_raw)
            .ok_or_else(|| FuzzerError::harness("fork server reported an invalid pid"))?;
        self.child_pid = Some(child_pid);

        let status = self.read_status_timed(timeout)?;
        self.last_run_timed_out = status.is_none();

        if status.is_none() {
            match signal::kill(child_pid, Signal::SIGKILL) {
                // The child may have died on its own in the meantime.
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(errno) => {
                    return Err(FuzzerError::harness(format!(
                        "cannot kill timed-out child {child_pid}: {errno}"
                    )));
                }
            }
            // The fork server reports the killed child's status; drain it to
            // keep the channel in sync.
            self.read_u32().map_err(|err| {
                FuzzerError::harness(format!("draining status after kill failed: {err}"))
            })?;
        }

        self.child_pid = None;
        Ok(status)
    }

    /// Collects any terminated children so kill errors and PIDs stay
    /// meaningful.
    fn reap_zombies(&mut self) -> Result<()> {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return Ok(()),
                Ok(_) => continue,
                Err(Errno::ECHILD) => {
                    return Err(FuzzerError::harness("fork server process is gone"));
                }
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    fn read_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.rx.read_exact(&mut buf)?;
        Ok(u32::from_ne_bytes(buf))
    }

    fn write_u32(&mut self, value: u32) -> io::Result<()> {
        self.tx.write_all(&value.to_ne_bytes())
    }

    /// Waits for a status message for at most `timeout`. `Ok(None)` on
    /// expiry.
    fn read_status_timed(&mut self, timeout: &TimeSpec) -> Result<Option<i32>> {
        let st_read = self.rx.as_raw_fd();
        // SAFETY: The pipe reader owns this descriptor for the whole call.
        let st_read = unsafe { BorrowedFd::borrow_raw(st_read) };

        let mut readfds = FdSet::new();
        readfds.insert(st_read);

        let mut sigset = SigSet::empty();
        sigset.add(Signal::SIGINT);

        let ready = nix::sys::select::pselect(
            None,
            &mut readfds,
            None,
            None,
            Some(timeout),
            Some(&sigset),
        )?;

        if ready > 0 {
            let mut buf = [0u8; 4];
            self.rx.read_exact(&mut buf).map_err(|err| {
                FuzzerError::harness(format!("reading exit status failed: {err}"))
            })?;
            Ok(Some(i32::from_ne_bytes(buf)))
        } else {
            Ok(None)
        }
    }
}

impl Drop for ForkServer {
    fn drop(&mut self) {
        if let Some(pid) = self.child_pid {
            match signal::kill(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(errno) => warn!(%pid, "failed to kill in-flight child: {errno}"),
            }
        }
        if let Err(err) = self.child.kill() {
            warn!(%err, "failed to kill fork server");
        } else if let Err(err) = self.child.wait() {
            warn!(%err, "failed to reap fork server");
        }
    }
}

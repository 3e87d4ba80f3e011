//! Raw wait statuses, CPU usage accounting and the pure interpretation of a
//! job process's termination.

use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

use nix::libc;
use nix::sys::resource::{UsageWho, getrusage};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use serde::{Deserialize, Serialize};

use super::user_proc::{JobClass, ProcState};

/// Exit code a job reports when its exec failed.
pub const JOB_EXEC_FAILED: i32 = 129;

/// A wait(2) status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStatus(pub i32);

impl RawStatus {
    pub fn exited(code: i32) -> Self {
        Self((code & 0xff) << 8)
    }

    pub fn signaled(signal: Signal, core_dumped: bool) -> Self {
        Self(signal as i32 | if core_dumped { 0x80 } else { 0 })
    }

    /// Converts a terminal wait status. Stops, continues and "still alive"
    /// are not terminations.
    pub fn from_wait(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Self::exited(code)),
            WaitStatus::Signaled(_, signal, core) => Some(Self::signaled(signal, core)),
            _ => None,
        }
    }

    pub fn exit_code(self) -> Option<i32> {
        libc::WIFEXITED(self.0).then(|| libc::WEXITSTATUS(self.0))
    }

    /// Terminating signal number, kept raw so unknown signals survive.
    pub fn signal(self) -> Option<i32> {
        libc::WIFSIGNALED(self.0).then(|| libc::WTERMSIG(self.0))
    }

    pub fn core_dumped(self) -> bool {
        libc::WIFSIGNALED(self.0) && libc::WCOREDUMP(self.0)
    }
}

impl fmt::Display for RawStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.exit_code() {
            write!(f, "exited with status {code}")
        } else if let Some(sig) = self.signal() {
            match Signal::try_from(sig) {
                Ok(signal) => write!(f, "killed by {signal}")?,
                Err(_) => write!(f, "killed by signal {sig}")?,
            }
            if self.core_dumped() {
                write!(f, " (core dumped)")?;
            }
            Ok(())
        } else {
            write!(f, "raw status {:#x}", self.0)
        }
    }
}

/// User and system CPU time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuUsage {
    pub user: Duration,
    pub system: Duration,
}

impl CpuUsage {
    /// Totals for all waited-for children of this process.
    pub fn children() -> nix::Result<Self> {
        let usage = getrusage(UsageWho::RUSAGE_CHILDREN)?;
        let (user, system) = (usage.user_time(), usage.system_time());
        Ok(Self {
            user: to_duration(user.tv_sec(), user.tv_usec()),
            system: to_duration(system.tv_sec(), system.tv_usec()),
        })
    }
}

fn to_duration(secs: libc::time_t, micros: libc::suseconds_t) -> Duration {
    let secs = u64::try_from(secs).unwrap_or(0);
    let micros = u64::try_from(micros).unwrap_or(0);
    Duration::from_secs(secs) + Duration::from_micros(micros)
}

impl Add for CpuUsage {
    type Output = CpuUsage;

    fn add(self, rhs: CpuUsage) -> CpuUsage {
        CpuUsage {
            user: self.user + rhs.user,
            system: self.system + rhs.system,
        }
    }
}

impl Sub for CpuUsage {
    type Output = CpuUsage;

    fn sub(self, rhs: CpuUsage) -> CpuUsage {
        CpuUsage {
            user: self.user.saturating_sub(rhs.user),
            system: self.system.saturating_sub(rhs.system),
        }
    }
}

/// What a termination means for the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub state: ProcState,
    /// The CPU used so far is guaranteed to the job (it will not be redone).
    pub commit_cpu: bool,
    /// The process left a checkpoint with the shadow on its way out.
    pub ckpt_transferred: bool,
}

impl Classification {
    fn new(state: ProcState) -> Self {
        Self {
            state,
            commit_cpu: false,
            ckpt_transferred: false,
        }
    }

    fn committed(mut self) -> Self {
        self.commit_cpu = true;
        self
    }
}

/// Interprets a termination status. Deterministic in its inputs.
pub fn classify_exit(status: RawStatus, exit_requested: bool, class: JobClass) -> Classification {
    if exit_requested && class == JobClass::Vanilla {
        return Classification::new(ProcState::NonRunnable);
    }

    if let Some(code) = status.exit_code() {
        return if code == JOB_EXEC_FAILED {
            Classification::new(ProcState::NonRunnable)
        } else {
            Classification::new(ProcState::NormalExit).committed()
        };
    }

    match status.signal().and_then(|sig| Signal::try_from(sig).ok()) {
        Some(Signal::SIGUSR2) => Classification::new(ProcState::Checkpointing).committed(),
        Some(Signal::SIGQUIT) => Classification {
            ckpt_transferred: true,
            ..Classification::new(ProcState::Checkpointing)
        },
        Some(Signal::SIGUSR1 | Signal::SIGKILL) => Classification::new(ProcState::NonRunnable),
        _ => Classification::new(ProcState::AbnormalExit).committed(),
    }
}

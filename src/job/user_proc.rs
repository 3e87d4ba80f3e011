use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::symlink;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::resource::{Resource, setrlimit};
use nix::sys::signal::{Signal, kill};
use nix::unistd::{AccessFlags, Pid, access, geteuid, pipe};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::status::{CpuUsage, JOB_EXEC_FAILED, RawStatus, classify_exit};
use crate::error::{Result, StarterError};
use crate::shadow::{JobDescriptor, JobId};

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const MAIN_SYMBOL: &[u8] = b"\0MAIN\0";
const NOCHECK_ENV: &str = "_CONDOR_NOCHECK";
const SCRATCH_ENV: &str = "CONDOR_SCRATCH_DIR";

/// How a job is spawned and supervised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobClass {
    /// Linked for checkpointing; talks to the starter over a command pipe.
    Standard,
    #[default]
    Vanilla,
    Pvm,
    /// The PVM daemon drives the other PVM processes: it is stopped last and
    /// resumed first.
    #[serde(rename = "pvmd")]
    PvmDaemon,
}

impl JobClass {
    pub fn is_driver(self) -> bool {
        self == JobClass::PvmDaemon
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobClass::Standard => "STANDARD",
            JobClass::Vanilla => "VANILLA",
            JobClass::Pvm => "PVM",
            JobClass::PvmDaemon => "PVMD",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a job process.
///
/// `New → Runnable → Executing ⇄ Suspended`, then one of the terminal
/// states. `Checkpointing` goes back to `Runnable` on restart. `CantFetch`,
/// `BadLink` and `BadMagic` end a process before it ever runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    New,
    Runnable,
    Executing,
    Suspended,
    Checkpointing,
    NormalExit,
    AbnormalExit,
    NonRunnable,
    CantFetch,
    BadLink,
    BadMagic,
}

impl ProcState {
    /// The process ran and is gone.
    pub fn has_terminated(self) -> bool {
        matches!(
            self,
            ProcState::Checkpointing
                | ProcState::NormalExit
                | ProcState::AbnormalExit
                | ProcState::NonRunnable
        )
    }
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcState::New => "NEW",
            ProcState::Runnable => "RUNNABLE",
            ProcState::Executing => "EXECUTING",
            ProcState::Suspended => "SUSPENDED",
            ProcState::Checkpointing => "CHECKPOINTING",
            ProcState::NormalExit => "NORMAL_EXIT",
            ProcState::AbnormalExit => "ABNORMAL_EXIT",
            ProcState::NonRunnable => "NON_RUNNABLE",
            ProcState::CantFetch => "CANT_FETCH",
            ProcState::BadLink => "BAD_LINK",
            ProcState::BadMagic => "BAD_MAGIC",
        };
        f.write_str(name)
    }
}

/// One spawned (or to be spawned) job process.
#[derive(Debug)]
pub struct UserProc {
    id: JobId,
    virtual_pid: i32,
    pid: Option<Pid>,
    class: JobClass,
    state: ProcState,

    usage: CpuUsage,
    guaranteed_usage: CpuUsage,
    exit_status: Option<RawStatus>,
    /// Status to report through the reaper for a process that never started.
    pending_status: Option<RawStatus>,

    ckpt_wanted: bool,
    ckpt_created: bool,
    ckpt_transferred: bool,
    core_created: bool,
    core_transferred: bool,
    core_name: Option<PathBuf>,
    core_limit: Option<u64>,

    soft_kill: Signal,
    restart: bool,
    exit_requested: bool,

    cmd: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    iwd: PathBuf,
    stdin: Option<PathBuf>,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
    owner: Option<(u32, u32)>,

    local_dir: PathBuf,
    cur_ckpt: PathBuf,
}

impl UserProc {
    /// A process in state `New` whose files will live in
    /// `<execute_dir>/dir_<starter_pid>_<cluster>_<proc>`.
    pub fn new(desc: &JobDescriptor, execute_dir: &Path, starter_pid: u32) -> Self {
        let id = desc.job_id();
        let local_dir =
            execute_dir.join(format!("dir_{starter_pid}_{}_{}", id.cluster, id.proc_id));
        let cur_ckpt = local_dir.join(format!("condor_exec.{}.{}", id.cluster, id.proc_id));
        let soft_kill = desc.soft_kill().unwrap_or_else(|e| {
            warn!(job = %id, error = %e, "falling back to SIGTERM");
            Signal::SIGTERM
        });

        Self {
            id,
            virtual_pid: desc.virtual_pid,
            pid: None,
            class: desc.job_class,
            state: ProcState::New,
            usage: CpuUsage::default(),
            guaranteed_usage: CpuUsage::default(),
            exit_status: None,
            pending_status: None,
            ckpt_wanted: desc.checkpoint_wanted,
            ckpt_created: false,
            ckpt_transferred: false,
            core_created: false,
            core_transferred: false,
            core_name: None,
            core_limit: desc.core_limit,
            soft_kill,
            restart: desc.is_restart,
            exit_requested: false,
            cmd: desc.cmd.clone(),
            args: desc.args.clone(),
            env: desc.env.clone(),
            iwd: desc.iwd.clone(),
            stdin: desc.stdin.clone(),
            stdout: desc.stdout.clone(),
            stderr: desc.stderr.clone(),
            owner: desc.uid.zip(desc.gid),
            local_dir,
            cur_ckpt,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn virtual_pid(&self) -> i32 {
        self.virtual_pid
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn class(&self) -> JobClass {
        self.class
    }

    pub fn state(&self) -> ProcState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ProcState::Executing
    }

    pub fn is_suspended(&self) -> bool {
        self.state == ProcState::Suspended
    }

    pub fn exited_abnormally(&self) -> bool {
        self.state == ProcState::AbnormalExit
    }

    pub fn ckpt_enabled(&self) -> bool {
        self.ckpt_wanted
    }

    pub fn ckpt_transferred(&self) -> bool {
        self.ckpt_transferred
    }

    pub fn core_created(&self) -> bool {
        self.core_created
    }

    pub fn core_transferred(&self) -> bool {
        self.core_transferred
    }

    pub fn core_name(&self) -> Option<&Path> {
        self.core_name.as_deref()
    }

    pub fn is_restart(&self) -> bool {
        self.restart
    }

    pub fn exit_status(&self) -> Option<RawStatus> {
        self.exit_status
    }

    pub fn usage(&self) -> CpuUsage {
        self.usage
    }

    pub fn guaranteed_usage(&self) -> CpuUsage {
        self.guaranteed_usage
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    pub fn cur_ckpt(&self) -> &Path {
        &self.cur_ckpt
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    fn shortname(&self) -> String {
        format!("condor_exec.{}.{}", self.id.cluster, self.id.proc_id)
    }

    pub fn create_local_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.local_dir)
    }

    /// The executable already sits on this host and can be linked in place.
    pub fn executable_is_local(&self) -> bool {
        let path = Path::new(&self.cmd);
        path.is_absolute() && access(path, AccessFlags::X_OK).is_ok()
    }

    pub fn link_executable(&self) -> io::Result<()> {
        symlink(&self.cmd, &self.cur_ckpt)?;
        info!(job = %self.id, from = %self.cmd, to = %self.cur_ckpt.display(), "linked executable");
        Ok(())
    }

    /// Records the outcome of getting the executable in place and checks it.
    /// Returns whether the process is now runnable.
    pub fn accept_executable(&mut self, fetched: bool) -> bool {
        if !fetched {
            self.state = ProcState::CantFetch;
            warn!(job = %self.id, cmd = %self.cmd, "could not fetch executable");
            return false;
        }
        if self.class == JobClass::Standard {
            if let Some(bad) = self.check_standard_executable() {
                self.state = bad;
                warn!(job = %self.id, state = %bad, "executable rejected");
                return false;
            }
        }
        self.state = ProcState::Runnable;
        true
    }

    /// A standard-class executable must be ELF and linked with a `MAIN`
    /// entry. `_CONDOR_NOCHECK=1` in the job's environment skips this.
    fn check_standard_executable(&self) -> Option<ProcState> {
        if self
            .env
            .get(NOCHECK_ENV)
            .is_some_and(|v| v.starts_with('1'))
        {
            return None;
        }

        let mut contents = Vec::new();
        if let Err(e) = File::open(&self.cur_ckpt).and_then(|mut f| f.read_to_end(&mut contents)) {
            warn!(path = %self.cur_ckpt.display(), error = %e, "cannot read executable");
            return Some(ProcState::BadMagic);
        }
        if !contents.starts_with(ELF_MAGIC) {
            return Some(ProcState::BadMagic);
        }
        if !contents.windows(MAIN_SYMBOL.len()).any(|w| w == MAIN_SYMBOL) {
            return Some(ProcState::BadLink);
        }
        debug!(job = %self.id, "executable verified");
        None
    }

    /// Starts the process. A spawn failure is not an error here: the process
    /// is left with an exec-failed status for the reaper to pick up.
    pub fn execute(&mut self) -> Result<()> {
        if matches!(self.class, JobClass::Pvm | JobClass::PvmDaemon) {
            return Err(StarterError::UnsupportedJobClass(self.class.to_string()));
        }

        let mut command = Command::new(&self.cur_ckpt);
        command
            .arg0(self.shortname())
            .env_clear()
            .envs(&self.env)
            .env(SCRATCH_ENV, &self.local_dir);

        // Standard jobs read their start-up commands from a pipe.
        let mut cmd_pipe = None;
        match self.class {
            JobClass::Standard => {
                let (read_end, write_end) = pipe().map_err(io::Error::from)?;
                fcntl(write_end.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
                    .map_err(io::Error::from)?;
                command
                    .arg("-_condor_cmd_fd")
                    .arg(read_end.as_raw_fd().to_string())
                    .current_dir(&self.local_dir)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null());
                cmd_pipe = Some((read_end, write_end));
            }
            _ => match self.redirections() {
                Ok((stdin, stdout, stderr)) => {
                    command
                        .current_dir(&self.iwd)
                        .stdin(stdin)
                        .stdout(stdout)
                        .stderr(stderr);
                }
                Err(e) => {
                    warn!(job = %self.id, error = %e, "cannot redirect standard streams");
                    self.exec_failed();
                    return Ok(());
                }
            },
        }
        command.args(&self.args);

        if let Some(limit) = self.core_limit {
            // SAFETY: setrlimit is async-signal-safe and touches no memory
            // shared with the parent.
            unsafe {
                command.pre_exec(move || {
                    setrlimit(Resource::RLIMIT_CORE, limit, limit).map_err(io::Error::from)
                });
            }
        }
        if let Some((uid, gid)) = self.owner
            && geteuid().is_root()
        {
            command.uid(uid).gid(gid);
        }

        info!(
            job = %self.id, exec = %self.cur_ckpt.display(), args = ?self.args,
            restart = self.restart, "starting job"
        );
        match command.spawn() {
            Ok(child) => {
                let pid = Pid::from_raw(child.id() as i32);
                self.pid = Some(pid);
                self.state = ProcState::Executing;
                info!(job = %self.id, %pid, "job started");

                if let Some((read_end, write_end)) = cmd_pipe {
                    drop(read_end);
                    let script: &[u8] = if self.restart { b"restart\nend\n" } else { b"end\n" };
                    if let Err(e) = File::from(write_end).write_all(script) {
                        warn!(job = %self.id, error = %e, "could not send start-up commands");
                    }
                }
            }
            Err(e) => {
                warn!(job = %self.id, error = %e, "exec failed");
                self.exec_failed();
            }
        }
        Ok(())
    }

    /// The process counts as started and its exit is already known.
    fn exec_failed(&mut self) {
        self.pid = None;
        self.state = ProcState::Executing;
        self.pending_status = Some(RawStatus::exited(JOB_EXEC_FAILED));
    }

    fn redirections(&self) -> io::Result<(Stdio, Stdio, Stdio)> {
        Ok((
            self.std_file(self.stdin.as_deref(), false)?,
            self.std_file(self.stdout.as_deref(), true)?,
            self.std_file(self.stderr.as_deref(), true)?,
        ))
    }

    /// Redirection target for a vanilla job's standard stream. Relative
    /// paths resolve against the initial working directory.
    fn std_file(&self, path: Option<&Path>, write: bool) -> io::Result<Stdio> {
        let Some(path) = path else {
            return Ok(Stdio::null());
        };
        let path = self.iwd.join(path);
        let file = if write {
            File::create(&path)?
        } else {
            File::open(&path)?
        };
        Ok(Stdio::from(file))
    }

    pub fn has_pending_status(&self) -> bool {
        self.pending_status.is_some()
    }

    pub fn take_pending_status(&mut self) -> Option<RawStatus> {
        self.pending_status.take()
    }

    /// Applies a termination status: classifies it, accounts the CPU used and
    /// looks for a core file after an abnormal exit.
    pub fn handle_termination(&mut self, status: RawStatus, usage: CpuUsage) {
        let verdict = classify_exit(status, self.exit_requested, self.class);
        info!(job = %self.id, %status, state = %verdict.state, "job process terminated");

        self.exit_status = Some(status);
        self.usage = self.usage + usage;
        if verdict.commit_cpu {
            self.guaranteed_usage = self.usage;
        }
        self.state = verdict.state;
        let pid = self.pid.take();

        match verdict.state {
            ProcState::Checkpointing => {
                self.ckpt_created = true;
                self.ckpt_transferred = verdict.ckpt_transferred;
                self.core_created = false;
            }
            ProcState::AbnormalExit => self.probe_core(pid),
            _ => self.core_created = false,
        }
    }

    /// Looks for `core.<pid>` and then `core` in the local directory. A core
    /// that is a symlink is removed rather than trusted.
    fn probe_core(&mut self, pid: Option<Pid>) {
        self.core_created = false;
        let mut candidates = Vec::with_capacity(2);
        if let Some(pid) = pid {
            candidates.push(self.local_dir.join(format!("core.{pid}")));
        }
        candidates.push(self.local_dir.join("core"));

        let Some((path, meta)) = candidates
            .into_iter()
            .find_map(|p| fs::symlink_metadata(&p).ok().map(|m| (p, m)))
        else {
            debug!(job = %self.id, "no core file");
            return;
        };

        if meta.file_type().is_symlink() {
            warn!(path = %path.display(), "core file is a symlink, removing it");
            let _ = fs::remove_file(&path);
        } else {
            info!(job = %self.id, path = %path.display(), "core file created");
            self.core_created = true;
        }
        self.core_name = Some(path);
    }

    /// Sends `sig`, continuing the process first so it can act on it. A
    /// process that is already gone is not an error.
    pub fn send_sig(&self, sig: Signal) -> Result<()> {
        let Some(pid) = self.pid else {
            debug!(job = %self.id, signal = %sig, "no process to signal");
            return Ok(());
        };

        if sig != Signal::SIGCONT && !self.deliver(pid, Signal::SIGCONT)? {
            return Ok(());
        }
        if self.deliver(pid, sig)? {
            debug!(job = %self.id, %pid, signal = %sig, "signal sent");
        }
        Ok(())
    }

    fn deliver(&self, pid: Pid, sig: Signal) -> Result<bool> {
        match kill(pid, sig) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => {
                debug!(job = %self.id, %pid, signal = %sig, "process already gone");
                Ok(false)
            }
            Err(source) => Err(StarterError::Signal {
                pid: pid.as_raw(),
                source,
            }),
        }
    }

    pub fn suspend(&mut self) -> Result<()> {
        self.send_sig(Signal::SIGSTOP)?;
        self.state = ProcState::Suspended;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        self.send_sig(Signal::SIGCONT)?;
        self.state = ProcState::Executing;
        Ok(())
    }

    /// Asks the process to checkpoint and exit.
    pub fn request_ckpt(&self) -> Result<()> {
        self.send_sig(Signal::SIGTSTP)
    }

    /// Asks the process to checkpoint and keep running.
    pub fn request_periodic_ckpt(&self) -> Result<()> {
        self.send_sig(Signal::SIGUSR2)
    }

    pub fn request_exit(&mut self) -> Result<()> {
        self.exit_requested = true;
        self.send_sig(self.soft_kill)
    }

    pub fn kill_forcibly(&self) -> Result<()> {
        self.send_sig(Signal::SIGKILL)
    }

    /// Prepares a checkpointed process to be restarted from its checkpoint.
    pub fn make_runnable(&mut self) -> Result<()> {
        if self.state != ProcState::Checkpointing {
            return Err(StarterError::InvalidProcState {
                cluster: self.id.cluster,
                proc_id: self.id.proc_id,
                reason: format!("make_runnable in state {}", self.state),
            });
        }
        self.state = ProcState::Runnable;
        self.restart = true;
        Ok(())
    }

    /// The core file to send back and the name to store it under, if one
    /// exists and is within the job's core limit.
    pub fn core_to_store(&self) -> Option<(PathBuf, String)> {
        if !self.core_created {
            info!(job = %self.id, "no core file to send");
            return None;
        }
        let path = self.core_name.clone()?;
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "core file vanished");
                return None;
            }
        };
        if let Some(limit) = self.core_limit
            && size > limit
        {
            info!(job = %self.id, size, limit, "core file exceeds the job's limit, not sending");
            return None;
        }
        Some((path, format!("core.{}.{}", self.id.cluster, self.id.proc_id)))
    }

    pub fn set_core_transferred(&mut self, transferred: bool) {
        self.core_transferred = transferred;
    }

    /// Removes the executable, the core and the local directory. Best effort.
    pub fn delete_files(&self) {
        unlink(&self.cur_ckpt);
        if let Some(core) = &self.core_name {
            unlink(core);
        }
        match fs::remove_dir_all(&self.local_dir) {
            Ok(()) => debug!(dir = %self.local_dir.display(), "removed local directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.local_dir.display(), error = %e, "cannot remove local directory"),
        }
    }

    /// Exit status in the form reported to the shadow.
    ///
    /// Checkpoint exits are reported as the checkpoint signal, processes that
    /// never ran as an exec failure.
    pub fn bsd_exit_status(&self) -> RawStatus {
        match self.state {
            ProcState::NormalExit => self
                .exit_status
                .and_then(RawStatus::exit_code)
                .map_or(RawStatus::exited(0), RawStatus::exited),
            ProcState::AbnormalExit => {
                let signal = self
                    .exit_status
                    .and_then(RawStatus::signal)
                    .and_then(|s| Signal::try_from(s).ok())
                    .unwrap_or(Signal::SIGKILL);
                RawStatus::signaled(signal, self.core_transferred)
            }
            ProcState::Checkpointing => {
                let signal = if self.ckpt_transferred {
                    Signal::SIGQUIT
                } else {
                    Signal::SIGUSR2
                };
                RawStatus::signaled(signal, false)
            }
            ProcState::CantFetch | ProcState::BadLink | ProcState::BadMagic => {
                RawStatus::exited(JOB_EXEC_FAILED)
            }
            _ => self
                .exit_status
                .unwrap_or(RawStatus::signaled(Signal::SIGKILL, false)),
        }
    }
}

/// Unlinks `path`, retrying while the file is busy being executed.
fn unlink(path: &Path) {
    loop {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "unlinked");
                return;
            }
            Err(e) if e.raw_os_error() == Some(Errno::ETXTBSY as i32) => continue,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot unlink");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::time::{Duration, Instant};

    use nix::sys::wait::{WaitPidFlag, waitpid};
    use serial_test::serial;
    use tempfile::TempDir;

    use super::*;

    fn descriptor(cmd: &str) -> JobDescriptor {
        toml::from_str(&format!("cluster = 5\nproc = 1\ncmd = \"{cmd}\"\n")).unwrap()
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn wait_for(pid: Pid) -> RawStatus {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = waitpid(pid, Some(WaitPidFlag::WNOHANG)).unwrap();
            if let Some(raw) = RawStatus::from_wait(status) {
                return raw;
            }
            assert!(Instant::now() < deadline, "child {pid} did not exit");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn local_dir_naming() {
        let proc = UserProc::new(&descriptor("/bin/true"), Path::new("/var/execute"), 4242);
        assert_eq!(proc.local_dir(), Path::new("/var/execute/dir_4242_5_1"));
        assert_eq!(
            proc.cur_ckpt(),
            Path::new("/var/execute/dir_4242_5_1/condor_exec.5.1")
        );
        assert_eq!(proc.state(), ProcState::New);
    }

    #[test]
    fn failed_fetch_is_cant_fetch() {
        let mut proc = UserProc::new(&descriptor("a.out"), Path::new("/nonexistent"), 1);
        assert!(!proc.accept_executable(false));
        assert_eq!(proc.state(), ProcState::CantFetch);
        assert_eq!(proc.bsd_exit_status(), RawStatus::exited(JOB_EXEC_FAILED));
    }

    #[test]
    fn standard_executable_checks() {
        let exec = TempDir::new().unwrap();
        let mut desc = descriptor("a.out");
        desc.job_class = JobClass::Standard;

        let mut proc = UserProc::new(&desc, exec.path(), 1);
        proc.create_local_dir().unwrap();

        fs::write(proc.cur_ckpt(), b"#!/bin/sh\n").unwrap();
        assert!(!proc.accept_executable(true));
        assert_eq!(proc.state(), ProcState::BadMagic);

        fs::write(proc.cur_ckpt(), b"\x7fELF\x02\x01\x01\0main\0").unwrap();
        assert!(!proc.accept_executable(true));
        assert_eq!(proc.state(), ProcState::BadLink);

        fs::write(proc.cur_ckpt(), b"\x7fELF\x02\x01\x01\0MAIN\0").unwrap();
        assert!(proc.accept_executable(true));
        assert_eq!(proc.state(), ProcState::Runnable);
    }

    #[test]
    fn nocheck_skips_standard_checks() {
        let exec = TempDir::new().unwrap();
        let mut desc = descriptor("a.out");
        desc.job_class = JobClass::Standard;
        desc.env.insert(NOCHECK_ENV.into(), "1".into());

        let mut proc = UserProc::new(&desc, exec.path(), 1);
        proc.create_local_dir().unwrap();
        fs::write(proc.cur_ckpt(), b"#!/bin/sh\n").unwrap();
        assert!(proc.accept_executable(true));
    }

    #[test]
    fn vanilla_executables_are_not_inspected() {
        let mut proc = UserProc::new(&descriptor("a.out"), Path::new("/nonexistent"), 1);
        assert!(proc.accept_executable(true));
        assert_eq!(proc.state(), ProcState::Runnable);
    }

    #[test]
    fn pvm_jobs_are_refused() {
        let mut desc = descriptor("/bin/true");
        desc.job_class = JobClass::Pvm;
        let mut proc = UserProc::new(&desc, Path::new("/nonexistent"), 1);
        assert!(matches!(
            proc.execute(),
            Err(StarterError::UnsupportedJobClass(_))
        ));
        assert_eq!(proc.pid(), None);
    }

    #[test]
    fn make_runnable_requires_checkpointing() {
        let mut proc = UserProc::new(&descriptor("/bin/true"), Path::new("/x"), 1);
        assert!(matches!(
            proc.make_runnable(),
            Err(StarterError::InvalidProcState { cluster: 5, proc_id: 1, .. })
        ));

        proc.handle_termination(RawStatus::signaled(Signal::SIGUSR2, false), CpuUsage::default());
        assert_eq!(proc.state(), ProcState::Checkpointing);
        proc.make_runnable().unwrap();
        assert_eq!(proc.state(), ProcState::Runnable);
        assert!(proc.is_restart());
    }

    #[test]
    fn termination_accounts_cpu() {
        let mut proc = UserProc::new(&descriptor("/bin/true"), Path::new("/x"), 1);
        let slice = CpuUsage {
            user: Duration::from_secs(2),
            system: Duration::from_secs(1),
        };
        proc.handle_termination(RawStatus::signaled(Signal::SIGQUIT, false), slice);
        assert_eq!(proc.usage(), slice);
        // A transferred checkpoint does not commit CPU.
        assert_eq!(proc.guaranteed_usage(), CpuUsage::default());
        assert!(proc.ckpt_transferred());
        assert_eq!(
            proc.bsd_exit_status(),
            RawStatus::signaled(Signal::SIGQUIT, false)
        );
    }

    #[test]
    fn abnormal_exit_finds_core_with_pid_first() {
        let exec = TempDir::new().unwrap();
        let mut proc = UserProc::new(&descriptor("/bin/true"), exec.path(), 1);
        proc.create_local_dir().unwrap();
        proc.pid = Some(Pid::from_raw(777));
        fs::write(proc.local_dir().join("core.777"), b"dump").unwrap();
        fs::write(proc.local_dir().join("core"), b"other").unwrap();

        proc.handle_termination(RawStatus::signaled(Signal::SIGSEGV, true), CpuUsage::default());
        assert!(proc.exited_abnormally());
        assert!(proc.core_created());
        assert_eq!(proc.core_name(), Some(proc.local_dir().join("core.777").as_path()));
        assert_eq!(proc.pid(), None);

        let (path, remote) = proc.core_to_store().unwrap();
        assert_eq!(path, proc.local_dir().join("core.777"));
        assert_eq!(remote, "core.5.1");
    }

    #[test]
    fn symlinked_core_is_removed() {
        let exec = TempDir::new().unwrap();
        let mut proc = UserProc::new(&descriptor("/bin/true"), exec.path(), 1);
        proc.create_local_dir().unwrap();
        let core = proc.local_dir().join("core");
        symlink("/etc/passwd", &core).unwrap();

        proc.handle_termination(RawStatus::signaled(Signal::SIGABRT, false), CpuUsage::default());
        assert!(!proc.core_created());
        assert!(fs::symlink_metadata(&core).is_err());
        assert!(proc.core_to_store().is_none());
    }

    #[test]
    fn oversized_core_is_not_stored() {
        let exec = TempDir::new().unwrap();
        let mut desc = descriptor("/bin/true");
        desc.core_limit = Some(3);
        let mut proc = UserProc::new(&desc, exec.path(), 1);
        proc.create_local_dir().unwrap();
        fs::write(proc.local_dir().join("core"), b"too big").unwrap();

        proc.handle_termination(RawStatus::signaled(Signal::SIGSEGV, false), CpuUsage::default());
        assert!(proc.core_created());
        assert!(proc.core_to_store().is_none());
    }

    #[test]
    fn bsd_status_encoding() {
        let mut proc = UserProc::new(&descriptor("/bin/true"), Path::new("/x"), 1);
        proc.handle_termination(RawStatus::exited(4), CpuUsage::default());
        assert_eq!(proc.bsd_exit_status(), RawStatus::exited(4));

        let mut proc = UserProc::new(&descriptor("/bin/true"), Path::new("/x"), 1);
        proc.handle_termination(RawStatus::signaled(Signal::SIGSEGV, true), CpuUsage::default());
        proc.set_core_transferred(true);
        assert_eq!(
            proc.bsd_exit_status(),
            RawStatus::signaled(Signal::SIGSEGV, true)
        );

        let mut proc = UserProc::new(&descriptor("/bin/true"), Path::new("/x"), 1);
        proc.handle_termination(RawStatus::signaled(Signal::SIGKILL, false), CpuUsage::default());
        assert_eq!(proc.state(), ProcState::NonRunnable);
        assert_eq!(
            proc.bsd_exit_status(),
            RawStatus::signaled(Signal::SIGKILL, false)
        );
    }

    #[test]
    fn signalling_without_a_pid_is_a_no_op() {
        let proc = UserProc::new(&descriptor("/bin/true"), Path::new("/x"), 1);
        proc.kill_forcibly().unwrap();
        proc.request_periodic_ckpt().unwrap();
    }

    #[test]
    #[serial]
    fn vanilla_job_runs_with_its_environment() {
        let exec = TempDir::new().unwrap();
        let iwd = TempDir::new().unwrap();
        let script = write_script(
            iwd.path(),
            "job.sh",
            "echo \"$GREETING $CONDOR_SCRATCH_DIR\" > out.txt\nexit 3",
        );

        let mut desc = descriptor(script.to_str().unwrap());
        desc.iwd = iwd.path().to_path_buf();
        desc.env.insert("GREETING".into(), "hello".into());

        let mut proc = UserProc::new(&desc, exec.path(), 1);
        proc.create_local_dir().unwrap();
        assert!(proc.executable_is_local());
        proc.link_executable().unwrap();
        assert!(proc.accept_executable(true));

        proc.execute().unwrap();
        assert!(proc.is_running());
        let pid = proc.pid().unwrap();
        let status = wait_for(pid);
        proc.handle_termination(status, CpuUsage::default());

        assert_eq!(proc.state(), ProcState::NormalExit);
        assert_eq!(proc.bsd_exit_status(), RawStatus::exited(3));
        let out = fs::read_to_string(iwd.path().join("out.txt")).unwrap();
        assert_eq!(out.trim(), format!("hello {}", proc.local_dir().display()));

        proc.delete_files();
        assert!(!proc.local_dir().exists());
        assert!(script.exists());
    }

    #[test]
    #[serial]
    fn soft_kill_of_vanilla_job_is_not_runnable() {
        let exec = TempDir::new().unwrap();
        let iwd = TempDir::new().unwrap();
        let script = write_script(iwd.path(), "job.sh", "exec sleep 30");

        let mut desc = descriptor(script.to_str().unwrap());
        desc.iwd = iwd.path().to_path_buf();
        desc.env.insert("PATH".into(), "/usr/bin:/bin".into());

        let mut proc = UserProc::new(&desc, exec.path(), 1);
        proc.create_local_dir().unwrap();
        proc.link_executable().unwrap();
        proc.accept_executable(true);
        proc.execute().unwrap();
        let pid = proc.pid().unwrap();

        proc.suspend().unwrap();
        assert!(proc.is_suspended());
        // The soft kill continues the process before signalling it.
        proc.request_exit().unwrap();
        let status = wait_for(pid);
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));

        proc.handle_termination(status, CpuUsage::default());
        assert_eq!(proc.state(), ProcState::NonRunnable);
        assert_eq!(proc.bsd_exit_status(), status);

        // Gone for good: further signals are quietly dropped.
        proc.kill_forcibly().unwrap();
        proc.delete_files();
    }

    #[test]
    #[serial]
    fn spawn_failure_leaves_a_pending_exec_failure() {
        let exec = TempDir::new().unwrap();
        let mut proc = UserProc::new(&descriptor("/bin/true"), exec.path(), 1);
        proc.create_local_dir().unwrap();
        // No executable was ever put in place.
        proc.accept_executable(true);
        proc.execute().unwrap();

        assert_eq!(proc.pid(), None);
        assert!(proc.has_pending_status());
        let status = proc.take_pending_status().unwrap();
        proc.handle_termination(status, CpuUsage::default());
        assert_eq!(proc.state(), ProcState::NonRunnable);
        assert!(!proc.has_pending_status());
    }
}

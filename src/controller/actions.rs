//! Lifecycle action routines.
//!
//! State actions return the event that picks the next transition; pausing
//! actions never return and are abandoned when an event moves the machine
//! on. Transition actions return `NoEvent`, except the reaper, which answers
//! `Abort` to ignore a child exit that matched none of our processes.

use std::fs;
use std::future;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use super::Starter;
use crate::error::{Result, StarterError};
use crate::job::{CpuUsage, JobClass, ProcState, ProcessList, RawStatus, UserProc};
use crate::shadow::{JobId, Shadow};
use crate::state_machine::{Event, EventHandler};

/// Which processes an operation applies to, and in which order relative to
/// the driver process.
#[derive(Clone, Copy)]
enum Order {
    DriverFirst,
    DriverLast,
}

impl<S: Shadow> Starter<S> {
    pub(super) fn init(&self) -> Result<Event> {
        fs::create_dir_all(&self.config.execute_dir)?;
        self.children_usage.set(CpuUsage::children().unwrap_or_default());
        info!(
            pid = self.pid,
            execute = %self.config.execute_dir.display(),
            keepalive_secs = self.config.keepalive_secs,
            ckpt_interval_secs = self.config.min_ckpt_interval_secs,
            "starter initialised"
        );
        Ok(Event::Default)
    }

    pub(super) async fn get_proc(&self) -> Result<Event> {
        self.intake.borrow_mut().clear();
        let desc = match self.shadow.request_job_info().await {
            Ok(Some(desc)) => desc,
            Ok(None) => {
                debug!("no job available");
                return Ok(self.nothing_new());
            }
            Err(e) => {
                warn!(error = %e, "job intake failed");
                return Ok(self.nothing_new());
            }
        };

        let proc = UserProc::new(&desc, &self.config.execute_dir, self.pid);
        info!(
            job = %proc.id(), class = %proc.class(), cmd = proc.cmd(),
            dir = %proc.local_dir().display(), "got job"
        );
        self.procs.borrow_mut().push(proc);
        self.intake.borrow_mut().reset();
        Ok(Event::Success)
    }

    /// An empty intake waits for the next job, unless jobs are already
    /// running and need supervising.
    fn nothing_new(&self) -> Event {
        if self.procs.borrow().is_empty() {
            Event::TryLater
        } else {
            Event::NoNewProc
        }
    }

    /// Pauses until a new job is signalled or the retry timer asks again.
    pub(super) async fn wait_for_job(&self) -> Result<Event> {
        {
            let mut intake = self.intake.borrow_mut();
            intake.start();
            debug!(retry_in = ?intake.interval(), "waiting for a job");
            intake.update_interval();
        }
        future::pending().await
    }

    /// Puts the current process's executable in place: linked when it is
    /// already on this host, otherwise fetched from the shadow.
    pub(super) async fn get_exec(&self) -> Result<Event> {
        let (id, remote, dest, linked) = {
            let procs = self.procs.borrow();
            let proc = procs.current()?;
            proc.create_local_dir()?;
            let linked = proc.executable_is_local()
                && proc
                    .link_executable()
                    .inspect_err(|e| warn!(job = %proc.id(), error = %e, "cannot link executable"))
                    .is_ok();
            (proc.id(), proc.cmd().to_string(), proc.cur_ckpt().to_path_buf(), linked)
        };

        let mut in_place = linked;
        if !in_place {
            let attempts = self.config.exec_transfer_attempts.max(1);
            for attempt in 1..=attempts {
                if self.shadow.fetch_file(&remote, &dest).await {
                    info!(job = %id, from = %remote, attempt, "fetched executable");
                    in_place = true;
                    break;
                }
                warn!(job = %id, from = %remote, attempt, attempts, "executable transfer failed");
            }
        }

        let runnable = self.procs.borrow_mut().current_mut()?.accept_executable(in_place);
        Ok(if runnable { Event::Success } else { Event::Failure })
    }

    /// Starts every runnable process and resumes every suspended one.
    pub(super) fn spawn_all(&self) -> Result<Event> {
        let mut exec_failed = false;
        for proc in self.procs.borrow_mut().iter_mut() {
            match proc.state() {
                ProcState::Runnable => {
                    proc.execute()?;
                    exec_failed |= proc.has_pending_status();
                }
                ProcState::Suspended => proc.resume()?,
                state => debug!(job = %proc.id(), %state, "not runnable"),
            }
        }
        if exec_failed {
            report_exec_failure()?;
        }
        Ok(Event::NoEvent)
    }

    pub(super) async fn supervise_all(&self) -> Result<Event> {
        let wants_ckpt = {
            let mut procs = self.procs.borrow_mut();
            let terminated = procs.iter().position(|p| p.state().has_terminated());
            if let Some(index) = terminated {
                procs.select(index);
                return Ok(Event::ProcExited);
            }
            procs.iter().any(UserProc::ckpt_enabled)
        };

        if wants_ckpt {
            let mut timer = self.ckpt_timer.borrow_mut();
            if !timer.is_active() {
                timer.start();
                debug!(interval = ?timer.interval(), "periodic checkpoints started");
            }
        }
        self.keepalive.borrow_mut().set(self.config.keepalive());
        future::pending().await
    }

    pub(super) async fn test_connection(&self) -> Result<Event> {
        if !self.shadow.ping().await {
            error!("lost our connection to the shadow");
            return Err(StarterError::ShadowLost);
        }
        self.keepalive.borrow_mut().set(self.config.keepalive());
        Ok(Event::NoEvent)
    }

    pub(super) fn periodic_ckpt_all(&self) -> Result<Event> {
        for proc in self.procs.borrow().iter().filter(|p| p.ckpt_enabled()) {
            proc.request_periodic_ckpt()?;
            info!(job = %proc.id(), "requested periodic checkpoint");
        }
        let mut timer = self.ckpt_timer.borrow_mut();
        timer.update_interval();
        timer.start();
        Ok(Event::NoEvent)
    }

    pub(super) fn susp_ckpt_timer(&self) -> Result<Event> {
        let mut keepalive = self.keepalive.borrow_mut();
        debug!(keepalive_left = ?keepalive.remaining(), "suspending timers");
        keepalive.cancel();
        self.ckpt_timer.borrow_mut().suspend();
        Ok(Event::NoEvent)
    }

    /// Stops every running process, then waits to be continued.
    pub(super) async fn susp_all(&self) -> Result<Event> {
        self.stop_all()?;
        info!("job suspended");
        future::pending().await
    }

    fn stop_all(&self) -> Result<()> {
        self.in_order(Order::DriverLast, UserProc::is_running, |proc| {
            proc.suspend()?;
            info!(job = %proc.id(), "suspended");
            Ok(())
        })
    }

    pub(super) fn resume_all(&self) -> Result<Event> {
        self.in_order(Order::DriverFirst, UserProc::is_suspended, |proc| {
            proc.resume()?;
            info!(job = %proc.id(), "resumed");
            Ok(())
        })?;
        let mut timer = self.ckpt_timer.borrow_mut();
        if timer.is_suspended() {
            timer.resume();
            debug!(interval = ?timer.interval(), "periodic checkpoints resumed");
        }
        Ok(Event::NoEvent)
    }

    /// Collects every terminated child without blocking, including processes
    /// whose spawn failed. The last process matched becomes current.
    pub(super) fn reaper(&self) -> Result<Event> {
        let mut procs = self.procs.borrow_mut();
        let mut matched = None;

        for index in 0..procs.len() {
            if let Some(proc) = procs.get_mut(index)
                && let Some(status) = proc.take_pending_status()
            {
                proc.handle_termination(status, CpuUsage::default());
                matched = Some(index);
            }
        }

        loop {
            let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!(error = %e, "waitpid failed");
                    break;
                }
            };
            let (Some(pid), Some(raw)) = (status.pid(), RawStatus::from_wait(status)) else {
                continue;
            };
            let usage = self.children_usage_delta();
            match procs.position_of(pid) {
                Some(index) => {
                    if let Some(proc) = procs.get_mut(index) {
                        proc.handle_termination(raw, usage);
                    }
                    matched = Some(index);
                }
                None => debug!(%pid, status = %raw, "reaped a child that is not a job"),
            }
        }

        let Some(index) = matched else {
            return Ok(Event::Abort);
        };
        procs.select(index);
        let mut keepalive = self.keepalive.borrow_mut();
        if !self.grace.get() && keepalive.is_armed() {
            keepalive.cancel();
            debug!("keep-alive cancelled");
        }
        Ok(Event::NoEvent)
    }

    pub(super) fn proc_exit(&self) -> Result<Event> {
        let procs = self.procs.borrow();
        let proc = procs.current()?;
        match proc.state() {
            ProcState::Checkpointing => Ok(Event::CkptExit),
            ProcState::AbnormalExit => Ok(Event::HasCore),
            ProcState::NonRunnable | ProcState::NormalExit => Ok(Event::NoCore),
            state => Err(StarterError::InvalidProcState {
                cluster: proc.id().cluster,
                proc_id: proc.id().proc_id,
                reason: format!("unexpected state {state} after exit"),
            }),
        }
    }

    /// Restarts the current process from the checkpoint it just left.
    pub(super) fn make_runnable(&self) -> Result<Event> {
        let exec_failed = {
            let mut procs = self.procs.borrow_mut();
            let proc = procs.current_mut()?;
            proc.make_runnable()?;
            proc.execute()?;
            proc.has_pending_status()
        };
        if exec_failed {
            report_exec_failure()?;
        }
        Ok(Event::NoEvent)
    }

    pub(super) async fn send_core(&self) -> Result<Event> {
        self.store_current_core().await?;
        Ok(Event::Default)
    }

    async fn store_current_core(&self) -> Result<()> {
        let (id, core) = {
            let procs = self.procs.borrow();
            let proc = procs.current()?;
            (proc.id(), proc.core_to_store())
        };
        let Some((path, remote)) = core else {
            return Ok(());
        };

        let sent = self.shadow.send_file(&path, &remote).await;
        if sent {
            info!(job = %id, core = %path.display(), to = %remote, "core file sent");
        } else {
            warn!(job = %id, core = %path.display(), "could not send core file");
        }
        self.procs.borrow_mut().current_mut()?.set_core_transferred(sent);
        Ok(())
    }

    /// `DoWait` while any process is still alive; otherwise saves the cores
    /// left behind and moves on.
    pub(super) async fn terminate_all(&self) -> Result<Event> {
        let cores: Vec<usize> = {
            let procs = self.procs.borrow();
            if procs.iter().any(|p| p.is_running() || p.is_suspended()) {
                return Ok(Event::DoWait);
            }
            procs
                .iter()
                .enumerate()
                .filter(|(_, p)| p.exited_abnormally() && !p.core_transferred())
                .map(|(index, _)| index)
                .collect()
        };

        for index in cores {
            self.procs.borrow_mut().select(index);
            self.store_current_core().await?;
        }

        self.keepalive.borrow_mut().cancel();
        self.grace.set(false);
        Ok(Event::Default)
    }

    pub(super) async fn dispose_one(&self) -> Result<Event> {
        let (id, status, usage) = {
            let procs = self.procs.borrow();
            let proc = procs.current()?;
            (proc.id(), proc.bsd_exit_status(), proc.guaranteed_usage())
        };
        self.send_final_status(id, status, usage).await;

        let proc = self.procs.borrow_mut().remove_current()?;
        log_disposal(&proc);
        proc.delete_files();
        Ok(Event::NoEvent)
    }

    pub(super) async fn dispose_all(&self) -> Result<Event> {
        let procs: Vec<UserProc> = self.procs.borrow_mut().drain().collect();
        for proc in procs {
            self.send_final_status(proc.id(), proc.bsd_exit_status(), proc.guaranteed_usage())
                .await;
            log_disposal(&proc);
            proc.delete_files();
        }
        Ok(Event::Default)
    }

    async fn send_final_status(&self, id: JobId, status: RawStatus, usage: CpuUsage) {
        info!(job = %id, %status, "sending final status");
        if let Err(e) = self.shadow.report_final_status(id, status, usage).await {
            warn!(job = %id, error = %e, "could not report final status");
        }
    }

    /// Grace timeout expired: kill what is left and remove it unreported.
    pub(super) fn cleanup(&self) -> Result<Event> {
        self.keepalive.borrow_mut().cancel();
        self.grace.set(false);
        self.remove_all_forcibly();
        Ok(Event::NoEvent)
    }

    pub(super) fn remove_all_forcibly(&self) {
        let Ok(mut list) = self.procs.try_borrow_mut() else {
            warn!("process list busy, nothing cleaned up");
            return;
        };
        let (drivers, others): (Vec<UserProc>, Vec<UserProc>) =
            list.drain().partition(|p| p.class().is_driver());
        for proc in others.into_iter().chain(drivers) {
            if let Err(e) = proc.kill_forcibly() {
                warn!(job = %proc.id(), error = %e, "kill failed");
            }
            proc.delete_files();
            info!(job = %proc.id(), "removed");
        }
    }

    pub(super) async fn asynch_wait(&self) -> Result<Event> {
        future::pending().await
    }

    /// Asks every live process to exit on its own, leaving time for a final
    /// checkpoint.
    pub(super) fn req_vacate(&self) -> Result<Event> {
        self.stop_timers();
        self.in_order(Order::DriverLast, is_alive, |proc| {
            if matches!(proc.class(), JobClass::Standard | JobClass::Pvm) {
                info!(job = %proc.id(), "requesting checkpoint and exit");
                proc.request_ckpt()
            } else {
                info!(job = %proc.id(), "requesting exit");
                proc.request_exit()
            }
        })?;
        self.arm_grace(self.config.ckpt_timeout());
        Ok(Event::NoEvent)
    }

    pub(super) fn req_die(&self) -> Result<Event> {
        self.stop_timers();
        self.in_order(Order::DriverLast, is_alive, |proc| {
            info!(job = %proc.id(), "killing");
            proc.kill_forcibly()
        })?;
        self.arm_grace(self.config.vacate_timeout());
        Ok(Event::NoEvent)
    }

    fn stop_timers(&self) {
        self.keepalive.borrow_mut().cancel();
        self.ckpt_timer.borrow_mut().clear();
        self.intake.borrow_mut().clear();
    }

    fn arm_grace(&self, timeout: Duration) {
        self.keepalive.borrow_mut().set(timeout);
        self.grace.set(true);
        debug!(?timeout, "grace timeout armed");
    }

    /// Runs `op` on every process matching `select`, the driver class in the
    /// given position.
    fn in_order(
        &self,
        order: Order,
        select: impl Fn(&UserProc) -> bool,
        mut op: impl FnMut(&mut UserProc) -> Result<()>,
    ) -> Result<()> {
        let mut procs = self.procs.borrow_mut();
        for index in visit_order(&procs, order, select) {
            if let Some(proc) = procs.get_mut(index) {
                op(proc)?;
            }
        }
        Ok(())
    }
}

/// Positions of the processes matching `select`, drivers placed as `order`
/// asks and list order kept otherwise.
fn visit_order(
    procs: &ProcessList,
    order: Order,
    select: impl Fn(&UserProc) -> bool,
) -> Vec<usize> {
    let (drivers, others): (Vec<_>, Vec<_>) = procs
        .iter()
        .enumerate()
        .filter(|(_, p)| select(*p))
        .partition(|(_, p)| p.class().is_driver());
    let (first, second) = match order {
        Order::DriverFirst => (drivers, others),
        Order::DriverLast => (others, drivers),
    };
    first.into_iter().chain(second).map(|(index, _)| index).collect()
}

fn log_disposal(proc: &UserProc) {
    info!(
        job = %proc.id(),
        vpid = proc.virtual_pid(),
        restarted = proc.is_restart(),
        status = ?proc.exit_status(),
        ckpt_transferred = proc.ckpt_transferred(),
        core = ?proc.core_created().then(|| proc.core_name()).flatten(),
        user_secs = proc.usage().user.as_secs_f64(),
        sys_secs = proc.usage().system.as_secs_f64(),
        "disposed of job"
    );
}

fn is_alive(proc: &UserProc) -> bool {
    proc.is_running() || proc.is_suspended()
}

/// A failed spawn is reported the same way as any other child exit.
fn report_exec_failure() -> Result<()> {
    EventHandler::raise(Signal::SIGCHLD)
}

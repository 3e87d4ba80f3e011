//! The job controller: the context every lifecycle action runs against.

mod actions;
mod tables;

use std::cell::{Cell, RefCell};

use tracing::{debug, warn};

use crate::config::StarterConfig;
use crate::error::Result;
use crate::job::{CpuUsage, ProcessList};
use crate::shadow::Shadow;
use crate::state_machine::{Alarm, BackoffTimer, Dispatch, Event, EventHandler};

pub use tables::{Action, build_machine};

/// Owns the job processes and the timers that pace them.
///
/// Actions take `&self`: the running state action and a transition action may
/// both be alive at once, so all mutable state sits in cells and no borrow is
/// held across an `.await`.
pub struct Starter<S> {
    config: StarterConfig,
    shadow: S,
    pid: u32,
    procs: RefCell<ProcessList>,
    /// Keep-alive check while supervising, reused as the grace timeout once
    /// the job has been asked to leave.
    keepalive: RefCell<Alarm>,
    ckpt_timer: RefCell<BackoffTimer>,
    intake: RefCell<BackoffTimer>,
    /// Children usage as of the last reap.
    children_usage: Cell<CpuUsage>,
    /// A vacate or die grace timeout is running on the keep-alive alarm.
    grace: Cell<bool>,
}

impl<S: Shadow> Starter<S> {
    pub fn new(config: StarterConfig, shadow: S) -> Self {
        let ckpt_timer = BackoffTimer::new(config.min_ckpt_interval(), config.max_ckpt_interval());
        let intake = BackoffTimer::new(config.intake_retry_min(), config.intake_retry_max());
        Self {
            config,
            shadow,
            pid: std::process::id(),
            procs: RefCell::new(ProcessList::new()),
            keepalive: RefCell::new(Alarm::new()),
            ckpt_timer: RefCell::new(ckpt_timer),
            intake: RefCell::new(intake),
            children_usage: Cell::new(CpuUsage::default()),
            grace: Cell::new(false),
        }
    }

    pub fn shadow(&self) -> &S {
        &self.shadow
    }

    pub fn process_count(&self) -> usize {
        self.procs.borrow().len()
    }

    /// Routes the starter's timers into `handler`.
    pub fn watch_timers(&self, handler: &mut EventHandler) {
        handler.watch_alarm(self.keepalive.borrow().slot(), Event::Alarm);
        handler.watch_alarm(self.intake.borrow().slot(), Event::Alarm);
        handler.watch_alarm(self.ckpt_timer.borrow().slot(), Event::Ckpt);
    }

    /// Last resort after a fatal error: kill every job process and remove its
    /// files without talking to the shadow.
    pub fn exception_cleanup(&self) {
        let Ok(mut keepalive) = self.keepalive.try_borrow_mut() else {
            warn!("timers busy during exception cleanup");
            return;
        };
        keepalive.cancel();
        drop(keepalive);
        if let Ok(mut timer) = self.ckpt_timer.try_borrow_mut() {
            timer.clear();
        }
        if let Ok(mut timer) = self.intake.try_borrow_mut() {
            timer.clear();
        }
        self.remove_all_forcibly();
    }

    /// Usage of children reaped since the previous call.
    fn children_usage_delta(&self) -> CpuUsage {
        match CpuUsage::children() {
            Ok(now) => {
                let delta = now - self.children_usage.get();
                self.children_usage.set(now);
                delta
            }
            Err(e) => {
                debug!(error = %e, "getrusage failed");
                CpuUsage::default()
            }
        }
    }
}

impl<S: Shadow> Dispatch for Starter<S> {
    type Action = Action;

    async fn invoke(&self, action: Action) -> Result<Event> {
        match action {
            Action::Init => self.init(),
            Action::GetProc => self.get_proc().await,
            Action::WaitForJob => self.wait_for_job().await,
            Action::GetExec => self.get_exec().await,
            Action::SpawnAll => self.spawn_all(),
            Action::SuperviseAll => self.supervise_all().await,
            Action::TestConnection => self.test_connection().await,
            Action::PeriodicCkptAll => self.periodic_ckpt_all(),
            Action::SuspCkptTimer => self.susp_ckpt_timer(),
            Action::SuspAll => self.susp_all().await,
            Action::ResumeAll => self.resume_all(),
            Action::Reaper => self.reaper(),
            Action::ProcExit => self.proc_exit(),
            Action::MakeRunnable => self.make_runnable(),
            Action::SendCore => self.send_core().await,
            Action::DisposeOne => self.dispose_one().await,
            Action::DisposeAll => self.dispose_all().await,
            Action::TerminateAll => self.terminate_all().await,
            Action::AsynchWait => self.asynch_wait().await,
            Action::ReqVacate => self.req_vacate(),
            Action::ReqDie => self.req_die(),
            Action::Cleanup => self.cleanup(),
        }
    }
}

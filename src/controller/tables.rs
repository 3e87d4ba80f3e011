//! The job-lifecycle graph.

use std::fmt;

use nix::sys::signal::Signal;

use crate::state_machine::{Event, StateMachine, StateSpec, Target, TransitionSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StarterState {
    Start,
    GetProc,
    WaitForJob,
    GetExec,
    Supervise,
    ProcExit,
    SendCore,
    Suspend,
    Terminate,
    WaitForExit,
    SendStatusAll,
    End,
}

impl StarterState {
    pub fn name(self) -> &'static str {
        match self {
            StarterState::Start => "START",
            StarterState::GetProc => "GET_PROC",
            StarterState::WaitForJob => "WAIT_FOR_JOB",
            StarterState::GetExec => "GET_EXEC",
            StarterState::Supervise => "SUPERVISE",
            StarterState::ProcExit => "PROC_EXIT",
            StarterState::SendCore => "SEND_CORE",
            StarterState::Suspend => "SUSPEND",
            StarterState::Terminate => "TERMINATE",
            StarterState::WaitForExit => "WAIT_FOR_EXIT",
            StarterState::SendStatusAll => "SEND_STATUS_ALL",
            StarterState::End => "END",
        }
    }
}

impl fmt::Display for StarterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Every routine a state or a transition can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Init,
    GetProc,
    WaitForJob,
    GetExec,
    SpawnAll,
    SuperviseAll,
    TestConnection,
    PeriodicCkptAll,
    SuspCkptTimer,
    SuspAll,
    ResumeAll,
    Reaper,
    ProcExit,
    MakeRunnable,
    SendCore,
    DisposeOne,
    DisposeAll,
    TerminateAll,
    AsynchWait,
    ReqVacate,
    ReqDie,
    Cleanup,
}

impl Action {
    pub fn name(self) -> &'static str {
        match self {
            Action::Init => "init",
            Action::GetProc => "get_proc",
            Action::WaitForJob => "wait_for_job",
            Action::GetExec => "get_exec",
            Action::SpawnAll => "spawn_all",
            Action::SuperviseAll => "supervise_all",
            Action::TestConnection => "test_connection",
            Action::PeriodicCkptAll => "periodic_ckpt_all",
            Action::SuspCkptTimer => "susp_ckpt_timer",
            Action::SuspAll => "susp_all",
            Action::ResumeAll => "resume_all",
            Action::Reaper => "reaper",
            Action::ProcExit => "proc_exit",
            Action::MakeRunnable => "make_runnable",
            Action::SendCore => "send_core",
            Action::DisposeOne => "dispose_one",
            Action::DisposeAll => "dispose_all",
            Action::TerminateAll => "terminate_all",
            Action::AsynchWait => "asynch_wait",
            Action::ReqVacate => "req_vacate",
            Action::ReqDie => "req_die",
            Action::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Signals the starter reacts to.
pub const ASYNC_SIGNALS: [Signal; 8] = [
    Signal::SIGHUP,
    Signal::SIGUSR1,
    Signal::SIGCONT,
    Signal::SIGTSTP,
    Signal::SIGALRM,
    Signal::SIGINT,
    Signal::SIGCHLD,
    Signal::SIGUSR2,
];

const fn state(id: StarterState, action: Option<Action>) -> StateSpec<StarterState, Action> {
    StateSpec { id, action }
}

const fn go(
    from: StarterState,
    event: Event,
    to: StarterState,
    action: Option<Action>,
) -> TransitionSpec<StarterState, Action> {
    TransitionSpec {
        from,
        event,
        to: Target::Enter(to),
        action,
    }
}

const fn stay(
    from: StarterState,
    event: Event,
    action: Option<Action>,
) -> TransitionSpec<StarterState, Action> {
    TransitionSpec {
        from,
        event,
        to: Target::Resume,
        action,
    }
}

use Action as A;
use StarterState as S;

pub static STATES: [StateSpec<StarterState, Action>; 12] = [
    state(S::Start, Some(A::Init)),
    state(S::GetProc, Some(A::GetProc)),
    state(S::WaitForJob, Some(A::WaitForJob)),
    state(S::GetExec, Some(A::GetExec)),
    state(S::Supervise, Some(A::SuperviseAll)),
    state(S::ProcExit, Some(A::ProcExit)),
    state(S::SendCore, Some(A::SendCore)),
    state(S::Suspend, Some(A::SuspAll)),
    state(S::Terminate, Some(A::TerminateAll)),
    state(S::WaitForExit, Some(A::AsynchWait)),
    state(S::SendStatusAll, Some(A::DisposeAll)),
    state(S::End, None),
];

pub static TRANSITIONS: [TransitionSpec<StarterState, Action>; 36] = [
    go(S::Start, Event::Default, S::GetProc, None),
    go(S::GetProc, Event::Success, S::GetExec, None),
    go(S::GetProc, Event::TryLater, S::WaitForJob, None),
    go(S::GetProc, Event::NoNewProc, S::Supervise, None),
    go(S::GetProc, Event::Vacate, S::Terminate, Some(A::ReqVacate)),
    go(S::GetProc, Event::Die, S::Terminate, Some(A::ReqDie)),
    go(S::WaitForJob, Event::GetNewProc, S::GetProc, None),
    go(S::WaitForJob, Event::Alarm, S::GetProc, None),
    go(S::WaitForJob, Event::Vacate, S::Terminate, Some(A::ReqVacate)),
    go(S::WaitForJob, Event::Die, S::Terminate, Some(A::ReqDie)),
    go(S::GetExec, Event::Success, S::Supervise, Some(A::SpawnAll)),
    go(S::GetExec, Event::Failure, S::Supervise, Some(A::DisposeOne)),
    go(S::GetExec, Event::Vacate, S::Terminate, Some(A::ReqVacate)),
    go(S::GetExec, Event::Die, S::Terminate, Some(A::ReqDie)),
    go(S::Supervise, Event::ProcExited, S::ProcExit, None),
    go(S::Supervise, Event::ChildExit, S::ProcExit, Some(A::Reaper)),
    stay(S::Supervise, Event::Alarm, Some(A::TestConnection)),
    stay(S::Supervise, Event::Ckpt, Some(A::PeriodicCkptAll)),
    go(S::Supervise, Event::Suspend, S::Suspend, Some(A::SuspCkptTimer)),
    go(S::Supervise, Event::GetNewProc, S::GetProc, None),
    go(S::Supervise, Event::Vacate, S::Terminate, Some(A::ReqVacate)),
    go(S::Supervise, Event::Die, S::Terminate, Some(A::ReqDie)),
    go(S::ProcExit, Event::CkptExit, S::Supervise, Some(A::MakeRunnable)),
    go(S::ProcExit, Event::HasCore, S::SendCore, None),
    go(S::ProcExit, Event::NoCore, S::Supervise, Some(A::DisposeOne)),
    go(S::SendCore, Event::Default, S::Supervise, Some(A::DisposeOne)),
    go(S::Suspend, Event::Continue, S::Supervise, Some(A::ResumeAll)),
    go(S::Suspend, Event::Vacate, S::Terminate, Some(A::ReqVacate)),
    go(S::Suspend, Event::Die, S::Terminate, Some(A::ReqDie)),
    go(S::Terminate, Event::DoWait, S::WaitForExit, None),
    go(S::Terminate, Event::Default, S::SendStatusAll, None),
    go(S::WaitForExit, Event::ChildExit, S::Terminate, Some(A::Reaper)),
    go(S::WaitForExit, Event::Alarm, S::End, Some(A::Cleanup)),
    stay(S::WaitForExit, Event::Die, Some(A::ReqDie)),
    stay(S::WaitForExit, Event::Vacate, None),
    go(S::SendStatusAll, Event::Default, S::End, None),
];

/// The starter's machine, ready to run.
pub fn build_machine() -> StateMachine<StarterState, Action> {
    let mut machine = StateMachine::new(
        &STATES,
        &TRANSITIONS,
        &ASYNC_SIGNALS,
        StarterState::Start,
        StarterState::End,
    );
    // The keep-alive fires every few minutes for as long as a job runs.
    machine.set_silent(StarterState::Supervise, Event::Alarm);
    machine
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::state_machine::{EventSet, SIGNAL_MAP};

    #[test]
    fn every_transition_connects_known_states() {
        let known: HashSet<StarterState> = STATES.iter().map(|s| s.id).collect();
        assert_eq!(known.len(), STATES.len());
        for t in &TRANSITIONS {
            assert!(known.contains(&t.from), "unknown source {}", t.from);
            if let Target::Enter(to) = t.to {
                assert!(known.contains(&to), "unknown target {to}");
            }
        }
    }

    #[test]
    fn transitions_are_unique_and_cover_every_state() {
        let mut seen = HashSet::new();
        for t in &TRANSITIONS {
            assert!(seen.insert((t.from, t.event)), "duplicate {} on {}", t.from, t.event);
        }
        for s in STATES.iter().filter(|s| s.id != StarterState::End) {
            assert!(
                TRANSITIONS.iter().any(|t| t.from == s.id),
                "{} has no way out",
                s.id
            );
        }
    }

    #[test]
    fn async_signals_match_the_signal_map() {
        assert_eq!(ASYNC_SIGNALS, SIGNAL_MAP.map(|(signal, _)| signal));
    }

    #[test]
    fn every_signal_maps_to_an_event() {
        let machine = build_machine();
        assert_eq!(machine.async_events(), EventSet::all());
        assert_eq!(machine.current(), StarterState::Start);
    }

    #[test]
    fn allowed_events_follow_the_table() {
        let machine = build_machine();
        let supervise = machine.allowed_events(StarterState::Supervise);
        for event in [
            Event::ChildExit,
            Event::Alarm,
            Event::Ckpt,
            Event::Suspend,
            Event::GetNewProc,
            Event::Vacate,
            Event::Die,
        ] {
            assert!(supervise.contains(event), "{event}");
        }
        assert!(!supervise.contains(Event::Continue));

        // Synchronous states take no interruptions.
        assert!(machine.allowed_events(StarterState::ProcExit).is_empty());
        assert!(machine.allowed_events(StarterState::Terminate).is_empty());
    }

    #[test]
    fn dot_lists_states_and_edges() {
        let mut out = Vec::new();
        build_machine().dot_print(&mut out).unwrap();
        let dot = String::from_utf8(out).unwrap();
        assert!(dot.starts_with("digraph starter {"));
        assert!(dot.contains("\"WAIT_FOR_EXIT\";"));
        assert!(dot.contains(
            "\"SUPERVISE\" -> \"PROC_EXIT\" [label=\"CHILD_EXIT(reaper)\", color=red];"
        ));
        assert!(dot.contains("\"GET_EXEC\" -> \"SUPERVISE\" [label=\"SUCCESS(spawn_all)\", color=black];"));
        assert_eq!(dot.matches("->").count(), TRANSITIONS.len());
    }
}

//! Event vocabulary shared by the engine, the event handler and the job
//! controller.
//!
//! Asynchronous events arrive from outside the running action (an OS signal
//! or an expired alarm). Synchronous events are the results returned by
//! actions. Both live in one enum so a transition table can be keyed on
//! either; [`SIGNAL_MAP`] is the only place a signal number is tied to an
//! event.

use std::fmt;

use nix::sys::signal::Signal;

/// Every event the starter's machines can dispatch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// A new job assignment is available (SIGHUP).
    GetNewProc,
    /// Suspend the job and ourself (SIGUSR1).
    Suspend,
    /// Resume the job and ourself (SIGCONT).
    Continue,
    /// Terminate the job, a final checkpoint may be uploaded (SIGTSTP).
    Vacate,
    /// Keep-alive or timeout alarm (SIGALRM).
    Alarm,
    /// Terminate the job without a checkpoint (SIGINT).
    Die,
    /// Some child process changed state (SIGCHLD).
    ChildExit,
    /// Checkpoint in place without exiting (SIGUSR2).
    Ckpt,

    Default,
    Success,
    Failure,
    TryLater,
    /// Intake found nothing new while jobs are already running.
    NoNewProc,
    DoWait,
    ProcExited,
    CkptExit,
    HasCore,
    NoCore,
    NoEvent,
    /// Returned by a transition action to swallow the delivery that ran it.
    Abort,
}

/// The explicit signal to event table.
pub const SIGNAL_MAP: [(Signal, Event); 8] = [
    (Signal::SIGHUP, Event::GetNewProc),
    (Signal::SIGUSR1, Event::Suspend),
    (Signal::SIGCONT, Event::Continue),
    (Signal::SIGTSTP, Event::Vacate),
    (Signal::SIGALRM, Event::Alarm),
    (Signal::SIGINT, Event::Die),
    (Signal::SIGCHLD, Event::ChildExit),
    (Signal::SIGUSR2, Event::Ckpt),
];

impl Event {
    /// All asynchronous events, in delivery priority order.
    pub const ASYNC: [Event; 8] = [
        Event::GetNewProc,
        Event::Suspend,
        Event::Continue,
        Event::Vacate,
        Event::Alarm,
        Event::Die,
        Event::ChildExit,
        Event::Ckpt,
    ];

    fn async_index(self) -> Option<u32> {
        Event::ASYNC
            .iter()
            .position(|e| *e == self)
            .map(|i| i as u32)
    }

    pub fn is_async(self) -> bool {
        self.async_index().is_some()
    }

    pub fn from_signal(signal: Signal) -> Option<Event> {
        SIGNAL_MAP
            .iter()
            .find(|(s, _)| *s == signal)
            .map(|(_, e)| *e)
    }

    pub fn signal(self) -> Option<Signal> {
        SIGNAL_MAP
            .iter()
            .find(|(_, e)| *e == self)
            .map(|(s, _)| *s)
    }

    pub fn name(self) -> &'static str {
        match self {
            Event::GetNewProc => "GET_NEW_PROC",
            Event::Suspend => "SUSPEND",
            Event::Continue => "CONTINUE",
            Event::Vacate => "VACATE",
            Event::Alarm => "ALARM",
            Event::Die => "DIE",
            Event::ChildExit => "CHILD_EXIT",
            Event::Ckpt => "CKPT",
            Event::Default => "DEFAULT",
            Event::Success => "SUCCESS",
            Event::Failure => "FAILURE",
            Event::TryLater => "TRY_LATER",
            Event::NoNewProc => "NO_NEW_PROC",
            Event::DoWait => "DO_WAIT",
            Event::ProcExited => "PROC_EXITED",
            Event::CkptExit => "CKPT_EXIT",
            Event::HasCore => "HAS_CORE",
            Event::NoCore => "NO_CORE",
            Event::NoEvent => "NO_EVENT",
            Event::Abort => "ABORT",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of asynchronous events. Synchronous events are never members.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSet(u16);

impl EventSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    #[cfg(test)]
    pub(crate) fn all() -> Self {
        Event::ASYNC.into_iter().collect()
    }

    /// Adds `event`; returns `false` if it is not an asynchronous event.
    pub fn insert(&mut self, event: Event) -> bool {
        match event.async_index() {
            Some(i) => {
                self.0 |= 1 << i;
                true
            }
            None => false,
        }
    }

    /// Removes `event`, returning whether it was present.
    pub fn remove(&mut self, event: Event) -> bool {
        let present = self.contains(event);
        if let Some(i) = event.async_index() {
            self.0 &= !(1 << i);
        }
        present
    }

    pub fn contains(&self, event: Event) -> bool {
        event
            .async_index()
            .is_some_and(|i| self.0 & (1 << i) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn union(self, other: EventSet) -> EventSet {
        EventSet(self.0 | other.0)
    }

    pub fn intersection(self, other: EventSet) -> EventSet {
        EventSet(self.0 & other.0)
    }

    pub fn difference(self, other: EventSet) -> EventSet {
        EventSet(self.0 & !other.0)
    }

    /// Members in [`Event::ASYNC`] order.
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        Event::ASYNC.into_iter().filter(|e| self.contains(*e))
    }
}

impl FromIterator<Event> for EventSet {
    fn from_iter<I: IntoIterator<Item = Event>>(iter: I) -> Self {
        let mut set = EventSet::empty();
        for event in iter {
            set.insert(event);
        }
        set
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(Event::name)).finish()
    }
}

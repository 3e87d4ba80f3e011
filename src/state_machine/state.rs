use std::fmt::{self, Display};
use std::io::{self, Write};
use std::pin::pin;

use nix::sys::signal::Signal;
use tracing::{debug, info};

use super::event::{Event, EventSet};
use super::handler::EventHandler;
use crate::error::{Result, StarterError};

/// Where a transition leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<S> {
    /// Stay in the current state and carry on with whatever was running.
    Resume,
    /// Leave for another state, abandoning the running action.
    Enter(S),
}

/// One row of a state table.
#[derive(Debug)]
pub struct StateSpec<S, A> {
    pub id: S,
    pub action: Option<A>,
}

/// One row of a transition table.
#[derive(Debug)]
pub struct TransitionSpec<S, A> {
    pub from: S,
    pub event: Event,
    pub to: Target<S>,
    pub action: Option<A>,
}

/// Runs the actions named in a machine's tables.
///
/// Both state actions and transition actions go through `invoke`. A state
/// action may be suspended at an `.await` while a transition action runs, so
/// implementations must not hold a `RefCell` borrow across an `.await`.
#[allow(async_fn_in_trait)]
pub trait Dispatch {
    type Action: Copy + Display;

    async fn invoke(&self, action: Self::Action) -> Result<Event>;
}

/// How a state's action ended.
enum Step<S> {
    /// The action returned this event.
    Completed(Event),
    /// An asynchronous event moved the machine to another state.
    Entered { to: S, silent: bool },
}

/// A table-driven state machine whose running action can be interrupted by
/// asynchronous events.
pub struct StateMachine<S: 'static, A: 'static> {
    states: &'static [StateSpec<S, A>],
    transitions: &'static [TransitionSpec<S, A>],
    global: EventSet,
    allowed: Vec<(S, EventSet)>,
    silent: Vec<(S, Event)>,
    start: S,
    end: S,
    current: S,
    history: Vec<S>,
}

impl<S, A> StateMachine<S, A>
where
    S: Copy + Eq + Display + 'static,
    A: Copy + Display + 'static,
{
    /// Builds a machine over the given tables. `signals` names the OS signals
    /// whose events make up the asynchronous set; signals without an event
    /// mapping are ignored.
    pub fn new(
        states: &'static [StateSpec<S, A>],
        transitions: &'static [TransitionSpec<S, A>],
        signals: &[Signal],
        start: S,
        end: S,
    ) -> Self {
        let global: EventSet = signals.iter().filter_map(|s| Event::from_signal(*s)).collect();
        let allowed = states
            .iter()
            .map(|state| {
                let events: EventSet = transitions
                    .iter()
                    .filter(|t| t.from == state.id)
                    .map(|t| t.event)
                    .collect();
                (state.id, events.intersection(global))
            })
            .collect();

        Self {
            states,
            transitions,
            global,
            allowed,
            silent: Vec::new(),
            start,
            end,
            current: start,
            history: Vec::new(),
        }
    }

    /// The asynchronous events this machine reacts to.
    pub fn async_events(&self) -> EventSet {
        self.global
    }

    /// Asynchronous events accepted while `state`'s action runs.
    pub fn allowed_events(&self, state: S) -> EventSet {
        self.allowed
            .iter()
            .find(|(id, _)| *id == state)
            .map(|(_, events)| *events)
            .unwrap_or_default()
    }

    pub fn current(&self) -> S {
        self.current
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> &[S] {
        &self.history
    }

    /// Do not log the transition out of `state` on `event`, nor the entry it
    /// leads to.
    pub fn set_silent(&mut self, state: S, event: Event) {
        if !self.is_silent(state, event) {
            self.silent.push((state, event));
        }
    }

    fn is_silent(&self, state: S, event: Event) -> bool {
        self.silent.contains(&(state, event))
    }

    fn state(&self, id: S) -> Result<&'static StateSpec<S, A>> {
        let states = self.states;
        states
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| StarterError::NoState(id.to_string()))
    }

    fn transition(&self, from: S, event: Event) -> Result<&'static TransitionSpec<S, A>> {
        let transitions = self.transitions;
        transitions
            .iter()
            .find(|t| t.from == from && t.event == event)
            .ok_or_else(|| StarterError::NoTransition {
                state: from.to_string(),
                event: event.to_string(),
            })
    }

    fn log_transition(&self, transition: &TransitionSpec<S, A>) {
        if self.is_silent(transition.from, transition.event) {
            return;
        }
        let to = match transition.to {
            Target::Resume => "(resume)".to_string(),
            Target::Enter(s) => s.to_string(),
        };
        match transition.action {
            Some(action) => debug!(
                from = %transition.from, event = %transition.event, %to, %action,
                "transition"
            ),
            None => debug!(from = %transition.from, event = %transition.event, %to, "transition"),
        }
    }

    /// Runs the machine from the start state until it reaches the end state.
    /// Any error is fatal to the machine.
    pub async fn execute<C>(&mut self, ctx: &C, handler: &mut EventHandler) -> Result<()>
    where
        C: Dispatch<Action = A>,
    {
        self.current = self.start;
        let mut announce = true;

        while self.current != self.end {
            if announce {
                info!(state = %self.current, "entering state");
            }
            self.history.push(self.current);

            let step = loop {
                let step = self.run_state(ctx, handler).await?;
                let Step::Completed(event) = step else {
                    break step;
                };

                let transition = self.transition(self.current, event)?;
                self.log_transition(transition);
                if let Some(action) = transition.action {
                    ctx.invoke(action).await?;
                }
                match transition.to {
                    // Run the same state's action again, without re-entering.
                    Target::Resume => continue,
                    Target::Enter(to) => {
                        break Step::Entered {
                            to,
                            silent: self.is_silent(self.current, event),
                        };
                    }
                }
            };

            if let Step::Entered { to, silent } = step {
                self.current = to;
                announce = !silent;
            }
        }

        self.history.push(self.end);
        info!(state = %self.end, "state machine finished");
        Ok(())
    }

    /// Runs the current state's action with its events allowed.
    async fn run_state<C>(&self, ctx: &C, handler: &mut EventHandler) -> Result<Step<S>>
    where
        C: Dispatch<Action = A>,
    {
        let state = self.state(self.current)?;
        let Some(action) = state.action else {
            return Ok(Step::Completed(Event::Default));
        };

        let allowed = self.allowed_events(self.current);
        handler.allow_events(allowed)?;
        let step = self.drive(ctx, handler, action).await;
        handler.block_events(allowed)?;
        step
    }

    /// Polls `action` to completion, handling every allowed event delivered
    /// meanwhile. Returning early drops the action future.
    async fn drive<C>(&self, ctx: &C, handler: &mut EventHandler, action: A) -> Result<Step<S>>
    where
        C: Dispatch<Action = A>,
    {
        let mut running = pin!(ctx.invoke(action));

        loop {
            tokio::select! {
                biased;

                result = &mut running => return Ok(Step::Completed(result?)),

                event = handler.next_event() => {
                    let transition = self.transition(self.current, event)?;
                    if let Some(hook) = transition.action
                        && ctx.invoke(hook).await? == Event::Abort
                    {
                        debug!(state = %self.current, %event, action = %hook, "delivery swallowed");
                        continue;
                    }
                    self.log_transition(transition);
                    match transition.to {
                        Target::Resume => continue,
                        Target::Enter(to) => {
                            return Ok(Step::Entered {
                                to,
                                silent: self.is_silent(self.current, event),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Writes the machine as a Graphviz digraph.
    pub fn dot_print<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "digraph starter {{")?;
        writeln!(out, "    size = \"7.5,10\";")?;
        for state in self.states {
            writeln!(out, "    \"{}\";", state.id)?;
        }
        for t in self.transitions {
            let label = match t.action {
                Some(action) => format!("{}({action})", t.event),
                None => t.event.to_string(),
            };
            let color = if t.event.is_async() { "red" } else { "black" };
            match t.to {
                Target::Enter(to) => writeln!(
                    out,
                    "    \"{}\" -> \"{to}\" [label=\"{label}\", color={color}];",
                    t.from
                )?,
                Target::Resume => writeln!(
                    out,
                    "    \"{0}\" -> \"{0}\" [label=\"{label}\", color={color}, style=dashed];",
                    t.from
                )?,
            }
        }
        writeln!(out, "}}")
    }
}

impl<S: Display + 'static, A: 'static> fmt::Debug for StateMachine<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current.to_string())
            .field("states", &self.states.len())
            .field("transitions", &self.transitions.len())
            .field("async_events", &self.global)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Toy {
        Work,
        Idle,
        Other,
        Done,
    }

    impl Display for Toy {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let name = match self {
                Toy::Work => "WORK",
                Toy::Idle => "IDLE",
                Toy::Other => "OTHER",
                Toy::Done => "DONE",
            };
            f.write_str(name)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Op {
        Slow,
        Mark,
        Swallow,
        Fail,
        Rest,
    }

    impl Display for Op {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let name = match self {
                Op::Slow => "slow",
                Op::Mark => "mark",
                Op::Swallow => "swallow",
                Op::Fail => "fail",
                Op::Rest => "rest",
            };
            f.write_str(name)
        }
    }

    #[derive(Default)]
    struct Toybox {
        log: RefCell<Vec<&'static str>>,
        slow_runs: Cell<u32>,
    }

    impl Toybox {
        fn log(&self) -> Vec<&'static str> {
            self.log.borrow().clone()
        }
    }

    impl Dispatch for Toybox {
        type Action = Op;

        async fn invoke(&self, action: Op) -> Result<Event> {
            match action {
                Op::Slow => {
                    self.slow_runs.set(self.slow_runs.get() + 1);
                    self.log.borrow_mut().push("slow-start");
                    for _ in 0..10 {
                        sleep(Duration::from_millis(10)).await;
                    }
                    self.log.borrow_mut().push("slow-done");
                    Ok(Event::Success)
                }
                Op::Mark => {
                    self.log.borrow_mut().push("mark");
                    Ok(Event::NoEvent)
                }
                Op::Swallow => {
                    self.log.borrow_mut().push("swallow");
                    Ok(Event::Abort)
                }
                Op::Fail => Ok(Event::Failure),
                Op::Rest => {
                    std::future::pending::<()>().await;
                    Ok(Event::NoEvent)
                }
            }
        }
    }

    const SIGNALS: [Signal; 4] = [
        Signal::SIGUSR2,
        Signal::SIGINT,
        Signal::SIGTSTP,
        Signal::SIGHUP,
    ];

    static STATES: [StateSpec<Toy, Op>; 4] = [
        StateSpec { id: Toy::Work, action: Some(Op::Slow) },
        StateSpec { id: Toy::Idle, action: Some(Op::Rest) },
        StateSpec { id: Toy::Other, action: None },
        StateSpec { id: Toy::Done, action: None },
    ];

    static TRANSITIONS: [TransitionSpec<Toy, Op>; 7] = [
        TransitionSpec { from: Toy::Work, event: Event::Success, to: Target::Enter(Toy::Idle), action: None },
        TransitionSpec { from: Toy::Work, event: Event::Ckpt, to: Target::Resume, action: Some(Op::Mark) },
        TransitionSpec { from: Toy::Work, event: Event::Vacate, to: Target::Enter(Toy::Other), action: Some(Op::Swallow) },
        TransitionSpec { from: Toy::Work, event: Event::Die, to: Target::Enter(Toy::Other), action: None },
        TransitionSpec { from: Toy::Idle, event: Event::Die, to: Target::Enter(Toy::Done), action: None },
        TransitionSpec { from: Toy::Idle, event: Event::GetNewProc, to: Target::Enter(Toy::Work), action: None },
        TransitionSpec { from: Toy::Other, event: Event::Default, to: Target::Enter(Toy::Done), action: None },
    ];

    fn machine() -> StateMachine<Toy, Op> {
        StateMachine::new(&STATES, &TRANSITIONS, &SIGNALS, Toy::Work, Toy::Done)
    }

    fn handler_for(machine: &StateMachine<Toy, Op>) -> EventHandler {
        let mut handler = EventHandler::new(machine.async_events());
        handler.install_without_signals();
        handler
    }

    #[test]
    fn allowed_sets_come_from_async_transitions() {
        let m = machine();
        let work: Vec<_> = m.allowed_events(Toy::Work).iter().collect();
        assert_eq!(work, vec![Event::Vacate, Event::Die, Event::Ckpt]);
        let idle: Vec<_> = m.allowed_events(Toy::Idle).iter().collect();
        assert_eq!(idle, vec![Event::GetNewProc, Event::Die]);
        assert!(m.allowed_events(Toy::Other).is_empty());
    }

    #[test]
    fn events_without_a_mapped_signal_are_outside_the_global_set() {
        let m = StateMachine::new(&STATES, &TRANSITIONS, &[Signal::SIGINT], Toy::Work, Toy::Done);
        assert_eq!(m.async_events().iter().collect::<Vec<_>>(), vec![Event::Die]);
        // Ckpt has a transition from WORK but its signal was not listed.
        assert!(!m.allowed_events(Toy::Work).contains(Event::Ckpt));
    }

    #[tokio::test(start_paused = true)]
    async fn resume_keeps_the_running_action() {
        let mut m = machine();
        let mut handler = handler_for(&m);
        let tx = handler.injector();
        let ctx = Toybox::default();

        let driver = async {
            sleep(Duration::from_millis(35)).await;
            tx.send(Event::Ckpt).unwrap();
            sleep(Duration::from_millis(200)).await;
            tx.send(Event::Die).unwrap();
        };
        let (result, ()) = tokio::join!(m.execute(&ctx, &mut handler), driver);

        result.unwrap();
        assert_eq!(ctx.slow_runs.get(), 1);
        assert_eq!(ctx.log(), vec!["slow-start", "mark", "slow-done"]);
        assert_eq!(m.history(), &[Toy::Work, Toy::Idle, Toy::Done]);
    }

    #[tokio::test(start_paused = true)]
    async fn enter_abandons_the_running_action() {
        let mut m = machine();
        let mut handler = handler_for(&m);
        let tx = handler.injector();
        let ctx = Toybox::default();

        let driver = async {
            sleep(Duration::from_millis(35)).await;
            tx.send(Event::Die).unwrap();
        };
        let (result, ()) = tokio::join!(m.execute(&ctx, &mut handler), driver);

        result.unwrap();
        assert_eq!(ctx.log(), vec!["slow-start"]);
        assert_eq!(m.history(), &[Toy::Work, Toy::Other, Toy::Done]);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_from_a_transition_action_swallows_the_delivery() {
        let mut m = machine();
        let mut handler = handler_for(&m);
        let tx = handler.injector();
        let ctx = Toybox::default();

        let driver = async {
            sleep(Duration::from_millis(35)).await;
            tx.send(Event::Vacate).unwrap();
            sleep(Duration::from_millis(200)).await;
            tx.send(Event::Die).unwrap();
        };
        let (result, ()) = tokio::join!(m.execute(&ctx, &mut handler), driver);

        result.unwrap();
        assert_eq!(ctx.log(), vec!["slow-start", "swallow", "slow-done"]);
        assert_eq!(m.history(), &[Toy::Work, Toy::Idle, Toy::Done]);
    }

    #[tokio::test(start_paused = true)]
    async fn events_blocked_in_one_state_are_delivered_in_the_next() {
        let mut m = machine();
        let mut handler = handler_for(&m);
        // GET_NEW_PROC is not accepted in WORK; it waits for IDLE.
        handler.injector().send(Event::GetNewProc).unwrap();
        let tx = handler.injector();
        let ctx = Toybox::default();

        let driver = async {
            sleep(Duration::from_millis(500)).await;
            tx.send(Event::Die).unwrap();
        };
        let (result, ()) = tokio::join!(m.execute(&ctx, &mut handler), driver);

        result.unwrap();
        assert_eq!(ctx.slow_runs.get(), 2);
        assert_eq!(
            m.history(),
            &[Toy::Work, Toy::Idle, Toy::Work, Toy::Idle, Toy::Done]
        );
    }

    #[tokio::test]
    async fn missing_transition_is_fatal() {
        static STATES: [StateSpec<Toy, Op>; 2] = [
            StateSpec { id: Toy::Work, action: Some(Op::Fail) },
            StateSpec { id: Toy::Done, action: None },
        ];
        static TRANSITIONS: [TransitionSpec<Toy, Op>; 1] = [TransitionSpec {
            from: Toy::Work,
            event: Event::Success,
            to: Target::Enter(Toy::Done),
            action: None,
        }];

        let mut m = StateMachine::new(&STATES, &TRANSITIONS, &SIGNALS, Toy::Work, Toy::Done);
        let mut handler = handler_for(&m);
        let err = m.execute(&Toybox::default(), &mut handler).await.unwrap_err();
        assert!(matches!(
            err,
            StarterError::NoTransition { ref state, ref event } if state == "WORK" && event == "FAILURE"
        ));
    }

    #[tokio::test]
    async fn missing_state_is_fatal() {
        static STATES: [StateSpec<Toy, Op>; 1] = [StateSpec { id: Toy::Done, action: None }];
        static TRANSITIONS: [TransitionSpec<Toy, Op>; 0] = [];

        let mut m = StateMachine::new(&STATES, &TRANSITIONS, &SIGNALS, Toy::Other, Toy::Done);
        let mut handler = handler_for(&m);
        let err = m.execute(&Toybox::default(), &mut handler).await.unwrap_err();
        assert!(matches!(err, StarterError::NoState(ref s) if s == "OTHER"));
    }

    #[tokio::test]
    async fn running_an_action_requires_an_installed_handler() {
        let mut m = machine();
        let mut handler = EventHandler::new(m.async_events());
        let err = m.execute(&Toybox::default(), &mut handler).await.unwrap_err();
        assert!(matches!(err, StarterError::Handler(_)));
    }

    #[test]
    fn set_silent_is_idempotent() {
        let mut m = machine();
        m.set_silent(Toy::Work, Event::Ckpt);
        m.set_silent(Toy::Work, Event::Ckpt);
        assert_eq!(m.silent.len(), 1);
        assert!(m.is_silent(Toy::Work, Event::Ckpt));
        assert!(!m.is_silent(Toy::Work, Event::Die));
    }

    #[test]
    fn dot_output_marks_async_and_resume_edges() {
        let mut out = Vec::new();
        machine().dot_print(&mut out).unwrap();
        let dot = String::from_utf8(out).unwrap();

        assert!(dot.starts_with("digraph starter {"));
        assert!(dot.contains("\"WORK\" -> \"IDLE\" [label=\"SUCCESS\", color=black];"));
        assert!(dot.contains(
            "\"WORK\" -> \"WORK\" [label=\"CKPT(mark)\", color=red, style=dashed];"
        ));
        assert!(dot.contains("\"WORK\" -> \"OTHER\" [label=\"VACATE(swallow)\", color=red];"));
        assert!(dot.trim_end().ends_with('}'));
    }
}

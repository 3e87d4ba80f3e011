mod event;
mod handler;
mod state;
mod timer;

pub use event::Event;
#[cfg(test)]
pub use event::{EventSet, SIGNAL_MAP};
pub use handler::EventHandler;
pub use state::{Dispatch, StateMachine, StateSpec, Target, TransitionSpec};
pub use timer::{Alarm, BackoffTimer};

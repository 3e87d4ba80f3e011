//! Alarms and the exponential backoff timer.
//!
//! An [`Alarm`] owns one deadline at a time. The deadline lives in an
//! [`AlarmSlot`] that the event handler watches; when it passes, the handler
//! clears the slot and queues the event the slot was registered with.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::Instant;

/// Shared view of an alarm's deadline.
#[derive(Clone, Default)]
pub struct AlarmSlot(Rc<SlotInner>);

#[derive(Default)]
struct SlotInner {
    deadline: Cell<Option<Instant>>,
    rearmed: Notify,
}

impl AlarmSlot {
    pub fn deadline(&self) -> Option<Instant> {
        self.0.deadline.get()
    }

    /// Clears the slot if its deadline is at or before `now`.
    pub fn take_expired(&self, now: Instant) -> bool {
        match self.0.deadline.get() {
            Some(deadline) if deadline <= now => {
                self.0.deadline.set(None);
                true
            }
            _ => false,
        }
    }

    /// Completes after the next time the slot is armed. An arm that happened
    /// while nobody was waiting completes the next call immediately.
    pub fn rearmed(&self) -> Notified<'_> {
        self.0.rearmed.notified()
    }

    fn arm(&self, deadline: Instant) {
        self.0.deadline.set(Some(deadline));
        self.0.rearmed.notify_one();
    }

    fn disarm(&self) -> Option<Instant> {
        self.0.deadline.take()
    }
}

impl fmt::Debug for AlarmSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AlarmSlot").field(&self.deadline()).finish()
    }
}

/// A single outstanding deadline: idle, armed, or suspended with the time
/// that was left.
#[derive(Debug, Default)]
pub struct Alarm {
    slot: AlarmSlot,
    remaining: Option<Duration>,
}

impl Alarm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self) -> AlarmSlot {
        self.slot.clone()
    }

    /// Arms the alarm `after` from now, replacing any previous deadline.
    pub fn set(&mut self, after: Duration) {
        self.remaining = None;
        self.slot.arm(Instant::now() + after);
    }

    pub fn cancel(&mut self) {
        self.slot.disarm();
        self.remaining = None;
    }

    /// Disarms and remembers the time left. No-op unless armed.
    pub fn suspend(&mut self) {
        if let Some(deadline) = self.slot.disarm() {
            self.remaining = Some(deadline.saturating_duration_since(Instant::now()));
        }
    }

    /// Re-arms with exactly the time captured by `suspend`. No-op unless
    /// suspended.
    pub fn resume(&mut self) {
        if let Some(remaining) = self.remaining.take() {
            self.slot.arm(Instant::now() + remaining);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot.deadline().is_some()
    }

    #[cfg(test)]
    pub(crate) fn is_suspended(&self) -> bool {
        self.remaining.is_some()
    }

    /// Time left before the alarm fires, or the time captured while
    /// suspended.
    pub fn remaining(&self) -> Option<Duration> {
        match self.slot.deadline() {
            Some(deadline) => Some(deadline.saturating_duration_since(Instant::now())),
            None => self.remaining,
        }
    }
}

/// Periodic timer whose interval doubles each time it is updated, up to a
/// maximum. A zero interval means disabled and stays zero.
#[derive(Debug)]
pub struct BackoffTimer {
    alarm: Alarm,
    interval: Duration,
    min: Duration,
    max: Duration,
    active: bool,
    suspended: bool,
}

impl BackoffTimer {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            alarm: Alarm::new(),
            interval: min,
            min,
            max,
            active: false,
            suspended: false,
        }
    }

    pub fn slot(&self) -> AlarmSlot {
        self.alarm.slot()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn is_disabled(&self) -> bool {
        self.interval.is_zero()
    }

    /// Arms the alarm for the current interval.
    pub fn start(&mut self) {
        if self.is_disabled() {
            return;
        }
        self.alarm.set(self.interval);
        self.active = true;
        self.suspended = false;
    }

    pub fn clear(&mut self) {
        self.alarm.cancel();
        self.active = false;
        self.suspended = false;
    }

    pub fn suspend(&mut self) {
        if self.active && !self.suspended {
            self.alarm.suspend();
            self.suspended = true;
        }
    }

    pub fn resume(&mut self) {
        if self.suspended {
            self.alarm.resume();
            self.suspended = false;
        }
    }

    /// Doubles the interval, clamped to the maximum.
    pub fn update_interval(&mut self) {
        if self.is_disabled() {
            return;
        }
        self.interval = self.interval.saturating_mul(2).min(self.max);
    }

    /// Back to the initial interval.
    pub fn reset(&mut self) {
        self.interval = self.min;
    }
}

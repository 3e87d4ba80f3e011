//! Delivery of asynchronous events.
//!
//! OS signals are read from tokio signal streams by one forwarder task per
//! signal and funnelled into a single channel. Watched alarm slots are turned
//! into events when their deadline passes. Events that are not currently
//! allowed stay pending, one per kind, until a state allows them.

use std::future::poll_fn;
use std::task::Poll;

use nix::sys::signal::{self, Signal};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::event::{Event, EventSet};
use super::timer::AlarmSlot;
use crate::error::{Result, StarterError};

pub struct EventHandler {
    global: EventSet,
    allowed: EventSet,
    pending: EventSet,
    tx: UnboundedSender<Event>,
    rx: UnboundedReceiver<Event>,
    forwarders: Option<Vec<JoinHandle<()>>>,
    alarms: Vec<(AlarmSlot, Event)>,
}

impl EventHandler {
    /// A handler for the events in `global`. Nothing is delivered until
    /// [`install`](Self::install) and [`allow_events`](Self::allow_events).
    pub fn new(global: EventSet) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            global,
            allowed: EventSet::empty(),
            pending: EventSet::empty(),
            tx,
            rx,
            forwarders: None,
            alarms: Vec::new(),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.forwarders.is_some()
    }

    /// Starts listening for every signal of the global set. Must run inside a
    /// tokio runtime.
    pub fn install(&mut self) -> Result<()> {
        if self.is_installed() {
            return Err(StarterError::Handler("already installed".into()));
        }

        let mut forwarders = Vec::new();
        for event in self.global.iter() {
            let Some(sig) = event.signal() else {
                continue;
            };
            let mut stream = match signal(SignalKind::from_raw(sig as i32)) {
                Ok(stream) => stream,
                Err(e) => {
                    forwarders.iter().for_each(JoinHandle::abort);
                    return Err(StarterError::Handler(format!("cannot watch {sig}: {e}")));
                }
            };
            let tx = self.tx.clone();
            forwarders.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }));
        }

        debug!(events = ?self.global, "event handler installed");
        self.forwarders = Some(forwarders);
        Ok(())
    }

    /// Marks the handler installed without touching OS signal dispositions.
    /// Events then only come from the injector and watched alarms.
    #[cfg(test)]
    pub(crate) fn install_without_signals(&mut self) {
        self.forwarders = Some(Vec::new());
    }

    pub fn de_install(&mut self) -> Result<()> {
        let Some(forwarders) = self.forwarders.take() else {
            return Err(StarterError::Handler("not installed".into()));
        };
        forwarders.iter().for_each(JoinHandle::abort);
        self.allowed = EventSet::empty();
        debug!("event handler removed");
        Ok(())
    }

    pub fn allow_events(&mut self, set: EventSet) -> Result<()> {
        if set.is_empty() {
            return Ok(());
        }
        self.require_installed()?;
        self.allowed = self.allowed.union(set);
        Ok(())
    }

    pub fn block_events(&mut self, set: EventSet) -> Result<()> {
        if set.is_empty() {
            return Ok(());
        }
        self.require_installed()?;
        self.allowed = self.allowed.difference(set);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> EventSet {
        self.pending
    }

    /// When the slot's deadline passes, `event` becomes pending and the slot
    /// is cleared.
    pub fn watch_alarm(&mut self, slot: AlarmSlot, event: Event) {
        self.alarms.push((slot, event));
    }

    /// A sender that delivers events as if they had been signalled.
    #[cfg(test)]
    pub(crate) fn injector(&self) -> UnboundedSender<Event> {
        self.tx.clone()
    }

    /// Sends `sig` to this process.
    pub fn raise(sig: Signal) -> Result<()> {
        signal::raise(sig).map_err(|source| StarterError::Signal {
            pid: std::process::id() as i32,
            source,
        })
    }

    /// Waits for the next pending event that is currently allowed, in
    /// [`Event::ASYNC`] order. Cancel safe: dropping the future loses nothing.
    pub async fn next_event(&mut self) -> Event {
        loop {
            while let Ok(event) = self.rx.try_recv() {
                self.post(event);
            }
            self.collect_expired();
            if let Some(event) = self.pending.intersection(self.allowed).iter().next() {
                self.pending.remove(event);
                return event;
            }

            let deadline = self
                .alarms
                .iter()
                .filter_map(|(slot, _)| slot.deadline())
                .min();
            let mut rearmed: Vec<_> = self
                .alarms
                .iter()
                .map(|(slot, _)| Box::pin(slot.rearmed()))
                .collect();
            let any_rearmed = poll_fn(move |cx| {
                if rearmed.iter_mut().any(|n| n.as_mut().poll(cx).is_ready()) {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            });

            let received = tokio::select! {
                received = self.rx.recv() => received,
                () = until(deadline) => None,
                () = any_rearmed => None,
            };
            if let Some(event) = received {
                self.post(event);
            }
        }
    }

    fn post(&mut self, event: Event) {
        if self.global.contains(event) {
            trace!(%event, "event pending");
            self.pending.insert(event);
        } else {
            debug!(%event, "ignoring event outside the asynchronous set");
        }
    }

    fn collect_expired(&mut self) {
        let now = Instant::now();
        for (slot, event) in &self.alarms {
            if slot.take_expired(now) {
                trace!(event = %event, "alarm expired");
                self.pending.insert(*event);
            }
        }
    }

    fn require_installed(&self) -> Result<()> {
        if self.is_installed() {
            Ok(())
        } else {
            Err(StarterError::Handler("not installed".into()))
        }
    }
}

impl Drop for EventHandler {
    fn drop(&mut self) {
        if let Some(forwarders) = self.forwarders.take() {
            forwarders.iter().for_each(JoinHandle::abort);
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

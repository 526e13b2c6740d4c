//! Correlation of raised events and timeouts with wait-for-event calls.
//!
//! Raised events are always appended to history, whether or not anything is waiting.
//! Which wait consumes which event is decided by a single left-to-right pass over the
//! history, so every replay of the same prefix reaches the same matching:
//!
//! - a wait opens at its `TimerCreated` record and immediately takes the oldest buffered
//!   event of the same name, if any (early delivery);
//! - a raised event goes to the oldest open wait of its name, otherwise it is buffered;
//! - a `TimerFired` for a still-open wait resolves it as timed out.
//!
//! Events that arrive after their wait timed out stay buffered for later waits.

use std::collections::{HashMap, VecDeque};

use crate::{Event, EventKind, TimerPurpose};

/// How a wait-for-event call was satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitResolution {
    /// `resolved_at` is the event id at which the match happened.
    Raised { payload: String, resolved_at: u64 },
    TimedOut { resolved_at: u64 },
}

impl WaitResolution {
    pub fn resolved_at(&self) -> u64 {
        match self {
            WaitResolution::Raised { resolved_at, .. } | WaitResolution::TimedOut { resolved_at } => *resolved_at,
        }
    }
}

/// An event raised before any wait claimed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedEvent {
    pub event_id: u64,
    pub arrival_order: u64,
    pub payload: String,
}

/// Result of correlating one history.
#[derive(Debug, Default)]
pub struct Correlation {
    resolutions: HashMap<u64, WaitResolution>,
    buffered: HashMap<String, VecDeque<BufferedEvent>>,
    open: HashMap<String, VecDeque<u64>>,
}

impl Correlation {
    pub fn resolution(&self, seq: u64) -> Option<&WaitResolution> {
        self.resolutions.get(&seq)
    }

    /// Unconsumed events named `name`, oldest first.
    pub fn unmatched(&self, name: &str) -> Vec<&BufferedEvent> {
        self.buffered.get(name).map(|q| q.iter().collect()).unwrap_or_default()
    }

    pub fn unmatched_count(&self) -> usize {
        self.buffered.values().map(VecDeque::len).sum()
    }

    /// Sequence numbers of waits that are neither matched nor timed out.
    pub fn open_waits(&self, name: &str) -> Vec<u64> {
        self.open.get(name).map(|q| q.iter().copied().collect()).unwrap_or_default()
    }
}

pub struct EventCorrelator;

impl EventCorrelator {
    pub fn correlate(history: &[Event]) -> Correlation {
        let mut c = Correlation::default();
        let mut open_names: HashMap<u64, String> = HashMap::new();

        for event in history {
            match &event.kind {
                EventKind::TimerCreated {
                    seq,
                    purpose: TimerPurpose::EventTimeout { name },
                    ..
                } => {
                    if let Some(early) = c.buffered.get_mut(name).and_then(VecDeque::pop_front) {
                        c.resolutions.insert(
                            *seq,
                            WaitResolution::Raised {
                                payload: early.payload,
                                resolved_at: event.event_id,
                            },
                        );
                    } else {
                        c.open.entry(name.clone()).or_default().push_back(*seq);
                        open_names.insert(*seq, name.clone());
                    }
                }
                EventKind::EventRaised {
                    name,
                    payload,
                    arrival_order,
                    ..
                } => {
                    if let Some(seq) = c.open.get_mut(name).and_then(VecDeque::pop_front) {
                        open_names.remove(&seq);
                        c.resolutions.insert(
                            seq,
                            WaitResolution::Raised {
                                payload: payload.clone(),
                                resolved_at: event.event_id,
                            },
                        );
                    } else {
                        c.buffered.entry(name.clone()).or_default().push_back(BufferedEvent {
                            event_id: event.event_id,
                            arrival_order: *arrival_order,
                            payload: payload.clone(),
                        });
                    }
                }
                EventKind::TimerFired { seq, .. } => {
                    if let Some(name) = open_names.remove(seq) {
                        if let Some(waits) = c.open.get_mut(&name) {
                            waits.retain(|s| s != seq);
                        }
                        c.resolutions.insert(
                            *seq,
                            WaitResolution::TimedOut {
                                resolved_at: event.event_id,
                            },
                        );
                    }
                }
                _ => {}
            }
        }
        c
    }

    /// Arrival order for the next raised event of this instance (1-based).
    pub fn next_arrival_order(history: &[Event]) -> u64 {
        history
            .iter()
            .filter(|e| matches!(e.kind, EventKind::EventRaised { .. }))
            .count() as u64
            + 1
    }

    /// Whether the raise call `raise_id` is already recorded.
    pub fn is_recorded(history: &[Event], raise_id: &str) -> bool {
        history
            .iter()
            .any(|e| matches!(&e.kind, EventKind::EventRaised { raise_id: r, .. } if r == raise_id))
    }

    /// History record for an event raised against an instance.
    pub fn raised(
        history: &[Event],
        raise_id: impl Into<String>,
        name: impl Into<String>,
        payload: impl Into<String>,
    ) -> EventKind {
        EventKind::EventRaised {
            raise_id: raise_id.into(),
            name: name.into(),
            payload: payload.into(),
            arrival_order: Self::next_arrival_order(history),
        }
    }
}

// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Observer hook for the broker and the resolver.
//!
//! Core components never reach for a global logger; they are handed an
//! [`EventSink`] and report what they did through it. The proxy wires in
//! [`TracingSink`], tests wire in [`RecordingSink`] to assert on behavior that
//! is otherwise invisible (which source answered, when the sweeper stopped).

use std::sync::{Arc, Mutex};

/// Something the broker or resolver wants to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<'a> {
    /// A `get` found no value and created the shared pending handle.
    WaitCreated { key: &'a str },
    /// A `get` attached to an already pending handle.
    WaitJoined { key: &'a str },
    /// A `get` was answered from a ready entry.
    CacheHit { key: &'a str },
    /// A waiter gave up after its own deadline.
    WaitTimedOut { key: &'a str },
    /// A `set` resolved a pending handle.
    Fulfilled { key: &'a str, waiters: usize },
    /// A `set` stored a value nobody was waiting for yet.
    Stored { key: &'a str },
    /// An entry was removed because its TTL passed.
    Expired { key: &'a str },
    /// An entry was removed to stay under the capacity bound.
    CapacityEvicted { key: &'a str },
    /// Every entry had waiters, so the table grew past `max`.
    CapacityExceeded { max: usize },
    /// No tokio runtime to spawn the sweeper on; entries will not expire.
    NoRuntime,
    SweeperStarted,
    SweeperStopped,
    /// A source in the fallback chain produced the body.
    SourceHit { source: &'a str },
    /// A source in the fallback chain could not produce a body.
    SourceMiss { source: &'a str, reason: String },
    /// A cached source answered without touching its inner fetcher.
    SlotFresh { source: &'a str },
    /// A cached source could not refresh its slot.
    SlotRefreshFailed { source: &'a str, error: String },
    /// A cached source served its last good value after a failed refresh.
    SlotServedStale { source: &'a str },
    /// Internal bookkeeping found a state that should be impossible.
    InvariantViolated { key: &'a str, detail: &'static str },
}

/// Receives [`Event`]s from core components.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event<'_>);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event<'_>) {
        match event {
            Event::WaitCreated { key } => {
                tracing::debug!(%key, "get happened before set, waiting on new handle")
            }
            Event::WaitJoined { key } => {
                tracing::debug!(%key, "get happened before set, joining pending handle")
            }
            Event::CacheHit { key } => tracing::debug!(%key, "get fulfilled from cache"),
            Event::WaitTimedOut { key } => tracing::debug!(%key, "waiter deadline elapsed"),
            Event::Fulfilled { key, waiters } => {
                tracing::debug!(%key, waiters, "set fulfilled pending handle")
            }
            Event::Stored { key } => tracing::debug!(%key, "set updated cache"),
            Event::Expired { key } => tracing::debug!(%key, "entry expired"),
            Event::CapacityEvicted { key } => {
                tracing::warn!(%key, "broker at capacity, evicted least recently touched entry")
            }
            Event::CapacityExceeded { max } => {
                tracing::warn!(max, "every broker entry has waiters, growing past capacity")
            }
            Event::NoRuntime => {
                tracing::warn!("no tokio runtime, broker entries will not expire")
            }
            Event::SweeperStarted => tracing::debug!("starting cleanup task"),
            Event::SweeperStopped => tracing::debug!("broker is empty, cleanup task exiting"),
            Event::SourceHit { source } => tracing::info!(%source, "got userscript"),
            Event::SourceMiss { source, reason } => {
                tracing::debug!(%source, %reason, "source not available")
            }
            Event::SlotFresh { source } => tracing::trace!(%source, "cached body still fresh"),
            Event::SlotRefreshFailed { source, error } => {
                tracing::debug!(%source, %error, "refresh failed")
            }
            Event::SlotServedStale { source } => {
                tracing::warn!(%source, "refresh failed, serving last known good body")
            }
            Event::InvariantViolated { key, detail } => {
                tracing::error!(%key, %detail, "broker invariant violated")
            }
        }
    }
}

/// Owned copy of an [`Event`], kept by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent {
    WaitCreated(String),
    WaitJoined(String),
    CacheHit(String),
    WaitTimedOut(String),
    Fulfilled(String, usize),
    Stored(String),
    Expired(String),
    CapacityEvicted(String),
    CapacityExceeded(usize),
    NoRuntime,
    SweeperStarted,
    SweeperStopped,
    SourceHit(String),
    SourceMiss(String),
    SlotFresh(String),
    SlotRefreshFailed(String, String),
    SlotServedStale(String),
    InvariantViolated(String),
}

impl From<Event<'_>> for RecordedEvent {
    fn from(event: Event<'_>) -> Self {
        match event {
            Event::WaitCreated { key } => Self::WaitCreated(key.to_string()),
            Event::WaitJoined { key } => Self::WaitJoined(key.to_string()),
            Event::CacheHit { key } => Self::CacheHit(key.to_string()),
            Event::WaitTimedOut { key } => Self::WaitTimedOut(key.to_string()),
            Event::Fulfilled { key, waiters } => Self::Fulfilled(key.to_string(), waiters),
            Event::Stored { key } => Self::Stored(key.to_string()),
            Event::Expired { key } => Self::Expired(key.to_string()),
            Event::CapacityEvicted { key } => Self::CapacityEvicted(key.to_string()),
            Event::CapacityExceeded { max } => Self::CapacityExceeded(max),
            Event::NoRuntime => Self::NoRuntime,
            Event::SweeperStarted => Self::SweeperStarted,
            Event::SweeperStopped => Self::SweeperStopped,
            Event::SourceHit { source } => Self::SourceHit(source.to_string()),
            Event::SourceMiss { source, .. } => Self::SourceMiss(source.to_string()),
            Event::SlotFresh { source } => Self::SlotFresh(source.to_string()),
            Event::SlotRefreshFailed { source, error } => {
                Self::SlotRefreshFailed(source.to_string(), error)
            }
            Event::SlotServedStale { source } => Self::SlotServedStale(source.to_string()),
            Event::InvariantViolated { key, .. } => Self::InvariantViolated(key.to_string()),
        }
    }
}

/// Keeps every event in memory. Meant for tests and diagnostics.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far, oldest first.
    pub fn events(&self) -> Vec<RecordedEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn contains(&self, event: &RecordedEvent) -> bool {
        self.events().iter().any(|e| e == event)
    }

    pub fn count(&self, event: &RecordedEvent) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: Event<'_>) {
        let recorded = RecordedEvent::from(event);
        match self.events.lock() {
            Ok(mut events) => events.push(recorded),
            Err(poisoned) => poisoned.into_inner().push(recorded),
        }
    }
}

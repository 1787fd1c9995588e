// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Keyed rendezvous between a captured response and a later request.
//!
//! A value may be asked for before it exists. The first `get` for a key leaves
//! a pending handle behind; later `get`s for the same key attach to it; a `set`
//! resolves it for every attached waiter at once and keeps the value around so
//! later `get`s return without waiting.
//!
//! Each waiter owns its deadline. The handle is a `watch` channel stored in the
//! table, so a waiter that gives up only drops its receiver and never takes the
//! handle away from other waiters or from the eventual `set`.
//!
//! Entries expire after a TTL that is refreshed on every access. A sweeper task
//! removes expired entries; it is started by the first access that finds it not
//! running and it stops by itself once the table is empty.

use crate::events::{Event, EventSink, TracingSink};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ENTRIES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("no value for {key} after {after:?}")]
    TimedOut { key: String, after: Duration },
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Idle time after which an entry is removed.
    pub ttl: Duration,
    /// Pause between two sweeps of the table.
    pub sweep_interval: Duration,
    /// Upper bound on the number of keys. `None` disables the bound.
    pub max_entries: Option<usize>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_entries: Some(DEFAULT_MAX_ENTRIES),
        }
    }
}

/// Observable state of a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    Empty,
    Pending { waiters: usize },
    Ready,
}

enum Slot {
    Empty,
    Pending(watch::Sender<Option<Bytes>>),
    Ready(Bytes),
}

struct Entry {
    slot: Slot,
    expires_at: Instant,
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, Entry>,
    sweeper_running: bool,
}

struct Inner {
    table: Mutex<Table>,
    config: BrokerConfig,
    events: Arc<dyn EventSink>,
}

/// Rendezvous store keyed by correlation key. Cloning shares the same table.
#[derive(Clone)]
pub struct DataBroker {
    inner: Arc<Inner>,
}

impl Default for DataBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl DataBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_events(config, Arc::new(TracingSink))
    }

    pub fn with_events(config: BrokerConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(Table::default()),
                config,
                events,
            }),
        }
    }

    /// Wait up to `timeout` for the value published under `key`.
    ///
    /// Returns at once when the value is already there. Hitting the deadline
    /// only ends this call; the pending handle stays for everyone else.
    pub async fn get(&self, key: &str, timeout: Duration) -> Result<Bytes, BrokerError> {
        let mut rx = {
            let mut table = self.inner.lock();
            let entry = self.inner.touch(&mut table, key);
            let attached = match &entry.slot {
                Slot::Ready(value) => {
                    let value = value.clone();
                    self.inner.events.emit(Event::CacheHit { key });
                    return Ok(value);
                }
                Slot::Pending(tx) => Some(tx.subscribe()),
                Slot::Empty => None,
            };
            match attached {
                Some(rx) => {
                    self.inner.events.emit(Event::WaitJoined { key });
                    rx
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    entry.slot = Slot::Pending(tx);
                    self.inner.events.emit(Event::WaitCreated { key });
                    rx
                }
            }
        };

        let wait = async move {
            loop {
                let current = rx.borrow_and_update().clone();
                if current.is_some() {
                    return current;
                }
                if rx.changed().await.is_err() {
                    // Sender gone. Attached entries are never swept or evicted,
                    // so this is only reachable after a resolve.
                    return rx.borrow().clone();
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => {
                self.inner.events.emit(Event::InvariantViolated {
                    key,
                    detail: "entry evicted while a waiter was attached",
                });
                Err(BrokerError::TimedOut {
                    key: key.to_string(),
                    after: timeout,
                })
            }
            Err(_) => {
                self.inner.events.emit(Event::WaitTimedOut { key });
                Err(BrokerError::TimedOut {
                    key: key.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// Publish `value` under `key`, waking every waiter attached to it.
    pub fn set(&self, key: &str, value: Bytes) {
        let mut table = self.inner.lock();
        let entry = self.inner.touch(&mut table, key);
        match std::mem::replace(&mut entry.slot, Slot::Ready(value.clone())) {
            Slot::Pending(tx) => {
                let already_resolved = tx.borrow().is_some();
                if already_resolved {
                    self.inner.events.emit(Event::InvariantViolated {
                        key,
                        detail: "pending handle already resolved",
                    });
                }
                debug_assert!(!already_resolved, "pending handle for {key} already resolved");
                let waiters = tx.receiver_count();
                tx.send_replace(Some(value));
                self.inner.events.emit(Event::Fulfilled { key, waiters });
            }
            Slot::Empty | Slot::Ready(_) => {
                self.inner.events.emit(Event::Stored { key });
            }
        }
    }

    pub fn state(&self, key: &str) -> Option<EntryState> {
        let table = self.inner.lock();
        table.entries.get(key).map(|entry| match &entry.slot {
            Slot::Empty => EntryState::Empty,
            Slot::Pending(tx) => EntryState::Pending {
                waiters: tx.receiver_count(),
            },
            Slot::Ready(_) => EntryState::Ready,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sweeper_running(&self) -> bool {
        self.inner.lock().sweeper_running
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Table> {
        // Every mutation completes before the guard drops; a poisoned table is
        // still consistent.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refresh the key's expiry, creating an empty entry if needed, and make
    /// sure the sweeper is running.
    fn touch<'t>(self: &Arc<Self>, table: &'t mut Table, key: &str) -> &'t mut Entry {
        let expires_at = Instant::now() + self.config.ttl;
        if !table.entries.contains_key(key) {
            self.make_room(table);
        }
        if !table.sweeper_running {
            self.start_sweeper(table);
        }
        let entry = table
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                slot: Slot::Empty,
                expires_at,
            });
        entry.expires_at = expires_at;
        entry
    }

    fn make_room(&self, table: &mut Table) {
        let Some(max) = self.config.max_entries else {
            return;
        };
        while table.entries.len() >= max {
            let victim = table
                .entries
                .iter()
                .filter(|(_, entry)| !matches!(entry.slot, Slot::Pending(_)))
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => {
                    table.entries.remove(&key);
                    self.events.emit(Event::CapacityEvicted { key: &key });
                }
                None => {
                    self.events.emit(Event::CapacityExceeded { max });
                    break;
                }
            }
        }
    }

    fn start_sweeper(self: &Arc<Self>, table: &mut Table) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                self.events.emit(Event::NoRuntime);
                return;
            }
        };
        table.sweeper_running = true;
        self.events.emit(Event::SweeperStarted);
        handle.spawn(sweep(Arc::downgrade(self)));
    }

    /// Remove expired entries. Returns false once the sweeper should exit.
    ///
    /// A pending entry outlives its TTL while any waiter is still attached;
    /// it goes on the first sweep after the last waiter leaves.
    fn sweep_once(&self) -> bool {
        let mut table = self.lock();
        let now = Instant::now();
        let expired: Vec<String> = table
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .filter(|(_, entry)| match &entry.slot {
                Slot::Pending(tx) => tx.receiver_count() == 0,
                Slot::Empty | Slot::Ready(_) => true,
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            table.entries.remove(&key);
            self.events.emit(Event::Expired { key: &key });
        }
        if table.entries.is_empty() {
            table.sweeper_running = false;
            self.events.emit(Event::SweeperStopped);
            return false;
        }
        true
    }
}

async fn sweep(inner: Weak<Inner>) {
    loop {
        let interval = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if !inner.sweep_once() {
                return;
            }
            inner.config.sweep_interval
        };
        tokio::time::sleep(interval).await;
    }
}

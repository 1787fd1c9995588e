// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Resolve one resource from an ordered list of sources.
//!
//! Sources are tried one after the other; the first one that produces a
//! non-empty body wins and later sources are never invoked. The expensive
//! source (typically a remote download) is wrapped in [`CachedFetch`], a
//! single-slot cache with an absolute expiry.

use crate::events::{Event, EventSink, TracingSink};
use crate::fetch::{Fetch, FetchError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no source could provide the resource (tried: {})", .tried.join(", "))]
    NotAvailable { tried: Vec<String> },
}

/// Body produced by [`FallbackResolver::resolve`] and the source it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub source: String,
    pub body: Bytes,
}

struct Source {
    name: String,
    fetcher: Box<dyn Fetch>,
}

pub struct FallbackResolver {
    sources: Vec<Source>,
    events: Arc<dyn EventSink>,
}

impl Default for FallbackResolver {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl FallbackResolver {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            sources: Vec::new(),
            events,
        }
    }

    /// Append a source at the end of the chain.
    pub fn with_source(mut self, name: impl Into<String>, fetcher: impl Fetch + 'static) -> Self {
        self.sources.push(Source {
            name: name.into(),
            fetcher: Box::new(fetcher),
        });
        self
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name.as_str()).collect()
    }

    pub async fn resolve(&self) -> Result<Resolved, ResolveError> {
        let mut tried = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            tried.push(source.name.clone());
            match source.fetcher.fetch().await {
                Ok(body) if !body.is_empty() => {
                    self.events.emit(Event::SourceHit {
                        source: &source.name,
                    });
                    return Ok(Resolved {
                        source: source.name.clone(),
                        body,
                    });
                }
                Ok(_) => self.events.emit(Event::SourceMiss {
                    source: &source.name,
                    reason: FetchError::Empty.to_string(),
                }),
                Err(e) => self.events.emit(Event::SourceMiss {
                    source: &source.name,
                    reason: e.to_string(),
                }),
            }
        }
        Err(ResolveError::NotAvailable { tried })
    }
}

/// What a [`CachedFetch`] does when refreshing a stale slot fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StalePolicy {
    /// Report the failure; the next call tries again.
    #[default]
    Refetch,
    /// Answer with the last good body; the next call still tries again.
    ServeStale,
}

struct CacheSlot {
    value: Option<Bytes>,
    stale_at: Instant,
}

/// Single-slot cache in front of another fetcher.
///
/// The slot is locked for the whole refresh, so concurrent callers wait for
/// one inner fetch instead of starting their own.
pub struct CachedFetch<F> {
    label: String,
    inner: F,
    max_age: Duration,
    policy: StalePolicy,
    slot: Mutex<CacheSlot>,
    events: Arc<dyn EventSink>,
}

impl<F: Fetch> CachedFetch<F> {
    pub fn new(label: impl Into<String>, inner: F, max_age: Duration) -> Self {
        Self {
            label: label.into(),
            inner,
            max_age,
            policy: StalePolicy::default(),
            slot: Mutex::new(CacheSlot {
                value: None,
                stale_at: Instant::now(),
            }),
            events: Arc::new(TracingSink),
        }
    }

    pub fn with_policy(mut self, policy: StalePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }
}

#[async_trait]
impl<F: Fetch> Fetch for CachedFetch<F> {
    async fn fetch(&self) -> Result<Bytes, FetchError> {
        let mut slot = self.slot.lock().await;
        let now = Instant::now();
        if now < slot.stale_at {
            if let Some(value) = &slot.value {
                self.events.emit(Event::SlotFresh {
                    source: &self.label,
                });
                return Ok(value.clone());
            }
        }

        let err = match self.inner.fetch().await {
            Ok(body) if !body.is_empty() => {
                *slot = CacheSlot {
                    value: Some(body.clone()),
                    stale_at: now + self.max_age,
                };
                return Ok(body);
            }
            Ok(_) => FetchError::Empty,
            Err(e) => e,
        };
        self.events.emit(Event::SlotRefreshFailed {
            source: &self.label,
            error: err.to_string(),
        });

        match (self.policy, &slot.value) {
            (StalePolicy::ServeStale, Some(value)) => {
                self.events.emit(Event::SlotServedStale {
                    source: &self.label,
                });
                Ok(value.clone())
            }
            _ => Err(err),
        }
    }
}

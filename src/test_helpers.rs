// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Shared test utilities to reduce duplication across test modules.

use crate::fetch::{Fetch, FetchError};
use crate::flow::{ConnectionMetadata, FlowRequest};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A fetcher that plays back a script of results and counts its calls.
///
/// `None` entries fail with [`FetchError::Empty`]. Once the script runs out the
/// last entry repeats. Clones share the script and the counter.
#[derive(Clone)]
pub struct ScriptedFetch {
    script: Arc<Mutex<VecDeque<Option<Bytes>>>>,
    last: Arc<Mutex<Option<Bytes>>>,
    calls: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl ScriptedFetch {
    pub fn sequence(script: Vec<Option<&'static str>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(
                script
                    .into_iter()
                    .map(|s| s.map(|body| Bytes::from_static(body.as_bytes())))
                    .collect(),
            )),
            last: Arc::new(Mutex::new(None)),
            calls: Arc::new(AtomicUsize::new(0)),
            delay: None,
        }
    }

    pub fn always(body: &'static str) -> Self {
        Self::sequence(vec![Some(body)])
    }

    pub fn failing() -> Self {
        Self::sequence(vec![None])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetch for ScriptedFetch {
    async fn fetch(&self) -> Result<Bytes, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = {
            let mut script = self.script.lock().expect("script lock");
            let mut last = self.last.lock().expect("last lock");
            match script.pop_front() {
                Some(entry) => {
                    *last = entry.clone();
                    entry
                }
                None => last.clone(),
            }
        };
        next.ok_or(FetchError::Empty)
    }
}

/// Create a test connection metadata with standard test address
pub fn make_test_conn() -> ConnectionMetadata {
    ConnectionMetadata::new("127.0.0.1:12345".parse().expect("valid test address"))
}

/// Build a flow request for interceptor tests.
pub fn make_flow_request(method: &str, uri: &str, headers: &[(&str, &str)]) -> FlowRequest {
    let mut map = hyper::HeaderMap::new();
    for (k, v) in headers {
        map.insert(
            hyper::header::HeaderName::from_bytes(k.as_bytes()).expect("header name"),
            v.parse().expect("header value"),
        );
    }
    FlowRequest {
        method: method.parse().expect("method"),
        uri: uri.parse().expect("uri"),
        headers: map,
        conn: Arc::new(make_test_conn()),
    }
}

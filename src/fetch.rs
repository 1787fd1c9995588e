// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Sources a resource body can be fetched from.

use crate::client::UpstreamClient;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{header, Request, Uri};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const MAX_REDIRECTS: usize = 5;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: hyper::http::uri::InvalidUri,
    },
    #[error("failed to build request for {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: hyper::http::Error,
    },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: hyper_util::client::legacy::Error,
    },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("{url} did not answer within {after:?}")]
    Timeout { url: String, after: Duration },
    #[error("too many redirects starting at {url}")]
    Redirects { url: String },
    #[error("failed to read body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: hyper::Error,
    },
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("source returned an empty body")]
    Empty,
}

/// A single way of obtaining a resource body.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self) -> Result<Bytes, FetchError>;
}

#[async_trait]
impl<T: Fetch + ?Sized> Fetch for Arc<T> {
    async fn fetch(&self) -> Result<Bytes, FetchError> {
        (**self).fetch().await
    }
}

/// `GET` a URL, following a few redirects.
///
/// Each hop, body included, must finish within the fetch timeout.
pub struct HttpFetch {
    client: UpstreamClient,
    url: Uri,
    timeout: Duration,
}

impl HttpFetch {
    pub fn new(client: UpstreamClient, url: &str) -> Result<Self, FetchError> {
        let url = url.parse::<Uri>().map_err(|source| FetchError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        Ok(Self {
            client,
            url,
            timeout: DEFAULT_FETCH_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, url: &Uri) -> Result<Hop, FetchError> {
        let req = Request::get(url.clone())
            .header(header::USER_AGENT, concat!("beyond-mitm/", env!("CARGO_PKG_VERSION")))
            .body(Full::new(Bytes::new()))
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
        let resp = self
            .client
            .request(req)
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        if status.is_redirection() {
            if let Some(next) = resp
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|loc| resolve_location(url, loc))
            {
                return Ok(Hop::Redirect(next));
            }
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|source| FetchError::Body {
                url: url.to_string(),
                source,
            })?
            .to_bytes();
        Ok(Hop::Body(body))
    }
}

enum Hop {
    Redirect(Uri),
    Body(Bytes),
}

#[async_trait]
impl Fetch for HttpFetch {
    async fn fetch(&self) -> Result<Bytes, FetchError> {
        let mut url = self.url.clone();
        for _ in 0..=MAX_REDIRECTS {
            let hop = tokio::time::timeout(self.timeout, self.attempt(&url))
                .await
                .map_err(|_| FetchError::Timeout {
                    url: url.to_string(),
                    after: self.timeout,
                })??;
            match hop {
                Hop::Redirect(next) => {
                    tracing::trace!(from = %url, to = %next, "following redirect");
                    url = next;
                }
                Hop::Body(body) if body.is_empty() => return Err(FetchError::Empty),
                Hop::Body(body) => return Ok(body),
            }
        }
        Err(FetchError::Redirects {
            url: self.url.to_string(),
        })
    }
}

// Location may be absolute or relative to the current authority.
fn resolve_location(current: &Uri, location: &str) -> Option<Uri> {
    let parsed = location.parse::<Uri>().ok()?;
    if parsed.scheme().is_some() {
        return Some(parsed);
    }
    if !location.starts_with('/') {
        return None;
    }
    let scheme = current.scheme_str()?;
    let authority = current.authority()?;
    format!("{}://{}{}", scheme, authority, location).parse().ok()
}

/// Read a file from disk.
pub struct FileFetch {
    path: PathBuf,
}

impl FileFetch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Fetch for FileFetch {
    async fn fetch(&self) -> Result<Bytes, FetchError> {
        let body = tokio::fs::read(&self.path)
            .await
            .map_err(|source| FetchError::Io {
                path: self.path.clone(),
                source,
            })?;
        if body.is_empty() {
            return Err(FetchError::Empty);
        }
        Ok(Bytes::from(body))
    }
}

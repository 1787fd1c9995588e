// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Views of an intercepted exchange handed to interceptors.

use bytes::Bytes;
use hyper::{header, HeaderMap, Method, StatusCode, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Metadata associated with an underlying TCP connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    pub id: Uuid,
    pub remote_addr: SocketAddr,
    pub established: Instant,
}

impl ConnectionMetadata {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            established: Instant::now(),
        }
    }
}

/// Request head as seen by the proxy, with an absolute URI.
#[derive(Debug, Clone)]
pub struct FlowRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub conn: Arc<ConnectionMetadata>,
}

impl FlowRequest {
    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The `Referer` header, used as the correlation key between flows.
    pub fn referer(&self) -> Option<&str> {
        self.header(header::REFERER).filter(|r| !r.is_empty())
    }
}

/// Upstream response of a forwarded request, body fully read.
#[derive(Debug, Clone)]
pub struct FlowResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FlowResponse {
    /// True when the body is not wrapped in a content coding.
    pub fn is_identity_encoded(&self) -> bool {
        match self
            .headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
        {
            None => true,
            Some(v) => v.trim().eq_ignore_ascii_case("identity"),
        }
    }
}

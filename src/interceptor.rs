// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Handlers mounted on the proxy.

use crate::flow::{FlowRequest, FlowResponse};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::{header, HeaderMap, Response, StatusCode};
use std::convert::Infallible;

pub type ProxyBody = BoxBody<Bytes, Infallible>;

pub const SERVER_HEADER: &str = concat!("beyond-mitm/", env!("CARGO_PKG_VERSION"));

/// A handler that may answer requests locally or observe forwarded exchanges.
///
/// The proxy asks every interceptor in order; the first one returning a
/// response from [`Interceptor::request`] wins and nothing is forwarded.
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Answer the request without contacting upstream.
    async fn request(&self, _req: &FlowRequest) -> Option<Response<ProxyBody>> {
        None
    }

    /// Adjust the headers of a request about to be forwarded.
    fn prepare_upstream(&self, _req: &FlowRequest, _headers: &mut HeaderMap) {}

    /// Observe a forwarded exchange once the upstream body has been read.
    fn response(&self, _req: &FlowRequest, _resp: &FlowResponse) {}
}

/// Build a locally generated response carrying the proxy's `server` header.
pub fn synthesize(
    status: StatusCode,
    body: impl Into<Bytes>,
    content_type: Option<&'static str>,
) -> Response<ProxyBody> {
    let body: Bytes = body.into();
    let mut resp = Response::new(Full::new(body).boxed());
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(header::SERVER, header::HeaderValue::from_static(SERVER_HEADER));
    if let Some(ct) = content_type {
        headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static(ct));
    }
    resp
}

/// Empty-bodied local response.
pub fn status_only(status: StatusCode) -> Response<ProxyBody> {
    synthesize(status, Bytes::new(), None)
}

// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Outbound HTTP(S) client shared by the proxy and the fetchers.

use bytes::Bytes;
use http_body_util::Full;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::rt::TokioExecutor;

pub type UpstreamClient = LegacyClient<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Build a client that speaks plain HTTP and HTTPS (native roots, h1 and h2).
pub fn build_client() -> anyhow::Result<UpstreamClient> {
    let https = HttpsConnectorBuilder::new()
        .with_native_roots()?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Ok(LegacyClient::builder(TokioExecutor::new()).build(https))
}

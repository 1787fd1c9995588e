// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Intercepting HTTP proxy: forwards traffic and lets interceptors answer or
//! observe matching flows.

use crate::broker::DataBroker;
use crate::ca::CertificateAuthority;
use crate::client::{build_client, UpstreamClient};
use crate::config::Config;
use crate::events::{EventSink, TracingSink};
use crate::flow::{ConnectionMetadata, FlowRequest, FlowResponse};
use crate::interceptor::{Interceptor, ProxyBody};
use crate::userscript::{ServeUserscript, UserscriptSettings};
use crate::webmanifest::ServeWebManifest;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::http::uri::Scheme;
use hyper::{service::service_fn, Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoConnBuilder;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashSet;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

pub const CERT_PATH: &str = "/_beyond_mitm/cert";

type ServiceFuture = Pin<Box<dyn Future<Output = Result<Response<ProxyBody>, Infallible>> + Send>>;

// RFC 7230 Section 6.1: Hop-by-hop headers must not be forwarded by proxies.
static HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug)]
struct AlwaysResolves(Arc<CertifiedKey>);

impl ResolvesServerCert for AlwaysResolves {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

struct Shared {
    client: UpstreamClient,
    cfg: Arc<Config>,
    ca: Option<Arc<CertificateAuthority>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

/// Build the interceptors enabled in `cfg`, in the order the proxy asks them.
pub async fn interceptors_from_config(
    cfg: &Config,
    client: &UpstreamClient,
) -> anyhow::Result<Vec<Arc<dyn Interceptor>>> {
    let events: Arc<dyn EventSink> = Arc::new(TracingSink);
    let mut interceptors: Vec<Arc<dyn Interceptor>> = Vec::new();

    if let Some(filter) = &cfg.userscript.filter {
        let settings = UserscriptSettings::load(&cfg.userscript).await?;
        interceptors.push(Arc::new(ServeUserscript::from_settings(
            filter.clone(),
            &settings,
            &cfg.userscript,
            client.clone(),
            events.clone(),
        )?));
    }

    let wm = &cfg.webmanifest;
    if let (Some(filter), Some(data_filter)) = (&wm.filter, &wm.data_filter) {
        let broker = DataBroker::with_events(wm.broker_config(), events.clone());
        interceptors.push(Arc::new(ServeWebManifest::new(
            filter.clone(),
            data_filter.clone(),
            broker,
            wm.timeout(),
        )));
    }

    for i in &interceptors {
        info!(interceptor = i.name(), "mounted");
    }
    Ok(interceptors)
}

pub async fn run_proxy(listen: SocketAddr, cfg: Arc<Config>) -> anyhow::Result<()> {
    let client = build_client()?;
    let interceptors = interceptors_from_config(&cfg, &client).await?;
    run_proxy_with(listen, cfg, client, interceptors, None).await
}

/// Run the proxy with explicit interceptors.
///
/// When `accept_limit` is `Some(n)`, the accept loop returns after accepting
/// `n` connections. Connection handlers are spawned and may still be running
/// when this function returns.
pub async fn run_proxy_with(
    listen: SocketAddr,
    cfg: Arc<Config>,
    client: UpstreamClient,
    interceptors: Vec<Arc<dyn Interceptor>>,
    accept_limit: Option<usize>,
) -> anyhow::Result<()> {
    let ca = if cfg.tls.enabled {
        let cert_path = cfg.tls.ca_cert_path.as_deref().unwrap_or("ca.crt");
        let key_path = cfg.tls.ca_key_path.as_deref().unwrap_or("ca.key");
        Some(
            CertificateAuthority::load_or_generate(
                std::path::Path::new(cert_path),
                std::path::Path::new(key_path),
            )
            .await?,
        )
    } else {
        None
    };

    let shared = Arc::new(Shared {
        client,
        cfg,
        ca,
        interceptors,
    });

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(listen = %listener.local_addr()?, "listening");

    let server_builder = AutoConnBuilder::new(TokioExecutor::new());

    let mut remaining = accept_limit;
    loop {
        if let Some(0) = remaining {
            break;
        }

        let (stream, remote_addr) = listener.accept().await?;

        if let Some(ref mut n) = remaining {
            *n -= 1;
        }

        let shared = shared.clone();
        let builder = server_builder.clone();
        tokio::spawn(async move {
            let conn = Arc::new(ConnectionMetadata::new(remote_addr));
            trace!(id = %conn.id, %remote_addr, "accepted");
            let service = service_fn(move |req: Request<Incoming>| {
                let shared = shared.clone();
                let conn = conn.clone();
                let fut: ServiceFuture =
                    Box::pin(async move { handle_request(req, shared, conn, Scheme::HTTP).await });
                fut
            });

            if let Err(e) = builder
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
            {
                error!(%e, "connection error");
            }
        });
    }

    Ok(())
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    let mut resp = Response::new(Full::new(body.into()).boxed());
    *resp.status_mut() = status;
    resp
}

async fn handle_request<B>(
    req: Request<B>,
    shared: Arc<Shared>,
    conn: Arc<ConnectionMetadata>,
    scheme: Scheme,
) -> Result<Response<ProxyBody>, Infallible>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.method() == Method::CONNECT {
        if shared.ca.is_none() {
            return Ok(text_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "CONNECT not supported (TLS disabled)",
            ));
        }
        let uri = req.uri().clone();
        tokio::task::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Err(e) = handle_connect(upgraded, uri, shared, conn).await {
                        error!(%e, "connect error");
                    }
                }
                Err(e) => error!(%uri, %e, "upgrade error"),
            }
        });
        return Ok(text_response(StatusCode::OK, Bytes::new()));
    }

    if req.method() == Method::GET && req.uri().path() == CERT_PATH {
        return Ok(match &shared.ca {
            Some(ca) => {
                let mut resp = text_response(StatusCode::OK, ca.cert_pem().to_string());
                let headers = resp.headers_mut();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/x-x509-ca-cert"),
                );
                headers.insert(
                    header::CONTENT_DISPOSITION,
                    HeaderValue::from_static("attachment; filename=\"beyond-mitm-ca.crt\""),
                );
                resp
            }
            None => text_response(StatusCode::NOT_FOUND, "TLS not enabled"),
        });
    }

    handle_http_logic(req, shared, conn, scheme).await
}

async fn handle_inner_request<B>(
    req: Request<B>,
    shared: Arc<Shared>,
    conn: Arc<ConnectionMetadata>,
    scheme: Scheme,
) -> Result<Response<ProxyBody>, Infallible>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.method() == Method::CONNECT {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "Nested CONNECT not supported",
        ));
    }
    handle_http_logic(req, shared, conn, scheme).await
}

// Origin-form targets are rebuilt from the Host header.
fn absolute_uri<B>(req: &Request<B>, scheme: &Scheme) -> Uri {
    if req.uri().scheme().is_some() {
        return req.uri().clone();
    }
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{}://{}{}", scheme, host, path)
        .parse::<Uri>()
        .unwrap_or_else(|_| Uri::from_static("http://localhost/"))
}

async fn handle_http_logic<B>(
    req: Request<B>,
    shared: Arc<Shared>,
    conn: Arc<ConnectionMetadata>,
    scheme: Scheme,
) -> Result<Response<ProxyBody>, Infallible>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let started = Instant::now();
    let flow = FlowRequest {
        method: req.method().clone(),
        uri: absolute_uri(&req, &scheme),
        headers: req.headers().clone(),
        conn,
    };

    for interceptor in &shared.interceptors {
        if let Some(resp) = interceptor.request(&flow).await {
            debug!(
                interceptor = interceptor.name(),
                method = %flow.method,
                uri = %flow.uri,
                status = resp.status().as_u16(),
                "answered locally"
            );
            return Ok(resp);
        }
    }

    let mut upstream_headers = HeaderMap::with_capacity(flow.headers.len());
    for (name, value) in flow.headers.iter() {
        if !shared
            .cfg
            .tls
            .suppress_headers
            .iter()
            .any(|h| h.eq_ignore_ascii_case(name.as_str()))
        {
            upstream_headers.append(name.clone(), value.clone());
        }
    }
    for interceptor in &shared.interceptors {
        interceptor.prepare_upstream(&flow, &mut upstream_headers);
    }

    let body_bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let e: Box<dyn std::error::Error + Send + Sync> = e.into();
            error!(uri = %flow.uri, %e, "failed to collect request body");
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "request body collect error",
            ));
        }
    };

    let mut upstream_req = Request::new(Full::new(body_bytes));
    *upstream_req.method_mut() = flow.method.clone();
    *upstream_req.uri_mut() = flow.uri.clone();
    *upstream_req.headers_mut() = upstream_headers;

    let resp = match shared.client.request(upstream_req).await {
        Ok(r) => r,
        Err(e) => {
            debug!(uri = %flow.uri, %e, "upstream error");
            return Ok(text_response(
                StatusCode::BAD_GATEWAY,
                format!("upstream error: {}", e),
            ));
        }
    };

    let (parts, body) = resp.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(uri = %flow.uri, %e, "upstream body error");
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("upstream body collect error: {}", e),
            ));
        }
    };

    let flow_resp = FlowResponse {
        status: parts.status,
        headers: parts.headers,
        body,
    };
    for interceptor in &shared.interceptors {
        interceptor.response(&flow, &flow_resp);
    }

    trace!(
        method = %flow.method,
        uri = %flow.uri,
        status = flow_resp.status.as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "forwarded"
    );

    let FlowResponse {
        status,
        mut headers,
        body,
    } = flow_resp;
    strip_hop_by_hop(&mut headers);
    let mut out = Response::new(Full::new(body).boxed());
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    Ok(out)
}

/// Remove hop-by-hop headers, including those named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: HashSet<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// `host` is tunnelled untouched when it equals a listed domain or is one of
/// its subdomains.
fn is_passthrough(host: &str, domains: &[String]) -> bool {
    domains.iter().any(|d| {
        let d = d.trim_start_matches('.');
        host.eq_ignore_ascii_case(d)
            || (host.len() > d.len()
                && host.as_bytes()[host.len() - d.len() - 1] == b'.'
                && host[host.len() - d.len()..].eq_ignore_ascii_case(d))
    })
}

async fn handle_connect(
    client_conn: hyper::upgrade::Upgraded,
    uri: Uri,
    shared: Arc<Shared>,
    conn: Arc<ConnectionMetadata>,
) -> anyhow::Result<()> {
    let host = uri.host().unwrap_or("unknown").to_string();
    let port = uri.port_u16().unwrap_or(443);

    if is_passthrough(&host, &shared.cfg.tls.passthrough_domains) {
        info!(%host, "tunneling connection (passthrough)");
        if let Err(e) = tunnel(TokioIo::new(client_conn), &host, port).await {
            error!(%host, %e, "tunnel error");
        }
        return Ok(());
    }

    let Some(ca) = shared.ca.as_ref() else {
        error!("CONNECT interception without a CA");
        return Ok(());
    };
    let leaf = ca.leaf_for(&host)?;

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(AlwaysResolves(leaf)));
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
    let stream = acceptor.accept(TokioIo::new(client_conn)).await?;

    let service = service_fn(move |req: Request<Incoming>| {
        let shared = shared.clone();
        let conn = conn.clone();
        let fut: ServiceFuture =
            Box::pin(async move { handle_inner_request(req, shared, conn, Scheme::HTTPS).await });
        fut
    });

    let builder = AutoConnBuilder::new(TokioExecutor::new());
    if let Err(e) = builder
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
    {
        error!(%host, %e, "TLS connection error");
    }

    Ok(())
}

async fn tunnel<S>(mut client: S, host: &str, port: u16) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    trace!(%host, port, "tunnel: connecting");
    let mut server = tokio::net::TcpStream::connect((host, port)).await?;
    let (up, down) = tokio::io::copy_bidirectional(&mut client, &mut server).await?;
    trace!(%host, port, up, down, "tunnel: finished");
    Ok(())
}

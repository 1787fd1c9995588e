// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{HeaderMap, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;

use beyond_mitm::config::Config;
use beyond_mitm::proxy::run_proxy;

pub const PAGE: &str = "https://www.dndbeyond.com/characters/12345";

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Reply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

// Start run_proxy and wait until it is accepting and CA files exist
pub async fn start_run_proxy_and_wait(
    cfg: Config,
) -> anyhow::Result<(tokio::task::JoinHandle<()>, SocketAddr)> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let cfg = Arc::new(cfg);
    let cfg_for_spawn = cfg.clone();
    let handle = tokio::spawn(async move {
        if let Err(e) = run_proxy(addr, cfg_for_spawn).await {
            eprintln!("proxy exited: {e:#}");
        }
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if Instant::now() > deadline {
            return Err(anyhow::anyhow!("timeout waiting for proxy to start"));
        }
        if let Ok(mut s) = tokio::net::TcpStream::connect(addr).await {
            let _ = s.shutdown().await;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    if cfg.tls.enabled {
        let cert_path = std::path::PathBuf::from(cfg.tls.ca_cert_path.clone().unwrap_or_else(|| "ca.crt".into()));
        let key_path = std::path::PathBuf::from(cfg.tls.ca_key_path.clone().unwrap_or_else(|| "ca.key".into()));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !(cert_path.exists() && key_path.exists()) {
            if Instant::now() > deadline {
                return Err(anyhow::anyhow!("timeout waiting for CA files"));
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    Ok((handle, addr))
}

/// Send one absolute-form request through the proxy over plain HTTP/1.1.
pub async fn send_via_proxy(
    proxy: SocketAddr,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
) -> anyhow::Result<Reply> {
    let stream = tokio::net::TcpStream::connect(proxy).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut builder = Request::builder().method(method).uri(uri);
    for (k, v) in headers {
        builder = builder.header(*k, *v);
    }
    let resp = sender.send_request(builder.body(Empty::<Bytes>::new())?).await?;
    let (parts, body) = resp.into_parts();
    Ok(Reply {
        status: parts.status,
        headers: parts.headers,
        body: body.collect().await?.to_bytes(),
    })
}

pub fn temp_ca_paths(cfg: &mut Config) -> (std::path::PathBuf, std::path::PathBuf) {
    let id = uuid::Uuid::new_v4();
    let cert_path = std::env::temp_dir().join(format!("beyond_mitm_ca_{}.crt", id));
    let key_path = std::env::temp_dir().join(format!("beyond_mitm_ca_{}.key", id));
    cfg.tls.enabled = true;
    cfg.tls.ca_cert_path = Some(cert_path.to_string_lossy().to_string());
    cfg.tls.ca_key_path = Some(key_path.to_string_lossy().to_string());
    (cert_path, key_path)
}

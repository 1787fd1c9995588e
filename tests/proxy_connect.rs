// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use beyond_mitm::config::Config;

mod common;
use common::{send_via_proxy, start_run_proxy_and_wait, temp_ca_paths};

// Send CONNECT and return the stream once the proxy has answered.
async fn connect_through(proxy: SocketAddr, host: &str, port: u16) -> anyhow::Result<(TcpStream, String)> {
    let mut stream = TcpStream::connect(proxy).await?;
    let connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await?;

    let mut hdr = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        let n = timeout(Duration::from_secs(2), stream.read(&mut tmp)).await??;
        if n == 0 {
            anyhow::bail!("unexpected EOF reading CONNECT response");
        }
        hdr.extend_from_slice(&tmp[..n]);
        if hdr.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    Ok((stream, String::from_utf8_lossy(&hdr).to_string()))
}

fn tls_connector(ca_cert_path: &Path) -> anyhow::Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    let mut f = std::io::BufReader::new(std::fs::File::open(ca_cert_path)?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut f).collect::<Result<Vec<_>, _>>()?;
    roots.add_parsable_certificates(certs);
    let cfg = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(cfg)))
}

#[tokio::test]
async fn https_userscript_is_served_through_mitm() -> anyhow::Result<()> {
    let build_dir = std::env::temp_dir().join(format!("beyond_mitm_dist_{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&build_dir).await?;
    tokio::fs::write(build_dir.join("beyond-utils.user.js"), "// over tls").await?;
    let dead = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();

    let mut cfg = Config::default();
    let (cert_path, key_path) = temp_ca_paths(&mut cfg);
    cfg.userscript.filter = Some("~d ^www\\.dndbeyond\\.com$ & ~p ^/beyond-utils\\.user\\.js$".parse()?);
    cfg.userscript.dev_server_host = Some("127.0.0.1".into());
    cfg.userscript.dev_server_port = Some(dead);
    cfg.userscript.build_dir = Some(build_dir.clone());
    cfg.userscript.upstream_url = Some(format!("http://127.0.0.1:{dead}/beyond-utils.user.js"));

    let (handle, proxy) = start_run_proxy_and_wait(cfg).await?;

    let (stream, hdrs) = connect_through(proxy, "www.dndbeyond.com", 443).await?;
    assert!(hdrs.starts_with("HTTP/1.1 200"), "{hdrs}");

    let server_name = rustls::pki_types::ServerName::try_from("www.dndbeyond.com")?;
    let tls = tls_connector(&cert_path)?.connect(server_name, stream).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls)).await?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = Request::get("/beyond-utils.user.js")
        .header("host", "www.dndbeyond.com")
        .body(Empty::<Bytes>::new())?;
    let resp = timeout(Duration::from_secs(5), sender.send_request(req)).await??;
    assert_eq!(resp.status().as_u16(), 200);
    let body = resp.into_body().collect().await?.to_bytes();
    assert_eq!(body, "// over tls");

    handle.abort();
    let _ = handle.await;
    let _ = tokio::fs::remove_file(cert_path).await;
    let _ = tokio::fs::remove_file(key_path).await;
    tokio::fs::remove_dir_all(&build_dir).await?;
    Ok(())
}

#[tokio::test]
async fn connect_passthrough_tunnels_raw_tcp() -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let server_task = tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 4];
            if socket.read_exact(&mut buf).await.is_ok() && &buf == b"ping" {
                let _ = socket.write_all(b"pong").await;
            }
        }
    });

    let mut cfg = Config::default();
    let (cert_path, key_path) = temp_ca_paths(&mut cfg);
    cfg.tls.passthrough_domains = vec!["127.0.0.1".into()];
    let (handle, proxy) = start_run_proxy_and_wait(cfg).await?;

    let (mut stream, hdrs) = connect_through(proxy, "127.0.0.1", port).await?;
    assert!(hdrs.starts_with("HTTP/1.1 200"));

    stream.write_all(b"ping").await?;
    let mut resp = [0u8; 4];
    timeout(Duration::from_secs(1), stream.read_exact(&mut resp)).await??;
    assert_eq!(&resp, b"pong");

    handle.abort();
    let _ = handle.await;
    let _ = tokio::fs::remove_file(cert_path).await;
    let _ = tokio::fs::remove_file(key_path).await;
    let _ = server_task.await;
    Ok(())
}

#[tokio::test]
async fn connect_without_tls_returns_405() -> anyhow::Result<()> {
    let (handle, proxy) = start_run_proxy_and_wait(Config::default()).await?;

    let (_stream, hdrs) = connect_through(proxy, "www.dndbeyond.com", 443).await?;
    assert!(hdrs.starts_with("HTTP/1.1 405"), "{hdrs}");

    handle.abort();
    let _ = handle.await;
    Ok(())
}

#[tokio::test]
async fn ca_cert_is_downloadable() -> anyhow::Result<()> {
    let mut cfg = Config::default();
    let (cert_path, key_path) = temp_ca_paths(&mut cfg);
    let (handle, proxy) = start_run_proxy_and_wait(cfg).await?;

    let reply = send_via_proxy(proxy, "GET", "http://beyond.mitm/_beyond_mitm/cert", &[]).await?;
    assert_eq!(reply.status.as_u16(), 200);
    assert_eq!(reply.header("content-type"), Some("application/x-x509-ca-cert"));
    assert_eq!(reply.body, tokio::fs::read(&cert_path).await?);

    handle.abort();
    let _ = handle.await;
    let _ = tokio::fs::remove_file(cert_path).await;
    let _ = tokio::fs::remove_file(key_path).await;
    Ok(())
}

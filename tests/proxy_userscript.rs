// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use std::path::PathBuf;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use beyond_mitm::config::Config;

mod common;
use common::{send_via_proxy, start_run_proxy_and_wait};

const SCRIPT_URL: &str = "http://www.dndbeyond.com/beyond-utils.user.js";

fn dead_port() -> anyhow::Result<u16> {
    let l = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(l.local_addr()?.port())
}

async fn userscript_config(upstream: &MockServer) -> anyhow::Result<(Config, PathBuf)> {
    let build_dir = std::env::temp_dir().join(format!("beyond_mitm_dist_{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&build_dir).await?;

    let mut cfg = Config::default();
    cfg.userscript.filter = Some("~p ^/beyond-utils\\.user\\.js$".parse()?);
    cfg.userscript.dev_server_host = Some("0.0.0.0".into());
    cfg.userscript.dev_server_port = Some(dead_port()?);
    cfg.userscript.build_dir = Some(build_dir.clone());
    cfg.userscript.upstream_url = Some(format!("{}/latest/beyond-utils.user.js", upstream.uri()));
    Ok((cfg, build_dir))
}

#[tokio::test]
async fn userscript_served_from_upstream_and_cached() -> anyhow::Result<()> {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/latest/beyond-utils.user.js"))
        .respond_with(ResponseTemplate::new(200).set_body_string("// upstream build"))
        .expect(1)
        .mount(&upstream)
        .await;

    let (cfg, build_dir) = userscript_config(&upstream).await?;
    let (handle, proxy) = start_run_proxy_and_wait(cfg).await?;

    for _ in 0..3 {
        let reply = send_via_proxy(proxy, "GET", SCRIPT_URL, &[]).await?;
        assert_eq!(reply.status.as_u16(), 200);
        assert_eq!(reply.header("content-type"), Some("application/javascript"));
        assert!(reply
            .header("server")
            .is_some_and(|s| s.starts_with("beyond-mitm/")));
        assert_eq!(reply.body, "// upstream build");
    }

    handle.abort();
    let _ = handle.await;
    tokio::fs::remove_dir_all(&build_dir).await?;
    // `expect(1)` is verified when `upstream` drops.
    Ok(())
}

#[tokio::test]
async fn local_build_wins_over_upstream() -> anyhow::Result<()> {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("// upstream build"))
        .expect(0)
        .mount(&upstream)
        .await;

    let (cfg, build_dir) = userscript_config(&upstream).await?;
    tokio::fs::write(build_dir.join("beyond-utils.user.js"), "// local build").await?;
    let (handle, proxy) = start_run_proxy_and_wait(cfg).await?;

    let reply = send_via_proxy(proxy, "GET", SCRIPT_URL, &[]).await?;
    assert_eq!(reply.status.as_u16(), 200);
    assert_eq!(reply.body, "// local build");

    handle.abort();
    let _ = handle.await;
    tokio::fs::remove_dir_all(&build_dir).await?;
    Ok(())
}

#[tokio::test]
async fn userscript_unavailable_is_404() -> anyhow::Result<()> {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&upstream)
        .await;

    let (cfg, build_dir) = userscript_config(&upstream).await?;
    let (handle, proxy) = start_run_proxy_and_wait(cfg).await?;

    let reply = send_via_proxy(proxy, "GET", SCRIPT_URL, &[]).await?;
    assert_eq!(reply.status.as_u16(), 404);
    assert!(reply.body.is_empty());

    handle.abort();
    let _ = handle.await;
    tokio::fs::remove_dir_all(&build_dir).await?;
    Ok(())
}

#[tokio::test]
async fn unmatched_traffic_is_forwarded() -> anyhow::Result<()> {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/characters"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&upstream)
        .await;

    let (cfg, build_dir) = userscript_config(&upstream).await?;
    let (handle, proxy) = start_run_proxy_and_wait(cfg).await?;

    let reply = send_via_proxy(proxy, "GET", &format!("{}/characters", upstream.uri()), &[]).await?;
    assert_eq!(reply.status.as_u16(), 200);
    assert_eq!(reply.body, "ok");
    assert!(reply.header("server").is_none());

    handle.abort();
    let _ = handle.await;
    tokio::fs::remove_dir_all(&build_dir).await?;
    Ok(())
}

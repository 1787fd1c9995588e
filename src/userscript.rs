// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Serve the userscript from the first source that has it.
//!
//! Sources, in order: the local dev server, the local build directory, and
//! the published upstream build (cached for an hour).

use crate::client::UpstreamClient;
use crate::config::UserscriptConfig;
use crate::events::EventSink;
use crate::fetch::{FetchError, FileFetch, HttpFetch};
use crate::filter::FlowFilter;
use crate::flow::FlowRequest;
use crate::interceptor::{status_only, synthesize, Interceptor, ProxyBody};
use crate::resolver::{CachedFetch, FallbackResolver};
use anyhow::Context;
use async_trait::async_trait;
use hyper::http::uri::Authority;
use hyper::{Response, StatusCode, Uri};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const SOURCE_DEVSERVER: &str = "local devserver";
pub const SOURCE_BUILD: &str = "local build";
pub const SOURCE_UPSTREAM: &str = "upstream";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("dev_server_host must be a valid IP or hostname, got {0:?}")]
    InvalidHost(String),
    #[error("dev_server_port must be a valid port, got {0}")]
    InvalidPort(String),
    #[error("upstream_url must be a valid absolute http(s) URL, got {0:?}")]
    InvalidUrl(String),
    #[error("upstream_url {0:?} does not name a file")]
    NoFileName(String),
}

/// Port as printed by the settings command: a number or a numeric string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(i64),
    Text(String),
}

impl PortValue {
    fn to_port(&self) -> Result<u16, SettingsError> {
        let port = match self {
            PortValue::Number(n) => u16::try_from(*n).ok(),
            PortValue::Text(s) => s.trim().parse::<u16>().ok(),
        };
        match port {
            Some(p) if p > 0 => Ok(p),
            _ => Err(SettingsError::InvalidPort(match self {
                PortValue::Number(n) => n.to_string(),
                PortValue::Text(s) => format!("{:?}", s),
            })),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawSettings {
    dev_server_host: Option<String>,
    dev_server_port: Option<PortValue>,
    build_dir: Option<PathBuf>,
    upstream_url: Option<String>,
}

impl RawSettings {
    fn overlay(mut self, cfg: &UserscriptConfig) -> Self {
        if let Some(host) = &cfg.dev_server_host {
            self.dev_server_host = Some(host.clone());
        }
        if let Some(port) = cfg.dev_server_port {
            self.dev_server_port = Some(PortValue::Number(i64::from(port)));
        }
        if let Some(dir) = &cfg.build_dir {
            self.build_dir = Some(dir.clone());
        }
        if let Some(url) = &cfg.upstream_url {
            self.upstream_url = Some(url.clone());
        }
        self
    }

    fn validate(self) -> Result<UserscriptSettings, SettingsError> {
        let host = self
            .dev_server_host
            .ok_or(SettingsError::Missing("dev_server_host"))?;
        let port = self
            .dev_server_port
            .ok_or(SettingsError::Missing("dev_server_port"))?
            .to_port()?;
        let build_dir = self.build_dir.ok_or(SettingsError::Missing("build_dir"))?;
        let upstream_url = self
            .upstream_url
            .ok_or(SettingsError::Missing("upstream_url"))?;
        UserscriptSettings::new(host, port, build_dir, upstream_url)
    }
}

/// Validated locations of the userscript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserscriptSettings {
    dev_server_host: String,
    dev_server_port: u16,
    build_dir: PathBuf,
    upstream_url: String,
    file_name: String,
}

impl UserscriptSettings {
    pub fn new(
        dev_server_host: String,
        dev_server_port: u16,
        build_dir: PathBuf,
        upstream_url: String,
    ) -> Result<Self, SettingsError> {
        let trimmed = dev_server_host.trim();
        if trimmed.is_empty() || format!("{}:{}", bracket(trimmed), 1).parse::<Authority>().is_err()
        {
            return Err(SettingsError::InvalidHost(dev_server_host));
        }
        // A wildcard bind address is not something to connect to.
        let dev_server_host = if trimmed == "0.0.0.0" {
            "127.0.0.1".to_string()
        } else {
            trimmed.to_string()
        };
        if dev_server_port == 0 {
            return Err(SettingsError::InvalidPort(dev_server_port.to_string()));
        }

        let uri: Uri = upstream_url
            .parse()
            .map_err(|_| SettingsError::InvalidUrl(upstream_url.clone()))?;
        if !matches!(uri.scheme_str(), Some("http") | Some("https")) || uri.host().is_none() {
            return Err(SettingsError::InvalidUrl(upstream_url));
        }
        let file_name = uri
            .path()
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| SettingsError::NoFileName(upstream_url.clone()))?;

        Ok(Self {
            dev_server_host,
            dev_server_port,
            build_dir,
            upstream_url,
            file_name,
        })
    }

    /// Resolve settings from the optional settings command and the config.
    pub async fn load(cfg: &UserscriptConfig) -> anyhow::Result<Self> {
        let raw = match &cfg.settings_command {
            Some(cmd) => run_settings_command(cmd).await?,
            None => RawSettings::default(),
        };
        let settings = raw.overlay(cfg).validate()?;
        debug!(
            host = %settings.dev_server_host,
            port = settings.dev_server_port,
            build_dir = %settings.build_dir.display(),
            upstream = %settings.upstream_url,
            "userscript settings"
        );
        Ok(settings)
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn dev_server_url(&self) -> String {
        format!(
            "http://{}:{}/{}",
            bracket(&self.dev_server_host),
            self.dev_server_port,
            self.file_name
        )
    }

    pub fn build_path(&self) -> PathBuf {
        self.build_dir.join(&self.file_name)
    }

    pub fn upstream_url(&self) -> &str {
        &self.upstream_url
    }
}

fn bracket(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

async fn run_settings_command(cmd: &[String]) -> anyhow::Result<RawSettings> {
    let (program, args) = cmd
        .split_first()
        .context("userscript.settings_command is empty")?;
    debug!(%program, ?args, "getting userscript settings");
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to run settings command {:?}", program))?;
    if !output.status.success() {
        anyhow::bail!(
            "settings command {:?} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    serde_json::from_slice(&output.stdout)
        .with_context(|| format!("settings command {:?} did not print a JSON object", program))
}

pub struct ServeUserscript {
    filter: FlowFilter,
    resolver: FallbackResolver,
}

impl ServeUserscript {
    pub fn new(filter: FlowFilter, resolver: FallbackResolver) -> Self {
        Self { filter, resolver }
    }

    /// Chain the three sources described by `settings`.
    pub fn from_settings(
        filter: FlowFilter,
        settings: &UserscriptSettings,
        cfg: &UserscriptConfig,
        client: UpstreamClient,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, FetchError> {
        let devserver = HttpFetch::new(client.clone(), &settings.dev_server_url())?
            .with_timeout(cfg.fetch_timeout());
        let build = FileFetch::new(settings.build_path());
        let upstream = CachedFetch::new(
            SOURCE_UPSTREAM,
            HttpFetch::new(client, settings.upstream_url())?.with_timeout(cfg.fetch_timeout()),
            Duration::from_secs(cfg.upstream_cache_seconds),
        )
        .with_policy(cfg.stale_policy)
        .with_events(events.clone());

        info!(
            devserver = %settings.dev_server_url(),
            build = %settings.build_path().display(),
            upstream = %settings.upstream_url(),
            "userscript sources (in order)"
        );

        let resolver = FallbackResolver::new(events)
            .with_source(SOURCE_DEVSERVER, devserver)
            .with_source(SOURCE_BUILD, build)
            .with_source(SOURCE_UPSTREAM, upstream);
        Ok(Self::new(filter, resolver))
    }
}

#[async_trait]
impl Interceptor for ServeUserscript {
    fn name(&self) -> &'static str {
        "serve-userscript"
    }

    async fn request(&self, req: &FlowRequest) -> Option<Response<ProxyBody>> {
        if !self.filter.matches(&req.method, &req.uri) {
            return None;
        }
        match self.resolver.resolve().await {
            Ok(resolved) => Some(synthesize(
                StatusCode::OK,
                resolved.body,
                Some("application/javascript"),
            )),
            Err(e) => {
                debug!(uri = %req.uri, error = %e, "userscript not available");
                Some(status_only(StatusCode::NOT_FOUND))
            }
        }
    }
}

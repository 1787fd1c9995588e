// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Configuration loading and validation.

use crate::broker::BrokerConfig;
use crate::filter::FlowFilter;
use crate::resolver::StalePolicy;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Listen address, e.g. 127.0.0.1:8080
    pub listen: String,

    /// Default log filter, overridden by `RUST_LOG`.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub ca_cert_path: Option<String>,
    pub ca_key_path: Option<String>,
    pub passthrough_domains: Vec<String>,
    pub suppress_headers: Vec<String>,
}

/// Where to find the userscript.
///
/// Any of the four settings may come from `settings_command`, a program that
/// prints a JSON object with the same keys. Values given here win over the
/// command output.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UserscriptConfig {
    /// Requests to answer with the userscript. Disabled when unset.
    pub filter: Option<FlowFilter>,
    pub settings_command: Option<Vec<String>>,
    pub dev_server_host: Option<String>,
    pub dev_server_port: Option<u16>,
    pub build_dir: Option<PathBuf>,
    pub upstream_url: Option<String>,
    pub upstream_cache_seconds: u64,
    /// Deadline for each dev server or upstream request.
    pub fetch_timeout_seconds: u64,
    pub stale_policy: StalePolicy,
}

impl Default for UserscriptConfig {
    fn default() -> Self {
        Self {
            filter: None,
            settings_command: None,
            dev_server_host: None,
            dev_server_port: None,
            build_dir: None,
            upstream_url: None,
            upstream_cache_seconds: 60 * 60,
            fetch_timeout_seconds: crate::fetch::DEFAULT_FETCH_TIMEOUT.as_secs(),
            stale_policy: StalePolicy::default(),
        }
    }
}

impl UserscriptConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebManifestConfig {
    /// Manifest requests to answer. Disabled when unset.
    pub filter: Option<FlowFilter>,
    /// Forwarded responses whose body feeds the manifest.
    pub data_filter: Option<FlowFilter>,
    pub timeout_seconds: u64,
    pub ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
    /// `0` disables the bound.
    pub max_entries: usize,
}

impl Default for WebManifestConfig {
    fn default() -> Self {
        Self {
            filter: None,
            data_filter: None,
            timeout_seconds: 15,
            ttl_seconds: 5 * 60,
            sweep_interval_seconds: 30,
            max_entries: crate::broker::DEFAULT_MAX_ENTRIES,
        }
    }
}

impl WebManifestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            ttl: Duration::from_secs(self.ttl_seconds),
            sweep_interval: Duration::from_secs(self.sweep_interval_seconds),
            max_entries: (self.max_entries > 0).then_some(self.max_entries),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub tls: TlsConfig,
    pub userscript: UserscriptConfig,
    pub webmanifest: WebManifestConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// ```toml
    /// [general]
    /// listen = "127.0.0.1:8080"
    ///
    /// [userscript]
    /// filter = "~d dndbeyond.com & ~p ^/beyond-utils\\.user\\.js$"
    /// settings_command = ["node", "mitm/get-webpack-settings.js"]
    ///
    /// [webmanifest]
    /// filter = "~d dndbeyond.com & ~p ^/manifest\\.webmanifest$"
    /// data_filter = "~d character-service.dndbeyond.com & ~p /character/v5/character/"
    /// ```
    pub async fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let s = tokio::fs::read_to_string(path_ref)
            .await
            .with_context(|| format!("failed to read {}", path_ref.display()))?;
        let cfg: Self = toml::from_str(&s)
            .with_context(|| format!("failed to parse {}", path_ref.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the values serde cannot check on its own.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.general
            .listen
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid general.listen {:?}", self.general.listen))?;

        let us = &self.userscript;
        if let Some(host) = &us.dev_server_host {
            if host.trim().is_empty() {
                bail!("userscript.dev_server_host must not be empty");
            }
        }
        if us.dev_server_port == Some(0) {
            bail!("userscript.dev_server_port must be in 1..=65535");
        }
        if us.upstream_cache_seconds == 0 {
            bail!("userscript.upstream_cache_seconds must be positive");
        }
        if us.fetch_timeout_seconds == 0 {
            bail!("userscript.fetch_timeout_seconds must be positive");
        }

        let wm = &self.webmanifest;
        if wm.filter.is_some() && wm.data_filter.is_none() {
            bail!("webmanifest.filter is set but webmanifest.data_filter is not");
        }
        if wm.timeout_seconds == 0 {
            bail!("webmanifest.timeout_seconds must be positive");
        }
        if wm.sweep_interval_seconds == 0 {
            bail!("webmanifest.sweep_interval_seconds must be positive");
        }
        if wm.timeout_seconds >= wm.ttl_seconds {
            bail!(
                "webmanifest.timeout_seconds ({}) must be shorter than webmanifest.ttl_seconds ({})",
                wm.timeout_seconds,
                wm.ttl_seconds
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::fs;
    use uuid::Uuid;

    async fn write_tmp(toml: &str) -> anyhow::Result<PathBuf> {
        let tmp = std::env::temp_dir().join(format!("beyond-mitm_cfg_test_{}.toml", Uuid::new_v4()));
        fs::write(&tmp, toml).await?;
        Ok(tmp)
    }

    #[test]
    fn defaults_are_valid() -> anyhow::Result<()> {
        let cfg = Config::default();
        cfg.validate()?;
        assert_eq!(cfg.general.listen, "127.0.0.1:8080");
        assert_eq!(cfg.general.log_level, "info");
        assert!(!cfg.tls.enabled);
        assert!(cfg.userscript.filter.is_none());
        assert_eq!(cfg.userscript.upstream_cache_seconds, 3600);
        assert_eq!(cfg.userscript.stale_policy, StalePolicy::Refetch);
        assert_eq!(cfg.userscript.fetch_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.webmanifest.timeout(), Duration::from_secs(15));
        Ok(())
    }

    #[test]
    fn broker_config_from_webmanifest_section() {
        let wm = WebManifestConfig::default();
        let bc = wm.broker_config();
        assert_eq!(bc.ttl, Duration::from_secs(300));
        assert_eq!(bc.sweep_interval, Duration::from_secs(30));
        assert_eq!(bc.max_entries, Some(1024));

        let unbounded = WebManifestConfig {
            max_entries: 0,
            ..WebManifestConfig::default()
        };
        assert_eq!(unbounded.broker_config().max_entries, None);
    }

    #[tokio::test]
    async fn load_toml_file() -> anyhow::Result<()> {
        let tmp = write_tmp(
            r#"[general]
listen = "127.0.0.1:3000"
log_level = "debug"

[tls]
enabled = true
passthrough_domains = ["example.org"]

[userscript]
filter = "~d www.dndbeyond.com & ~p ^/beyond-utils\\.user\\.js$"
dev_server_host = "0.0.0.0"
dev_server_port = 8081
build_dir = "dist"
upstream_url = "https://example.github.io/beyond-utils/main.user.js"
upstream_cache_seconds = 60
fetch_timeout_seconds = 3
stale_policy = "serve-stale"

[webmanifest]
filter = "~p manifest.webmanifest"
data_filter = "~d character-service.dndbeyond.com"
timeout_seconds = 5
max_entries = 0
"#,
        )
        .await?;
        let cfg = Config::load_from_path(&tmp).await?;
        assert_eq!(cfg.general.listen, "127.0.0.1:3000");
        assert_eq!(cfg.general.log_level, "debug");
        assert!(cfg.tls.enabled);
        assert_eq!(cfg.tls.passthrough_domains, vec!["example.org".to_string()]);
        assert!(cfg.userscript.filter.is_some());
        assert_eq!(cfg.userscript.dev_server_port, Some(8081));
        assert_eq!(cfg.userscript.build_dir, Some(PathBuf::from("dist")));
        assert_eq!(cfg.userscript.stale_policy, StalePolicy::ServeStale);
        assert_eq!(cfg.userscript.fetch_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.webmanifest.timeout_seconds, 5);
        assert_eq!(cfg.webmanifest.ttl_seconds, 300);
        assert_eq!(cfg.webmanifest.broker_config().max_entries, None);
        fs::remove_file(&tmp).await?;
        Ok(())
    }

    #[tokio::test]
    async fn empty_file_yields_defaults() -> anyhow::Result<()> {
        let tmp = write_tmp("").await?;
        let cfg = Config::load_from_path(&tmp).await?;
        assert_eq!(cfg.general.listen, "127.0.0.1:8080");
        assert!(cfg.webmanifest.filter.is_none());
        fs::remove_file(&tmp).await?;
        Ok(())
    }

    #[tokio::test]
    async fn load_missing_file_errors() {
        let p = std::env::temp_dir().join("beyond-mitm_cfg_missing_does_not_exist.toml");
        let res = Config::load_from_path(&p).await;
        assert!(res.is_err());
    }

    #[rstest]
    #[case("[general]\nlisten = \"not an address\"\n", "general.listen")]
    #[case("[userscript]\nfilter = \"~q nope\"\n", "unknown filter ~q")]
    #[case("[userscript]\ndev_server_host = \"  \"\n", "dev_server_host")]
    #[case("[userscript]\ndev_server_port = 0\n", "dev_server_port")]
    #[case("[userscript]\ndev_server_port = 70000\n", "dev_server_port")]
    #[case("[userscript]\nfetch_timeout_seconds = 0\n", "fetch_timeout_seconds")]
    #[case("[userscript]\nstale_policy = \"sometimes\"\n", "stale_policy")]
    #[case("[webmanifest]\nfilter = \"~p manifest\"\n", "data_filter")]
    #[case("[webmanifest]\ntimeout_seconds = 0\n", "timeout_seconds")]
    #[case("[webmanifest]\nsweep_interval_seconds = 0\n", "sweep_interval_seconds")]
    #[case("[webmanifest]\ntimeout_seconds = 300\n", "shorter than")]
    #[case("[webmanifest]\ntimeout_seconds = 30\nttl_seconds = 10\n", "shorter than")]
    #[tokio::test]
    async fn load_invalid_config_cases(
        #[case] toml: &str,
        #[case] expected_substring: &str,
    ) -> anyhow::Result<()> {
        let tmp = write_tmp(toml).await?;
        let res = Config::load_from_path(&tmp).await;
        let err = format!("{:#}", res.expect_err("config should be rejected"));
        assert!(
            err.contains(expected_substring),
            "{err:?} does not mention {expected_substring:?}"
        );
        fs::remove_file(&tmp).await?;
        Ok(())
    }
}

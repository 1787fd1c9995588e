// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

use beyond_mitm::{config, logging, proxy};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "beyond-mitm", version)]
struct Args {
    /// Listen address, e.g. 127.0.0.1:8080 (overrides the config file)
    #[arg(long)]
    listen: Option<String>,

    /// Optional config TOML path
    #[arg(long)]
    config: Option<String>,

    /// Log filter, e.g. debug or beyond_mitm=trace (RUST_LOG wins)
    #[arg(long)]
    log_level: Option<String>,
}

async fn load_config(path: Option<&str>) -> (config::Config, Option<anyhow::Error>) {
    match path {
        Some(p) => match config::Config::load_from_path(p).await {
            Ok(cfg) => (cfg, None),
            Err(e) => (config::Config::default(), Some(e)),
        },
        None => (config::Config::default(), None),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (mut cfg, load_error) = load_config(args.config.as_deref()).await;
    if let Some(level) = args.log_level {
        cfg.general.log_level = level;
    }
    logging::init(&cfg.general.log_level);
    if let Some(e) = load_error {
        warn!(path = ?args.config, error = %format!("{:#}", e), "failed to load config, using defaults");
    }
    if let Some(listen) = args.listen {
        cfg.general.listen = listen;
    }

    let addr: SocketAddr = cfg.general.listen.parse()?;
    let server = proxy::run_proxy(addr, Arc::new(cfg));

    tokio::select! {
        res = server => {
            if let Err(e) = res {
                error!(error = %format!("{:#}", e), "server error");
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}

//! relayhub - action dispatch hub
//!
//! Workers connect over TCP and register under a group and nickname.
//! Front-ends connect over WebSocket, run named actions on a group's
//! machines, and receive their output. Any running action can be cancelled
//! per session or across every session running it.

use clap::Parser as ClapParser;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relayhub::{
    api,
    config::{self, ConfigError, HubConfig},
    hub::Hub,
    server,
    transport::Outbox,
};

/// relayhub - action dispatch hub
#[derive(ClapParser, Debug)]
#[command(name = "relayhub", version, about, long_about = None)]
struct Cli {
    /// Path to the config file (defaults to $XDG_CONFIG_HOME/relayhub/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address workers connect to
    #[arg(long, env = "RELAYHUB_SERVICE")]
    service: Option<SocketAddr>,

    /// Address of the HTTP/WebSocket listener
    #[arg(long, env = "RELAYHUB_WEB")]
    web: Option<SocketAddr>,

    /// Directory holding <group>/<action>.lua scripts
    #[arg(long, env = "RELAYHUB_LOGIC_DIR")]
    logic_dir: Option<PathBuf>,

    /// Seconds between action catalog rescans
    #[arg(long)]
    scan_interval: Option<u64>,
}

#[derive(Error, Debug)]
pub enum HubdError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Cli {
    /// Resolve the effective config: file (if any), then CLI/env overrides.
    fn resolve_config(&self) -> Result<HubConfig, HubdError> {
        let path = self.config.clone().or_else(config::default_config_path);
        let mut config = match path {
            Some(ref path) => {
                let loaded = HubConfig::load(path)?;
                if loaded.is_some() {
                    tracing::info!(path = %path.display(), "loaded config");
                }
                loaded.unwrap_or_default()
            }
            None => HubConfig::default(),
        };

        if let Some(service) = self.service {
            config.service = service;
        }
        if let Some(web) = self.web {
            config.web = web;
        }
        if let Some(ref dir) = self.logic_dir {
            config.logic_dir = dir.clone();
        }
        if let Some(secs) = self.scan_interval {
            config.scan_interval_secs = secs;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), HubdError> {
    let cli = Cli::parse();
    init_tracing();

    let config = cli.resolve_config()?;
    run(config).await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "relayhub=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config: HubConfig) -> Result<(), HubdError> {
    tracing::info!("relayhub starting");

    let hub = Hub::new(Outbox::with_capacity(config.outbox_capacity));
    let shutdown = CancellationToken::new();

    let logic_dir = config.logic_dir.clone();
    let count = {
        let catalog = hub.catalog().clone();
        let dir = logic_dir.clone();
        tokio::task::spawn_blocking(move || catalog.refresh(&dir)).await?
    };
    tracing::info!(path = %logic_dir.display(), actions = count, "action catalog loaded");
    let refresh_handle =
        hub.catalog()
            .spawn_refresh(logic_dir, config.scan_interval(), shutdown.clone());

    let worker_listener = tokio::net::TcpListener::bind(config.service).await?;
    let web_listener = tokio::net::TcpListener::bind(config.web).await?;
    tracing::info!(addr = %config.web, "HTTP/WS server listening");

    let worker_handle = tokio::spawn(server::serve(
        hub.clone(),
        worker_listener,
        config.register_timeout(),
        shutdown.clone(),
    ));

    let app = api::router(api::AppState {
        hub: hub.clone(),
        shutdown: shutdown.clone(),
    });
    let http_shutdown = shutdown.clone();
    let http_handle = tokio::spawn(async move {
        axum::serve(web_listener, app)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await
    });

    tracing::info!("relayhub ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C");
    shutdown.cancel();

    if let Err(e) = http_handle.await? {
        tracing::error!(?e, "HTTP server error");
    }
    if let Err(e) = worker_handle.await? {
        tracing::error!(?e, "worker listener error");
    }
    refresh_handle.await?;

    tracing::info!("relayhub stopped");
    Ok(())
}

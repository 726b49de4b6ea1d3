// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level server runner shared by `main` and the end-to-end specs.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::hub::EventHub;
use crate::orchestrator::Orchestrator;
use crate::registry::FileRegistry;
use crate::transport::build_router;

/// Debounce window for high-churn event channels.
const HUB_DEBOUNCE: Duration = Duration::from_millis(300);

/// A bound, fully-wired server that has not started serving yet.
pub struct Server {
    pub orchestrator: Arc<Orchestrator>,
    pub shutdown: CancellationToken,
    listener: TcpListener,
    router: axum::Router,
}

impl Server {
    pub fn local_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until shutdown, then terminate every session before
    /// returning.
    pub async fn serve(self) -> anyhow::Result<()> {
        let Server { orchestrator, shutdown, listener, router } = self;

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await;

        info!("listener closed, stopping sessions");
        orchestrator.shutdown_all().await;
        shutdown.cancel();

        result.map_err(Into::into)
    }
}

/// Initialize tracing/logging from config.
///
/// Uses `try_init` so it is safe to call repeatedly (e.g. from tests).
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    // Priority: --log-level / CORRAL_LOG_LEVEL > RUST_LOG > "info".
    let filter = if std::env::var("CORRAL_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Wire up the orchestrator, restore persisted sessions, and bind the
/// listener. The caller decides when to [`Server::serve`].
pub async fn prepare(config: Config) -> anyhow::Result<Server> {
    init_tracing(&config);

    let data_root = config.resolved_data_root();
    std::fs::create_dir_all(&data_root)?;

    let shutdown = CancellationToken::new();
    let registry = Arc::new(FileRegistry::open(&data_root)?);
    let hub = Arc::new(EventHub::new(HUB_DEBOUNCE));
    let orchestrator =
        Orchestrator::new(config.orchestrator_config(), hub, registry, shutdown.clone());

    orchestrator.restore_from_registry();
    orchestrator.spawn_health_sweep();

    let router = build_router(Arc::clone(&orchestrator));
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("listening on {}", listener.local_addr()?);

    spawn_signal_handler(shutdown.clone());

    Ok(Server { orchestrator, shutdown, listener, router })
}

/// Run the server to completion.
pub async fn run(config: Config) -> anyhow::Result<()> {
    prepare(config).await?.serve().await
}

/// First SIGTERM/SIGINT triggers graceful shutdown; the second forces
/// exit.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
            }
        }
        shutdown.cancel();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                error!("received SIGTERM again, forcing exit");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                error!("received SIGINT again, forcing exit");
            }
        }
        std::process::exit(130);
    });
}

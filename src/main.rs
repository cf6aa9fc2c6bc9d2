//! chanpool - run a connection pool from a TOML config and log what arrives.

use std::sync::Arc;

use chanpool::metrics::{Metrics, NoopMetrics, PrometheusMetrics};
use chanpool::{Error, Pool, config, telemetry};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = config::load_and_validate(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    info!(
        addr = %config.server.addr,
        nick = %config.identity.nick,
        channels = config.pool.channels.len(),
        "Starting chanpool"
    );

    let prometheus = if config.metrics.enabled {
        Some(PrometheusMetrics::new()?)
    } else {
        None
    };
    let metrics: Arc<dyn Metrics> = match &prometheus {
        Some(m) => Arc::new(m.clone()),
        None => Arc::new(NoopMetrics),
    };

    let pool = Pool::new(config.pool_config(), config.dialer(), metrics);
    let scope = CancellationToken::new();

    if let Some(mut incoming) = pool.take_incoming() {
        tokio::spawn(async move {
            while let Some(msg) = incoming.recv().await {
                info!(target: "chanpool::incoming", "{msg}");
            }
        });
    }

    {
        let pool = pool.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl-C, shutting down"),
                Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
            }
            pool.stop();
        });
    }

    let result = pool.run(&scope).await;

    if let Some(m) = &prometheus {
        info!("Final metrics:\n{}", m.gather());
    }

    match result {
        Err(Error::PoolStopped) | Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

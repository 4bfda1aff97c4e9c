// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use anyhow::Context;
use fleet_flags::api::{self, AppState};
use fleet_flags::config::{AppConfig, LogFormat};
use fleet_flags::memory::MemoryStore;
use fleet_flags::metrics::Metrics;
use fleet_flags::seed::load_seed_file;
use fleet_flags::store::{FlagRegistry, FlagStore, RedisStore};
use fleet_flags::usage::{spawn_usage_writer, UsageRecorder};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = AppConfig::from_env()?;
    init_tracing(cfg.log_format);

    let store = build_store(&cfg).await?;
    let flags = FlagRegistry::from_shared(Arc::clone(&store));

    if let Some(path) = &cfg.seed_file {
        load_seed_file(path, &flags).await?;
    }

    let metrics = Metrics::new().context("failed to set up metrics")?;
    let (usage, usage_rx) = UsageRecorder::channel(cfg.usage_queue_capacity, metrics.clone());
    let writer = spawn_usage_writer(store, usage_rx, metrics.clone());

    let state = AppState {
        flags,
        metrics,
        usage,
        max_dependency_depth: cfg.max_dependency_depth,
    };
    let app = api::router(state);

    let listen_addr = cfg.listen_addr();
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;

    tracing::info!(%listen_addr, "starting fleet-flags");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router owned the last usage senders; the writer now drains and stops.
    match tokio::time::timeout(cfg.shutdown_grace(), writer).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => tracing::warn!(%error, "usage writer panicked"),
        Err(_) => tracing::warn!("usage writer did not drain before shutdown deadline"),
    }

    tracing::info!("fleet-flags exited cleanly");

    Ok(())
}

async fn build_store(cfg: &AppConfig) -> anyhow::Result<Arc<dyn FlagStore>> {
    match &cfg.redis_url {
        Some(url) => {
            let store = RedisStore::new(url, cfg.redis_prefix.clone()).await?;
            store.ping().await.context("redis is not reachable")?;
            tracing::info!(prefix = %cfg.redis_prefix, "using redis flag store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("FLAGS_REDIS_URL not set; flags are kept in memory and lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term_signal) => term_signal.recv().await,
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                None
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

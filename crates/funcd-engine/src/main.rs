// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! funcd - Function Deployment and Execution Engine
//!
//! Runs the engine against a Podman or Docker daemon:
//! - Metadata store (SQLite or PostgreSQL)
//! - Orphaned container reaping

use std::sync::Arc;
use tracing::{info, warn};

use funcd_daemon::{ContainerRuntime, DaemonClient};
use funcd_engine::config::Config;
use funcd_engine::engine::Engine;
use funcd_engine::store::open_store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "funcd_engine=info,funcd_daemon=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        database_url = %redact(&config.database_url),
        data_dir = %config.data_dir.display(),
        socket = %config.daemon.socket_path.display(),
        flavor = %config.daemon.flavor,
        "Starting funcd"
    );

    let store = open_store(&config.database_url).await?;
    info!("Metadata store ready");

    let runtime = Arc::new(DaemonClient::new(config.daemon.clone()));
    runtime.ping().await?;
    let platform = runtime.platform().await;
    info!(
        runtime_type = runtime.runtime_type(),
        platform = %platform,
        "Container daemon reachable"
    );

    let engine = Engine::builder()
        .config(&config)
        .store(store)
        .runtime(runtime)
        .build()?
        .start()
        .await?;

    info!("funcd ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    engine.shutdown().await?;

    info!("funcd shut down");

    Ok(())
}

/// Hide the password of a database URL.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let userinfo = &url[scheme_end + 3..at];
            match userinfo.split_once(':') {
                Some((user, _)) => format!("{}{}:***{}", &url[..scheme_end + 3], user, &url[at..]),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}

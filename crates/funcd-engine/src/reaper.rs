// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that removes orphaned invocation containers.
//!
//! The executor always deletes its containers, but a crash between create and delete
//! leaves them behind. Every poll interval this worker lists containers carrying the
//! `funcd.managed=true` label and removes any that have outlived the execution timeout
//! plus a grace period.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use funcd_daemon::{ContainerFilters, ContainerRuntime, RuntimeError};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::invocation::MANAGED_LABEL;

/// Configuration for the orphan reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often to scan.
    pub poll_interval: Duration,
    /// Containers older than this are orphans.
    pub max_age: Duration,
}

impl ReaperConfig {
    /// Reaper for invocations bounded by `execution_timeout`, with a one minute grace.
    pub fn for_timeout(poll_interval: Duration, execution_timeout: Duration) -> Self {
        Self {
            poll_interval,
            max_age: execution_timeout + Duration::from_secs(60),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self::for_timeout(Duration::from_secs(60), Duration::from_secs(30))
    }
}

/// Removes managed containers that outlived their invocation.
pub struct OrphanReaper {
    runtime: Arc<dyn ContainerRuntime>,
    config: ReaperConfig,
    shutdown: Arc<Notify>,
}

impl OrphanReaper {
    /// Create a reaper.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ReaperConfig) -> Self {
        Self {
            runtime,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reaper loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_secs = self.config.max_age.as_secs(),
            "Orphan reaper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Orphan reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.reap_once().await {
                        error!(error = %e, "Failed to scan for orphaned containers");
                    }
                }
            }
        }

        info!("Orphan reaper stopped");
    }

    /// One scan. Returns the number of containers removed.
    pub async fn reap_once(&self) -> Result<usize, RuntimeError> {
        let filters = ContainerFilters::new().label(format!("{}=true", MANAGED_LABEL));
        let containers = self.runtime.list_containers(&filters, true).await?;

        let cutoff = Utc::now().timestamp() - self.config.max_age.as_secs() as i64;
        let mut removed = 0usize;

        for container in containers.iter().filter(|c| c.created <= cutoff) {
            if container.state().is_running()
                && let Err(e) = self.runtime.kill_container(&container.id, "SIGKILL").await
            {
                debug!(container_id = %container.id, error = %e, "Kill before removal failed");
            }
            match self.runtime.delete_container(&container.id, true).await {
                Ok(true) => {
                    removed += 1;
                    info!(
                        container_id = %container.id,
                        name = %container.name(),
                        "Removed orphaned container"
                    );
                }
                Ok(false) => {}
                Err(e) => warn!(
                    container_id = %container.id,
                    error = %e,
                    "Failed to remove orphaned container"
                ),
            }
        }

        if removed > 0 {
            info!(removed, scanned = containers.len(), "Reaper cycle completed");
        } else {
            debug!(scanned = containers.len(), "Reaper cycle completed, no orphans");
        }
        Ok(removed)
    }
}

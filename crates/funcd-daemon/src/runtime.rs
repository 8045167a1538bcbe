// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The container runtime seam.
//!
//! [`ContainerRuntime`] is implemented by [`DaemonClient`](crate::DaemonClient) for a real
//! daemon and by [`MockRuntime`](crate::MockRuntime) for tests. Waiting and the batch
//! `*_with_filter` operations are provided methods composed from the single-container
//! calls, so every implementation shares them.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::error::{Result, RuntimeError};
use crate::types::{
    BuildOptions, BuildOutput, ContainerFilters, ContainerInspect, ContainerLogs, ContainerSpec,
    ContainerState, ContainerStats, ContainerSummary, ExitInfo, ImageSummary, PruneReport,
    StopOutcome, WaitCondition,
};

/// Container and image lifecycle against one daemon.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short name for logs, e.g. `podman`.
    fn runtime_type(&self) -> &'static str;

    async fn ping(&self) -> Result<()>;

    /// `os/arch` of the daemon host, `linux/amd64` when it cannot be determined.
    async fn platform(&self) -> String;

    // ----- images -----

    async fn pull_image(&self, reference: &str) -> Result<()>;

    async fn image_exists(&self, reference: &str) -> Result<bool>;

    /// Returns `false` when the image did not exist.
    async fn delete_image(&self, reference: &str, force: bool) -> Result<bool>;

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> Result<()>;

    /// Build `tag` from a tar build context.
    async fn build_image(
        &self,
        tag: &str,
        context: Bytes,
        options: &BuildOptions,
    ) -> Result<BuildOutput>;

    async fn list_images(&self, all: bool) -> Result<Vec<ImageSummary>>;

    async fn prune_images(&self) -> Result<PruneReport>;

    // ----- containers -----

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop gracefully, killing after `timeout`. Stopping a stopped or missing container
    /// is not an error.
    async fn stop_container(&self, id: &str, timeout: Option<Duration>) -> Result<StopOutcome>;

    /// Send `signal` (name or number). Unknown signals are rejected before any request.
    async fn kill_container(&self, id: &str, signal: &str) -> Result<()>;

    async fn pause_container(&self, id: &str) -> Result<()>;

    async fn unpause_container(&self, id: &str) -> Result<()>;

    async fn restart_container(&self, id: &str, timeout: Option<Duration>) -> Result<()>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect>;

    async fn container_exists(&self, id: &str) -> Result<bool>;

    /// Returns `false` when the container did not exist.
    async fn delete_container(&self, id: &str, force: bool) -> Result<bool>;

    async fn container_logs(&self, id: &str) -> Result<ContainerLogs>;

    async fn container_stats(&self, id: &str) -> Result<ContainerStats>;

    /// List containers; without `all` only running (and paused) ones.
    async fn list_containers(
        &self,
        filters: &ContainerFilters,
        all: bool,
    ) -> Result<Vec<ContainerSummary>>;

    /// Poll until `condition` holds or `deadline` elapses.
    async fn wait_container(
        &self,
        id: &str,
        condition: WaitCondition,
        poll_interval: Duration,
        deadline: Duration,
    ) -> Result<ExitInfo> {
        let started = Instant::now();
        loop {
            match self.inspect_container(id).await {
                Ok(inspect) if condition.is_met(inspect.state) => return Ok(inspect.exit_info()),
                Ok(_) => {}
                Err(RuntimeError::NotFound(_)) if condition == WaitCondition::Removed => {
                    return Ok(ExitInfo {
                        exit_code: 0,
                        oom_killed: false,
                        state: ContainerState::Exited,
                    });
                }
                Err(e) => return Err(e),
            }

            let elapsed = started.elapsed();
            if elapsed >= deadline {
                return Err(RuntimeError::WaitTimeout {
                    container_id: id.to_string(),
                    waited: elapsed,
                });
            }
            tokio::time::sleep(poll_interval.min(deadline - elapsed)).await;
        }
    }

    // ----- batch -----

    async fn kill_with_filter(
        &self,
        filters: &ContainerFilters,
        signal: &str,
    ) -> Result<Vec<String>> {
        let ids = self.matching_ids(filters, false).await?;
        Ok(scatter("kill", ids, |id| async move {
            self.kill_container(&id, signal).await.map(|_| true)
        })
        .await)
    }

    async fn pause_with_filter(&self, filters: &ContainerFilters) -> Result<Vec<String>> {
        let ids = self.matching_ids(filters, false).await?;
        Ok(scatter("pause", ids, |id| async move {
            self.pause_container(&id).await.map(|_| true)
        })
        .await)
    }

    async fn restart_with_filter(
        &self,
        filters: &ContainerFilters,
        timeout: Option<Duration>,
    ) -> Result<Vec<String>> {
        let ids = self.matching_ids(filters, true).await?;
        Ok(scatter("restart", ids, |id| async move {
            self.restart_container(&id, timeout).await.map(|_| true)
        })
        .await)
    }

    async fn stop_with_filter(
        &self,
        filters: &ContainerFilters,
        timeout: Option<Duration>,
    ) -> Result<Vec<String>> {
        let ids = self.matching_ids(filters, false).await?;
        Ok(scatter("stop", ids, |id| async move {
            self.stop_container(&id, timeout)
                .await
                .map(|outcome| outcome == StopOutcome::Stopped)
        })
        .await)
    }

    async fn matching_ids(&self, filters: &ContainerFilters, all: bool) -> Result<Vec<String>> {
        Ok(self
            .list_containers(filters, all)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect())
    }
}

/// Run `op` for every id concurrently and keep the ids it reports as affected.
async fn scatter<F, Fut>(action: &'static str, ids: Vec<String>, op: F) -> Vec<String>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let total = ids.len();
    let results = join_all(ids.into_iter().map(|id| {
        let fut = op(id.clone());
        async move { (id, fut.await) }
    }))
    .await;

    let affected: Vec<String> = results
        .into_iter()
        .filter_map(|(id, result)| match result {
            Ok(true) => Some(id),
            Ok(false) => None,
            Err(e) => {
                warn!(container_id = %id, action, error = %e, "Batch operation failed for container");
                None
            }
        })
        .collect();

    debug!(action, total, affected = affected.len(), "Batch operation finished");
    affected
}

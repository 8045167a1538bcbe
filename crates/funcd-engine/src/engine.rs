// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable engine: wires the store, runtime and artifact store into the deployment
//! manager, the invocation executor and the orphan reaper.
//!
//! ```ignore
//! let engine = Engine::builder()
//!     .store(store)
//!     .runtime(runtime)
//!     .artifacts(artifacts)
//!     .limits(ResourceLimits::default())
//!     .build()?
//!     .start()
//!     .await?;
//!
//! let deployment = engine.deploy("hello", request).await?;
//! let record = engine.invoke("hello", InvokeRequest::new()).await?;
//!
//! engine.shutdown().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyResult;
use funcd_daemon::ContainerRuntime;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::artifact::{ArtifactStore, FsArtifactStore};
use crate::config::{Config, ResourceLimits};
use crate::deployment::{DeployRequest, DeploymentManager};
use crate::error::Result;
use crate::invocation::{InvocationExecutor, InvokeRequest};
use crate::model::{Deployment, Function, InvocationRecord};
use crate::reaper::{OrphanReaper, ReaperConfig};
use crate::store::MetadataStore;

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    store: Option<Arc<dyn MetadataStore>>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    limits: ResourceLimits,
    retry_attempts: u32,
    reaper_poll_interval: Duration,
    reaper_enabled: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            store: None,
            runtime: None,
            artifacts: None,
            limits: ResourceLimits::default(),
            retry_attempts: 3,
            reaper_poll_interval: Duration::from_secs(60),
            reaper_enabled: true,
        }
    }
}

impl EngineBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take limits, retries, reaper interval and the artifact directory from `config`.
    pub fn config(mut self, config: &Config) -> Self {
        self.limits = config.limits.clone();
        self.retry_attempts = config.retry_attempts;
        self.reaper_poll_interval = config.reaper_poll_interval;
        if self.artifacts.is_none() {
            self.artifacts = Some(Arc::new(FsArtifactStore::new(config.artifacts_dir())));
        }
        self
    }

    /// Set the metadata store (required).
    pub fn store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the container runtime (required).
    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Set the artifact store (required).
    pub fn artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Set invocation limits.
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the attempts for pulls and builds hitting transient daemon errors.
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Set the orphan reaper interval.
    pub fn reaper_poll_interval(mut self, interval: Duration) -> Self {
        self.reaper_poll_interval = interval;
        self
    }

    /// Run without the orphan reaper.
    pub fn without_reaper(mut self) -> Self {
        self.reaper_enabled = false;
        self
    }

    /// Validate the configuration.
    pub fn build(self) -> AnyResult<EngineConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let runtime = self
            .runtime
            .ok_or_else(|| anyhow::anyhow!("runtime is required"))?;
        let artifacts = self
            .artifacts
            .ok_or_else(|| anyhow::anyhow!("artifacts is required"))?;
        if self.retry_attempts == 0 {
            anyhow::bail!("retry_attempts must be at least 1");
        }
        self.limits.validate()?;

        Ok(EngineConfig {
            store,
            runtime,
            artifacts,
            limits: self.limits,
            retry_attempts: self.retry_attempts,
            reaper_poll_interval: self.reaper_poll_interval,
            reaper_enabled: self.reaper_enabled,
        })
    }
}

/// Validated configuration for an [`Engine`].
pub struct EngineConfig {
    store: Arc<dyn MetadataStore>,
    runtime: Arc<dyn ContainerRuntime>,
    artifacts: Arc<dyn ArtifactStore>,
    limits: ResourceLimits,
    retry_attempts: u32,
    reaper_poll_interval: Duration,
    reaper_enabled: bool,
}

impl EngineConfig {
    /// Start the engine, spawning the orphan reaper.
    pub async fn start(self) -> AnyResult<Engine> {
        let deployments = DeploymentManager::new(
            self.store.clone(),
            self.runtime.clone(),
            self.artifacts.clone(),
            self.retry_attempts,
        );
        let executor = InvocationExecutor::new(
            self.store.clone(),
            self.runtime.clone(),
            self.limits.clone(),
        );

        let reaper = if self.reaper_enabled {
            let reaper = OrphanReaper::new(
                self.runtime.clone(),
                ReaperConfig::for_timeout(self.reaper_poll_interval, self.limits.timeout),
            );
            let shutdown = reaper.shutdown_handle();
            let handle = tokio::spawn(async move {
                reaper.run().await;
            });
            Some((handle, shutdown))
        } else {
            None
        };

        info!(
            runtime = self.runtime.runtime_type(),
            max_concurrent = self.limits.max_concurrent,
            timeout_secs = self.limits.timeout.as_secs(),
            memory_mb = self.limits.max_memory_mb,
            reaper = reaper.is_some(),
            "Engine started"
        );

        Ok(Engine {
            deployments,
            executor,
            store: self.store,
            reaper,
        })
    }
}

/// A running funcd engine.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct Engine {
    deployments: DeploymentManager,
    executor: InvocationExecutor,
    store: Arc<dyn MetadataStore>,
    reaper: Option<(JoinHandle<()>, Arc<Notify>)>,
}

impl Engine {
    /// Create a new builder for configuring the engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Deployment operations.
    pub fn deployments(&self) -> &DeploymentManager {
        &self.deployments
    }

    /// Invocation operations.
    pub fn executor(&self) -> &InvocationExecutor {
        &self.executor
    }

    /// See [`DeploymentManager::deploy`].
    pub async fn deploy(&self, function_id: &str, request: DeployRequest) -> Result<Deployment> {
        self.deployments.deploy(function_id, request).await
    }

    /// See [`DeploymentManager::rollback`].
    pub async fn rollback(&self, function_id: &str, deployment_id: &str) -> Result<Deployment> {
        self.deployments.rollback(function_id, deployment_id).await
    }

    /// See [`DeploymentManager::list_deployments`].
    pub async fn list_deployments(&self, function_id: &str) -> Result<Vec<Deployment>> {
        self.deployments.list_deployments(function_id).await
    }

    /// See [`DeploymentManager::get_active`].
    pub async fn get_active(&self, function_id: &str) -> Result<Option<Deployment>> {
        self.deployments.get_active(function_id).await
    }

    /// See [`DeploymentManager::get_function`].
    pub async fn get_function(&self, function_id: &str) -> Result<Function> {
        self.deployments.get_function(function_id).await
    }

    /// See [`DeploymentManager::disable`].
    pub async fn disable(&self, function_id: &str) -> Result<Function> {
        self.deployments.disable(function_id).await
    }

    /// See [`DeploymentManager::enable`].
    pub async fn enable(&self, function_id: &str) -> Result<Function> {
        self.deployments.enable(function_id).await
    }

    /// See [`DeploymentManager::delete_function`].
    pub async fn delete_function(&self, function_id: &str) -> Result<()> {
        self.deployments.delete_function(function_id).await
    }

    /// See [`InvocationExecutor::invoke`].
    pub async fn invoke(&self, function_id: &str, request: InvokeRequest) -> Result<InvocationRecord> {
        self.executor.invoke(function_id, request).await
    }

    /// See [`InvocationExecutor::invoke_with_cancel`].
    pub async fn invoke_with_cancel(
        &self,
        function_id: &str,
        request: InvokeRequest,
        cancel: CancellationToken,
    ) -> Result<InvocationRecord> {
        self.executor
            .invoke_with_cancel(function_id, request, cancel)
            .await
    }

    /// See [`InvocationExecutor::list_invocations`].
    pub async fn list_invocations(
        &self,
        function_id: &str,
        limit: i64,
    ) -> Result<Vec<InvocationRecord>> {
        self.executor.list_invocations(function_id, limit).await
    }

    /// Check the metadata store is reachable.
    pub async fn health_check(&self) -> Result<bool> {
        Ok(self.store.health_check().await?)
    }

    /// Check if the background reaper is still running.
    pub fn is_running(&self) -> bool {
        self.reaper
            .as_ref()
            .is_none_or(|(handle, _)| !handle.is_finished())
    }

    /// Gracefully shut down, stopping the reaper.
    pub async fn shutdown(self) -> AnyResult<()> {
        info!("Engine shutting down...");

        if let Some((handle, shutdown)) = self.reaper {
            shutdown.notify_one();
            if let Err(e) = handle.await {
                error!("Orphan reaper task panicked: {}", e);
                return Err(anyhow::anyhow!("reaper task panicked: {}", e));
            }
        }

        info!("Engine shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use funcd_daemon::MockRuntime;

    #[test]
    fn test_build_requires_parts() {
        let err = Engine::builder().build().err().unwrap();
        assert!(err.to_string().contains("store is required"));
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_limits() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let result = Engine::builder()
            .store(store)
            .runtime(Arc::new(MockRuntime::new()))
            .artifacts(Arc::new(FsArtifactStore::new("unused")))
            .limits(ResourceLimits {
                max_memory_mb: 0,
                ..ResourceLimits::default()
            })
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let engine = Engine::builder()
            .store(store)
            .runtime(Arc::new(MockRuntime::new()))
            .artifacts(Arc::new(FsArtifactStore::new("unused")))
            .reaper_poll_interval(Duration::from_millis(10))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(engine.is_running());
        assert!(engine.health_check().await.unwrap());
        engine.shutdown().await.unwrap();
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Versioned deployments and rollback.
//!
//! Per function the deployment lifecycle is `building -> {active | failed}`, with the
//! previously active deployment moving to `archived` in the same transaction that
//! activates its successor. Mutations of one function are serialized by a per-function
//! lock; reads go straight to the store.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use funcd_daemon::{BuildOptions, ContainerRuntime, RuntimeError};
use serde_json::json;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifact::{ArtifactStore, artifact_key};
use crate::error::{Error, Result};
use crate::model::{Deployment, DeploymentStatus, Function, FunctionStatus, image_repository};
use crate::store::MetadataStore;

/// First delay between retries of a transient daemon error; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// What a deployment runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    /// A prebuilt image, pulled and re-tagged.
    Image {
        /// Registry reference, e.g. `docker.io/library/python:3.12-slim`.
        reference: String,
    },
    /// A tar build context, stored and then built.
    BuildContext {
        /// Tar archive bytes.
        tar: Bytes,
        /// Dockerfile path inside the context.
        dockerfile: String,
        /// `--build-arg` values.
        build_args: BTreeMap<String, String>,
    },
}

impl Artifact {
    /// Build context with the default `Dockerfile` and no build args.
    pub fn build_context(tar: impl Into<Bytes>) -> Self {
        Artifact::BuildContext {
            tar: tar.into(),
            dockerfile: "Dockerfile".to_string(),
            build_args: BTreeMap::new(),
        }
    }

    /// Prebuilt image reference.
    pub fn image(reference: impl Into<String>) -> Self {
        Artifact::Image {
            reference: reference.into(),
        }
    }
}

/// Parameters of one deploy call.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployRequest {
    /// Owning account. Must match the existing function's owner.
    pub owner: String,
    /// Display name, used when the function is created.
    pub name: String,
    /// What to run.
    pub artifact: Artifact,
    /// Entrypoint override.
    pub command: Option<Vec<String>>,
    /// Environment passed to every invocation of this deployment.
    pub env: BTreeMap<String, String>,
}

impl DeployRequest {
    /// Request with no command override and empty environment.
    pub fn new(owner: impl Into<String>, name: impl Into<String>, artifact: Artifact) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            artifact,
            command: None,
            env: BTreeMap::new(),
        }
    }

    /// Set the entrypoint override.
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command);
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.owner.trim().is_empty() {
            return Err(Error::InvalidRequest("owner is required".to_string()));
        }
        match &self.artifact {
            Artifact::Image { reference } if reference.trim().is_empty() => Err(
                Error::InvalidRequest("image reference is required".to_string()),
            ),
            Artifact::BuildContext { tar, .. } if tar.is_empty() => Err(Error::InvalidRequest(
                "build context is empty".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Creates, activates and rolls back deployments.
pub struct DeploymentManager {
    store: Arc<dyn MetadataStore>,
    runtime: Arc<dyn ContainerRuntime>,
    artifacts: Arc<dyn ArtifactStore>,
    retry_attempts: u32,
    /// Per-function mutation locks; dead entries are pruned on the next insert.
    locks: Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl DeploymentManager {
    /// Create a manager. `retry_attempts` bounds pulls and builds on transient errors.
    pub fn new(
        store: Arc<dyn MetadataStore>,
        runtime: Arc<dyn ContainerRuntime>,
        artifacts: Arc<dyn ArtifactStore>,
        retry_attempts: u32,
    ) -> Self {
        Self {
            store,
            runtime,
            artifacts,
            retry_attempts: retry_attempts.max(1),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_function(&self, function_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, lock| lock.strong_count() > 0);
            match locks.get(function_id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    locks.insert(function_id.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    /// Deploy a new version of `function_id`, creating the function on first deploy.
    ///
    /// On success the new deployment is active and the previous one archived. On failure
    /// the new deployment is recorded as `failed`, the previous active deployment stays
    /// active, and [`Error::BuildFailed`] carries the recorded error text.
    pub async fn deploy(&self, function_id: &str, request: DeployRequest) -> Result<Deployment> {
        if function_id.trim().is_empty() {
            return Err(Error::InvalidRequest("function id is required".to_string()));
        }
        request.validate()?;

        let _guard = self.lock_function(function_id).await;

        let function = match self.store.get_function(function_id).await? {
            Some(existing) => {
                if existing.owner != request.owner {
                    return Err(Error::OwnerMismatch {
                        function_id: function_id.to_string(),
                    });
                }
                ensure_available(&existing)?;
                existing
            }
            None => {
                let now = Utc::now();
                let name = if request.name.trim().is_empty() {
                    function_id.to_string()
                } else {
                    request.name.clone()
                };
                let function = Function {
                    id: function_id.to_string(),
                    owner: request.owner.clone(),
                    name,
                    status: FunctionStatus::Init,
                    active_deployment_id: None,
                    created_at: now,
                    updated_at: now,
                };
                self.store.create_function(&function).await?;
                info!(function_id, owner = %function.owner, "Created function");
                function
            }
        };

        let version = self.store.max_version(function_id).await? + 1;
        let image_tag = crate::model::image_tag(function_id, version);

        let (payload, ext) = match &request.artifact {
            Artifact::Image { reference } => {
                let manifest = json!({
                    "kind": "image",
                    "reference": reference,
                    "image_tag": image_tag,
                });
                (Bytes::from(manifest.to_string()), "json")
            }
            Artifact::BuildContext { tar, .. } => (tar.clone(), "tar"),
        };

        let now = Utc::now();
        let deployment = Deployment {
            id: Uuid::new_v4().to_string(),
            function_id: function_id.to_string(),
            version,
            image_tag: image_tag.clone(),
            artifact_key: artifact_key(function_id, version, &payload, ext),
            status: DeploymentStatus::Building,
            is_active: false,
            error: None,
            command: request.command.clone(),
            env: request.env.clone(),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_deployment(&deployment).await?;
        self.store
            .update_function_status(function_id, FunctionStatus::Building)
            .await?;

        info!(
            function_id,
            deployment_id = %deployment.id,
            version,
            image_tag = %image_tag,
            "Deployment building"
        );

        if let Err(e) = self.artifacts.put(&deployment.artifact_key, payload).await {
            let message = format!("Failed to store artifact: {}", e);
            return Err(self.fail_deployment(&function, &deployment, message).await);
        }

        if let Err(e) = self.produce_image(&deployment, &request.artifact).await {
            let message = e.to_string();
            return Err(self.fail_deployment(&function, &deployment, message).await);
        }

        let active = match self
            .store
            .activate_deployment(function_id, &deployment.id)
            .await
        {
            Ok(active) => active,
            Err(e) => {
                let message = format!("Failed to activate deployment: {}", e);
                self.fail_deployment(&function, &deployment, message).await;
                return Err(e.into());
            }
        };

        info!(
            function_id,
            deployment_id = %active.id,
            version,
            "Deployment active"
        );
        Ok(active)
    }

    /// Pull and tag, or build, the deployment's image.
    async fn produce_image(
        &self,
        deployment: &Deployment,
        artifact: &Artifact,
    ) -> std::result::Result<(), RuntimeError> {
        let runtime = &self.runtime;
        let image_tag = deployment.image_tag.as_str();
        match artifact {
            Artifact::Image { reference } => {
                retry_transient(self.retry_attempts, "pull", move || {
                    runtime.pull_image(reference)
                })
                .await?;
                let repo = image_repository(&deployment.function_id);
                let tag = format!("v{}", deployment.version);
                let (repo, tag) = (repo.as_str(), tag.as_str());
                retry_transient(self.retry_attempts, "tag", move || {
                    runtime.tag_image(reference, repo, tag)
                })
                .await?;
                debug!(reference = %reference, image_tag, "Image pulled and tagged");
            }
            Artifact::BuildContext {
                tar,
                dockerfile,
                build_args,
            } => {
                // A tag left behind by an earlier failed attempt is replaced.
                let leftover = runtime.image_exists(image_tag).await?;
                let options = BuildOptions {
                    dockerfile: dockerfile.clone(),
                    build_args: build_args.clone(),
                    force: leftover,
                    ..BuildOptions::default()
                };
                let options = &options;
                let output = retry_transient(self.retry_attempts, "build", move || {
                    runtime.build_image(image_tag, tar.clone(), options)
                })
                .await?;
                debug!(
                    image_tag,
                    image_id = ?output.image_id,
                    platform = %output.platform,
                    log_lines = output.logs.len(),
                    "Image built"
                );
            }
        }
        Ok(())
    }

    /// Record the failure, restore the function status and build the caller's error.
    async fn fail_deployment(
        &self,
        function: &Function,
        deployment: &Deployment,
        message: String,
    ) -> Error {
        warn!(
            function_id = %function.id,
            deployment_id = %deployment.id,
            version = deployment.version,
            error = %message,
            "Deployment failed"
        );

        if let Err(e) = self
            .store
            .mark_deployment_failed(&deployment.id, &message)
            .await
        {
            return e.into();
        }

        let restored = match self.store.get_active_deployment(&function.id).await {
            Ok(Some(_)) => FunctionStatus::Active,
            Ok(None) => FunctionStatus::Init,
            Err(e) => return e.into(),
        };
        if let Err(e) = self
            .store
            .update_function_status(&function.id, restored)
            .await
        {
            return e.into();
        }

        Error::BuildFailed {
            deployment_id: deployment.id.clone(),
            message,
        }
    }

    /// Re-activate an earlier deployment without rebuilding it.
    ///
    /// Rolling back to the deployment that is already active returns it unchanged.
    pub async fn rollback(&self, function_id: &str, deployment_id: &str) -> Result<Deployment> {
        let _guard = self.lock_function(function_id).await;

        let function = self.require_function(function_id).await?;
        ensure_available(&function)?;

        let target = self
            .store
            .get_deployment(deployment_id)
            .await?
            .filter(|d| d.function_id == function_id)
            .ok_or_else(|| Error::DeploymentNotFound(deployment_id.to_string()))?;

        if target.is_active {
            debug!(function_id, deployment_id, "Rollback target already active");
            return Ok(target);
        }

        match target.status {
            DeploymentStatus::Failed | DeploymentStatus::Building => {
                return Err(Error::InvalidRequest(format!(
                    "deployment {} is {} and cannot be activated",
                    deployment_id, target.status
                )));
            }
            DeploymentStatus::Active | DeploymentStatus::Archived => {}
        }

        if !self.runtime.image_exists(&target.image_tag).await? {
            return Err(Error::ImageMissing(target.image_tag));
        }

        let active = self
            .store
            .activate_deployment(function_id, deployment_id)
            .await?;

        info!(
            function_id,
            deployment_id,
            version = active.version,
            "Rolled back"
        );
        Ok(active)
    }

    /// All deployments of a function, newest version first.
    pub async fn list_deployments(&self, function_id: &str) -> Result<Vec<Deployment>> {
        self.require_function(function_id).await?;
        Ok(self.store.list_deployments(function_id).await?)
    }

    /// The function's active deployment, if it has one.
    pub async fn get_active(&self, function_id: &str) -> Result<Option<Deployment>> {
        self.require_function(function_id).await?;
        Ok(self.store.get_active_deployment(function_id).await?)
    }

    /// Fetch a function.
    pub async fn get_function(&self, function_id: &str) -> Result<Function> {
        self.require_function(function_id).await
    }

    /// Stop accepting deploys and invocations for a function.
    pub async fn disable(&self, function_id: &str) -> Result<Function> {
        let _guard = self.lock_function(function_id).await;
        let function = self.require_function(function_id).await?;
        if function.status == FunctionStatus::Deleted {
            return Err(unavailable(&function));
        }
        if function.status != FunctionStatus::Disabled {
            self.store
                .update_function_status(function_id, FunctionStatus::Disabled)
                .await?;
            info!(function_id, "Function disabled");
        }
        self.require_function(function_id).await
    }

    /// Re-enable a disabled function.
    pub async fn enable(&self, function_id: &str) -> Result<Function> {
        let _guard = self.lock_function(function_id).await;
        let function = self.require_function(function_id).await?;
        match function.status {
            FunctionStatus::Deleted => return Err(unavailable(&function)),
            FunctionStatus::Disabled => {
                let status = match self.store.get_active_deployment(function_id).await? {
                    Some(_) => FunctionStatus::Active,
                    None => FunctionStatus::Init,
                };
                self.store.update_function_status(function_id, status).await?;
                info!(function_id, status = %status, "Function enabled");
            }
            _ => {}
        }
        self.require_function(function_id).await
    }

    /// Mark a function deleted, drop its deployments and remove their images.
    ///
    /// Image removal is best effort.
    pub async fn delete_function(&self, function_id: &str) -> Result<()> {
        let _guard = self.lock_function(function_id).await;
        let function = self.require_function(function_id).await?;
        if function.status == FunctionStatus::Deleted {
            return Ok(());
        }

        let removed = self.store.delete_function(function_id).await?;
        for deployment in &removed {
            match self.runtime.delete_image(&deployment.image_tag, true).await {
                Ok(_) => {}
                Err(e) => warn!(
                    function_id,
                    image_tag = %deployment.image_tag,
                    error = %e,
                    "Failed to remove deployment image"
                ),
            }
        }

        info!(function_id, deployments = removed.len(), "Function deleted");
        Ok(())
    }

    async fn require_function(&self, function_id: &str) -> Result<Function> {
        self.store
            .get_function(function_id)
            .await?
            .ok_or_else(|| Error::FunctionNotFound(function_id.to_string()))
    }
}

fn ensure_available(function: &Function) -> Result<()> {
    if function.status.is_available() {
        Ok(())
    } else {
        Err(unavailable(function))
    }
}

fn unavailable(function: &Function) -> Error {
    Error::Unavailable {
        function_id: function.id.clone(),
        reason: format!("function is {}", function.status),
    }
}

/// Run `op`, retrying 5xx daemon errors up to `attempts` times in total.
async fn retry_transient<T, F, Fut>(
    attempts: u32,
    action: &'static str,
    mut op: F,
) -> std::result::Result<T, RuntimeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, RuntimeError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt - 1);
                warn!(action, attempt, error = %e, ?delay, "Transient daemon error, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

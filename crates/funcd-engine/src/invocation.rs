// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded, isolated container invocations.
//!
//! One invocation is one container: created from the active deployment's image, started,
//! waited on under a hard deadline, then always force-deleted. Only fail-fast rejections
//! (missing or unavailable function, backpressure) and store failures surface as errors;
//! everything that happens once a container is involved ends up in the returned record.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use funcd_daemon::{
    ContainerHandle, ContainerLogs, ContainerRuntime, ContainerSpec, ContainerState, RuntimeError,
    WaitCondition,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ResourceLimits;
use crate::error::{Error, Result};
use crate::model::{
    Deployment, InvocationLogs, InvocationRecord, InvocationStatus, image_repository,
};
use crate::store::MetadataStore;

/// Label present on every container funcd creates.
pub const MANAGED_LABEL: &str = "funcd.managed";
/// Label carrying the function id.
pub const FUNCTION_LABEL: &str = "funcd.function_id";
/// Label carrying the deployment id.
pub const DEPLOYMENT_LABEL: &str = "funcd.deployment_id";
/// Label carrying the invocation id.
pub const INVOCATION_LABEL: &str = "funcd.invocation_id";

/// Stderr lines quoted in an error message.
const ERROR_STDERR_LINES: usize = 10;
/// Longest error message stored on a record.
const MAX_ERROR_CHARS: usize = 2000;
/// Upper bound for `list_invocations`.
const MAX_LIST_LIMIT: i64 = 1000;

/// Parameters of one invoke call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvokeRequest {
    /// Passed to the container as `FUNCD_META_<KEY>` environment variables.
    pub metadata: BTreeMap<String, String>,
}

impl InvokeRequest {
    /// Empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Runs invocations against active deployments.
pub struct InvocationExecutor {
    store: Arc<dyn MetadataStore>,
    runtime: Arc<dyn ContainerRuntime>,
    limits: ResourceLimits,
    slots: Arc<Semaphore>,
}

/// How the wait for a container ended.
enum Waited {
    Exited(funcd_daemon::ExitInfo),
    TimedOut,
    Cancelled,
    Failed(RuntimeError),
}

/// Result of running one container, before it is stored.
struct Outcome {
    status: InvocationStatus,
    error: Option<String>,
    logs: Option<InvocationLogs>,
    container_id: Option<String>,
    exit_code: Option<i64>,
}

impl Outcome {
    fn error(container_id: Option<String>, message: String) -> Self {
        Self {
            status: InvocationStatus::Error,
            error: Some(truncate(message)),
            logs: None,
            container_id,
            exit_code: None,
        }
    }
}

impl InvocationExecutor {
    /// Create an executor with `limits.max_concurrent` execution slots.
    pub fn new(
        store: Arc<dyn MetadataStore>,
        runtime: Arc<dyn ContainerRuntime>,
        limits: ResourceLimits,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(limits.max_concurrent));
        Self {
            store,
            runtime,
            limits,
            slots,
        }
    }

    /// Limits applied to every invocation.
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Free execution slots.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Run the function's active deployment once.
    pub async fn invoke(&self, function_id: &str, request: InvokeRequest) -> Result<InvocationRecord> {
        self.invoke_with_cancel(function_id, request, CancellationToken::new())
            .await
    }

    /// Run the function's active deployment once; cancelling `cancel` kills the container
    /// and records an `error` outcome.
    pub async fn invoke_with_cancel(
        &self,
        function_id: &str,
        request: InvokeRequest,
        cancel: CancellationToken,
    ) -> Result<InvocationRecord> {
        if let Some(key) = request.metadata.keys().find(|k| k.trim().is_empty()) {
            return Err(Error::InvalidRequest(format!(
                "metadata key {:?} is empty",
                key
            )));
        }

        let function = self
            .store
            .get_function(function_id)
            .await?
            .ok_or_else(|| Error::FunctionNotFound(function_id.to_string()))?;
        if !function.status.is_available() {
            return Err(Error::Unavailable {
                function_id: function_id.to_string(),
                reason: format!("function is {}", function.status),
            });
        }
        let deployment = self
            .store
            .get_active_deployment(function_id)
            .await?
            .ok_or_else(|| Error::Unavailable {
                function_id: function_id.to_string(),
                reason: "no active deployment".to_string(),
            })?;

        let queued = Instant::now();
        let _permit = match tokio::time::timeout(
            self.limits.slot_wait,
            self.slots.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::Other("execution slots closed".to_string())),
            Err(_) => {
                warn!(
                    function_id,
                    max_concurrent = self.limits.max_concurrent,
                    "Rejecting invocation, no free execution slot"
                );
                return Err(Error::Backpressure {
                    max_concurrent: self.limits.max_concurrent,
                    waited: queued.elapsed(),
                });
            }
        };

        let invocation_id = Uuid::new_v4().to_string();
        let spec = self.container_spec(&deployment, &invocation_id, &request);

        info!(
            function_id,
            deployment_id = %deployment.id,
            invocation_id = %invocation_id,
            version = deployment.version,
            "Invocation started"
        );

        let started = Instant::now();
        let outcome = self.run(&spec, &cancel).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let record = InvocationRecord {
            id: invocation_id,
            function_id: function_id.to_string(),
            deployment_id: deployment.id.clone(),
            status: outcome.status,
            duration_ms,
            error: outcome.error,
            logs: outcome.logs,
            container_id: outcome.container_id,
            exit_code: outcome.exit_code,
            created_at: Utc::now(),
        };
        self.store.insert_invocation(&record).await?;

        info!(
            function_id,
            invocation_id = %record.id,
            status = %record.status,
            duration_ms,
            "Invocation finished"
        );
        Ok(record)
    }

    /// Most recent invocations of a function, newest first.
    pub async fn list_invocations(
        &self,
        function_id: &str,
        limit: i64,
    ) -> Result<Vec<InvocationRecord>> {
        Ok(self
            .store
            .list_invocations(function_id, limit.clamp(1, MAX_LIST_LIMIT))
            .await?)
    }

    /// Fetch one invocation record.
    pub async fn get_invocation(&self, invocation_id: &str) -> Result<Option<InvocationRecord>> {
        Ok(self.store.get_invocation(invocation_id).await?)
    }

    fn container_spec(
        &self,
        deployment: &Deployment,
        invocation_id: &str,
        request: &InvokeRequest,
    ) -> ContainerSpec {
        let short_id: String = invocation_id.chars().take(8).collect();
        let mut spec = ContainerSpec::new(&deployment.image_tag)
            .with_name(format!(
                "{}-{}",
                image_repository(&deployment.function_id),
                short_id
            ))
            .with_memory_bytes(self.limits.memory_bytes())
            .with_cpu_share(self.limits.cpu_share)
            .with_network_mode(&self.limits.network_mode)
            .with_label(MANAGED_LABEL, "true")
            .with_label(FUNCTION_LABEL, &deployment.function_id)
            .with_label(DEPLOYMENT_LABEL, &deployment.id)
            .with_label(INVOCATION_LABEL, invocation_id);

        if let Some(command) = &deployment.command {
            spec = spec.with_command(command.clone());
        }

        // Engine variables are applied last and cannot be overridden.
        spec.env.extend(deployment.env.clone());
        for (key, value) in &request.metadata {
            spec.env.insert(format!("FUNCD_META_{}", env_key(key)), value.clone());
        }
        spec.with_env("FUNCD_FUNCTION_ID", &deployment.function_id)
            .with_env("FUNCD_DEPLOYMENT_VERSION", deployment.version.to_string())
            .with_env("FUNCD_INVOCATION_ID", invocation_id)
    }

    /// Create, run and always remove one container.
    async fn run(&self, spec: &ContainerSpec, cancel: &CancellationToken) -> Outcome {
        let container_id = match self.runtime.create_container(spec).await {
            Ok(id) => id,
            Err(e) => {
                warn!(image = %spec.image, error = %e, "Failed to create container");
                return Outcome::error(None, format!("Failed to create container: {}", e));
            }
        };

        // Removes the container if this future is dropped before cleanup below.
        let mut guard = ContainerGuard::new(
            self.runtime.clone(),
            ContainerHandle::created(container_id),
        );
        let outcome = self.execute(&mut guard.handle, cancel).await;

        let handle = &guard.handle;
        match self.runtime.delete_container(&handle.id, true).await {
            Ok(true) => debug!(container_id = %handle.id, state = %handle.state, "Container removed"),
            Ok(false) => debug!(container_id = %handle.id, "Container already gone"),
            Err(e) => warn!(
                container_id = %handle.id,
                error = %e,
                "Failed to remove container"
            ),
        }
        guard.disarm();

        outcome
    }

    async fn execute(&self, handle: &mut ContainerHandle, cancel: &CancellationToken) -> Outcome {
        let container_id = handle.id.clone();
        let id = Some(container_id.clone());
        let container_id = container_id.as_str();

        if let Err(e) = self.runtime.start_container(container_id).await {
            warn!(container_id, error = %e, "Failed to start container");
            return Outcome::error(id, format!("Failed to start container: {}", e));
        }
        handle.state = ContainerState::Running;

        let timeout = self.limits.timeout;
        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => Waited::Cancelled,
            _ = tokio::time::sleep(timeout) => Waited::TimedOut,
            result = self.runtime.wait_container(
                container_id,
                WaitCondition::NotRunning,
                self.limits.wait_poll_interval,
                timeout,
            ) => match result {
                Ok(exit) => Waited::Exited(exit),
                Err(RuntimeError::WaitTimeout { .. }) => Waited::TimedOut,
                Err(e) => Waited::Failed(e),
            },
        };

        match waited {
            Waited::Exited(exit) => {
                handle.state = ContainerState::Exited;
                let logs = self.collect_logs(container_id).await;
                let (status, error) = if exit.oom_killed {
                    (
                        InvocationStatus::Error,
                        Some(format!(
                            "Out of memory: container exceeded the {} MB memory limit",
                            self.limits.max_memory_mb
                        )),
                    )
                } else if exit.exit_code == 0 {
                    (InvocationStatus::Success, None)
                } else {
                    (
                        InvocationStatus::Error,
                        Some(exit_error(exit.exit_code, logs.as_ref())),
                    )
                };
                Outcome {
                    status,
                    error: error.map(truncate),
                    logs,
                    container_id: id,
                    exit_code: Some(exit.exit_code),
                }
            }
            Waited::TimedOut => {
                warn!(container_id, ?timeout, "Invocation timed out, killing container");
                self.kill(handle).await;
                Outcome {
                    status: InvocationStatus::Timeout,
                    error: Some(format!("Execution timed out after {:?}", timeout)),
                    logs: self.collect_logs(container_id).await,
                    container_id: id,
                    exit_code: None,
                }
            }
            Waited::Cancelled => {
                info!(container_id, "Invocation cancelled, killing container");
                self.kill(handle).await;
                Outcome {
                    logs: self.collect_logs(container_id).await,
                    ..Outcome::error(id, "Invocation cancelled".to_string())
                }
            }
            Waited::Failed(e) => {
                warn!(container_id, error = %e, "Failed waiting for container");
                self.kill(handle).await;
                Outcome::error(id, format!("Failed waiting for container: {}", e))
            }
        }
    }

    async fn kill(&self, handle: &mut ContainerHandle) {
        let container_id = handle.id.as_str();
        match self.runtime.kill_container(container_id, "SIGKILL").await {
            Ok(()) => handle.state = ContainerState::Exited,
            // Exited between the deadline and the kill.
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!(container_id, error = %e, "Container already stopped");
                handle.state = ContainerState::Exited;
            }
            Err(e) => warn!(container_id, error = %e, "Failed to kill container"),
        }
    }

    async fn collect_logs(&self, container_id: &str) -> Option<InvocationLogs> {
        match self.runtime.container_logs(container_id).await {
            Ok(logs) => Some(to_invocation_logs(&logs)),
            Err(e) => {
                warn!(container_id, error = %e, "Failed to fetch container logs");
                None
            }
        }
    }
}

/// Force-deletes a container on a detached task if dropped while still armed.
struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    handle: ContainerHandle,
    armed: bool,
}

impl ContainerGuard {
    fn new(runtime: Arc<dyn ContainerRuntime>, handle: ContainerHandle) -> Self {
        Self {
            runtime,
            handle,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(tokio_handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                container_id = %self.handle.id,
                "No async runtime left to remove abandoned container"
            );
            return;
        };
        warn!(
            container_id = %self.handle.id,
            state = %self.handle.state,
            "Invocation dropped, removing container"
        );
        let runtime = self.runtime.clone();
        let container_id = self.handle.id.clone();
        tokio_handle.spawn(async move {
            if let Err(e) = runtime.delete_container(&container_id, true).await {
                warn!(container_id = %container_id, error = %e, "Failed to remove abandoned container");
            }
        });
    }
}

fn to_invocation_logs(logs: &ContainerLogs) -> InvocationLogs {
    InvocationLogs {
        stdout: logs.stdout_lines(),
        stderr: logs.stderr_lines(),
    }
}

fn exit_error(exit_code: i64, logs: Option<&InvocationLogs>) -> String {
    let mut message = format!("Process exited with code {}", exit_code);
    if let Some(logs) = logs
        && !logs.stderr.is_empty()
    {
        let skip = logs.stderr.len().saturating_sub(ERROR_STDERR_LINES);
        message.push_str(":\n");
        message.push_str(&logs.stderr[skip..].join("\n"));
    }
    message
}

fn truncate(message: String) -> String {
    if message.chars().count() <= MAX_ERROR_CHARS {
        message
    } else {
        message.chars().take(MAX_ERROR_CHARS).collect()
    }
}

/// `FUNCD_META_` suffix for a metadata key: uppercased, other characters become `_`.
fn env_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeploymentStatus, Function, FunctionStatus};
    use crate::store::SqliteStore;
    use funcd_daemon::{MockBehavior, MockRuntime};
    use std::time::Duration;

    struct Fixture {
        executor: Arc<InvocationExecutor>,
        runtime: Arc<MockRuntime>,
        store: Arc<SqliteStore>,
        deployment: Deployment,
    }

    fn test_limits() -> ResourceLimits {
        ResourceLimits {
            timeout: Duration::from_millis(300),
            slot_wait: Duration::from_millis(50),
            wait_poll_interval: Duration::from_millis(5),
            ..ResourceLimits::default()
        }
    }

    async fn fixture(limits: ResourceLimits, behavior: MockBehavior) -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let runtime = Arc::new(MockRuntime::new());
        let now = Utc::now();

        store
            .create_function(&Function {
                id: "fn-1".to_string(),
                owner: "owner-1".to_string(),
                name: "hello".to_string(),
                status: FunctionStatus::Init,
                active_deployment_id: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        let mut env = BTreeMap::new();
        env.insert("MODE".to_string(), "test".to_string());
        let deployment = Deployment {
            id: Uuid::new_v4().to_string(),
            function_id: "fn-1".to_string(),
            version: 1,
            image_tag: crate::model::image_tag("fn-1", 1),
            artifact_key: "functions/fn-1/v1.tar".to_string(),
            status: DeploymentStatus::Building,
            is_active: false,
            error: None,
            command: Some(vec!["python".to_string(), "main.py".to_string()]),
            env,
            created_at: now,
            updated_at: now,
        };
        store.insert_deployment(&deployment).await.unwrap();
        let deployment = store
            .activate_deployment("fn-1", &deployment.id)
            .await
            .unwrap();

        runtime.add_image(&deployment.image_tag).await;
        runtime.set_behavior(&deployment.image_tag, behavior).await;

        let executor = Arc::new(InvocationExecutor::new(
            store.clone(),
            runtime.clone(),
            limits,
        ));
        Fixture {
            executor,
            runtime,
            store,
            deployment,
        }
    }

    #[tokio::test]
    async fn test_successful_invocation_is_recorded() {
        let f = fixture(test_limits(), MockBehavior::exits(0).with_stdout("hello\nworld\n")).await;

        let record = f.executor.invoke("fn-1", InvokeRequest::new()).await.unwrap();
        assert_eq!(record.status, InvocationStatus::Success);
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.deployment_id, f.deployment.id);
        assert_eq!(record.logs.as_ref().unwrap().stdout, vec!["hello", "world"]);
        assert!(record.error.is_none());

        let container_id = record.container_id.clone().unwrap();
        assert!(!f.runtime.container_exists(&container_id).await.unwrap());

        let stored = f.executor.get_invocation(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvocationStatus::Success);
        assert_eq!(stored.logs, record.logs);
        assert_eq!(stored.container_id, record.container_id);
        assert_eq!(f.executor.available_slots(), 16);
    }

    #[tokio::test]
    async fn test_nonzero_exit_quotes_stderr() {
        let f = fixture(
            test_limits(),
            MockBehavior::exits(3).with_stderr("Traceback\nValueError: boom\n"),
        )
        .await;

        let record = f.executor.invoke("fn-1", InvokeRequest::new()).await.unwrap();
        assert_eq!(record.status, InvocationStatus::Error);
        assert_eq!(record.exit_code, Some(3));
        let error = record.error.unwrap();
        assert!(error.starts_with("Process exited with code 3"));
        assert!(error.contains("ValueError: boom"));
    }

    #[tokio::test]
    async fn test_oom_names_memory_limit() {
        let f = fixture(test_limits(), MockBehavior::oom()).await;

        let record = f.executor.invoke("fn-1", InvokeRequest::new()).await.unwrap();
        assert_eq!(record.status, InvocationStatus::Error);
        assert!(record.error.unwrap().contains("20 MB"));
    }

    #[tokio::test]
    async fn test_timeout_kills_and_removes_container() {
        let f = fixture(test_limits(), MockBehavior::hangs()).await;

        let record = f.executor.invoke("fn-1", InvokeRequest::new()).await.unwrap();
        assert_eq!(record.status, InvocationStatus::Timeout);
        assert!(record.duration_ms >= 300);
        let container_id = record.container_id.unwrap();
        assert!(!f.runtime.container_exists(&container_id).await.unwrap());
        assert_eq!(f.runtime.container_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_kills_container() {
        let limits = ResourceLimits {
            timeout: Duration::from_secs(10),
            ..test_limits()
        };
        let f = fixture(limits, MockBehavior::hangs()).await;

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let record = f
            .executor
            .invoke_with_cancel("fn-1", InvokeRequest::new(), token)
            .await
            .unwrap();
        assert_eq!(record.status, InvocationStatus::Error);
        assert!(record.error.unwrap().contains("cancelled"));
        assert!(record.duration_ms < 10_000);
        assert_eq!(f.runtime.container_count().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_invocation_removes_container() {
        let limits = ResourceLimits {
            timeout: Duration::from_secs(10),
            ..test_limits()
        };
        let f = fixture(limits, MockBehavior::hangs()).await;

        let executor = f.executor.clone();
        let task =
            tokio::spawn(async move { executor.invoke("fn-1", InvokeRequest::new()).await });
        tokio::time::timeout(Duration::from_secs(1), async {
            while f.runtime.container_count().await == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        tokio::time::timeout(Duration::from_secs(1), async {
            while f.runtime.container_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(f.executor.available_slots(), f.executor.limits().max_concurrent);
        assert!(f.executor.list_invocations("fn-1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backpressure_when_slots_busy() {
        let limits = ResourceLimits {
            max_concurrent: 1,
            timeout: Duration::from_secs(2),
            ..test_limits()
        };
        let f = fixture(limits, MockBehavior::hangs()).await;

        let token = CancellationToken::new();
        let executor = f.executor.clone();
        let running = {
            let token = token.clone();
            tokio::spawn(async move {
                executor
                    .invoke_with_cancel("fn-1", InvokeRequest::new(), token)
                    .await
            })
        };

        for _ in 0..100 {
            if f.runtime.container_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = f
            .executor
            .invoke("fn-1", InvokeRequest::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backpressure { max_concurrent: 1, .. }));

        token.cancel();
        running.await.unwrap().unwrap();
        assert_eq!(f.executor.available_slots(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_function_fails_fast() {
        let f = fixture(test_limits(), MockBehavior::default()).await;
        f.store
            .update_function_status("fn-1", FunctionStatus::Disabled)
            .await
            .unwrap();

        let err = f
            .executor
            .invoke("fn-1", InvokeRequest::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable { .. }));
        assert_eq!(f.runtime.container_count().await, 0);

        assert!(matches!(
            f.executor.invoke("missing", InvokeRequest::new()).await,
            Err(Error::FunctionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_failure_is_recorded() {
        let f = fixture(test_limits(), MockBehavior::default()).await;
        f.runtime
            .delete_image(&f.deployment.image_tag, true)
            .await
            .unwrap();

        let record = f.executor.invoke("fn-1", InvokeRequest::new()).await.unwrap();
        assert_eq!(record.status, InvocationStatus::Error);
        assert!(record.container_id.is_none());
        assert!(record.error.unwrap().starts_with("Failed to create container"));

        let listed = f.executor.list_invocations("fn-1", 10).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_container_spec_carries_limits_env_and_labels() {
        let f = fixture(test_limits(), MockBehavior::default()).await;
        let request = InvokeRequest::new()
            .with_metadata("request-id", "r-42")
            .with_metadata("FUNCD_FUNCTION_ID", "spoofed");

        let spec = f
            .executor
            .container_spec(&f.deployment, "0123456789abcdef", &request);

        assert_eq!(spec.image, "funcd-fn-fn-1-66e16dd5:v1");
        assert_eq!(spec.name.as_deref(), Some("funcd-fn-fn-1-66e16dd5-01234567"));
        assert_eq!(spec.memory_bytes, Some(20 * 1024 * 1024));
        assert_eq!(spec.cpu_share, Some(0.5));
        assert_eq!(spec.network_mode.as_deref(), Some("none"));
        assert_eq!(
            spec.command,
            Some(vec!["python".to_string(), "main.py".to_string()])
        );

        assert_eq!(spec.env["FUNCD_FUNCTION_ID"], "fn-1");
        assert_eq!(spec.env["FUNCD_DEPLOYMENT_VERSION"], "1");
        assert_eq!(spec.env["FUNCD_INVOCATION_ID"], "0123456789abcdef");
        assert_eq!(spec.env["FUNCD_META_REQUEST_ID"], "r-42");
        assert_eq!(spec.env["FUNCD_META_FUNCD_FUNCTION_ID"], "spoofed");
        assert_eq!(spec.env["MODE"], "test");

        assert_eq!(spec.labels[MANAGED_LABEL], "true");
        assert_eq!(spec.labels[FUNCTION_LABEL], "fn-1");
        assert_eq!(spec.labels[DEPLOYMENT_LABEL], f.deployment.id);
        assert_eq!(spec.labels[INVOCATION_LABEL], "0123456789abcdef");
    }

    #[test]
    fn test_error_text_is_bounded() {
        let logs = InvocationLogs {
            stdout: vec![],
            stderr: (0..50).map(|i| format!("line {}", i)).collect(),
        };
        let message = exit_error(1, Some(&logs));
        assert!(!message.contains("line 39"));
        assert!(message.contains("line 40"));
        assert!(message.ends_with("line 49"));

        assert_eq!(truncate("x".repeat(5000)).chars().count(), MAX_ERROR_CHARS);
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runtime for testing.
//!
//! Keeps images and containers in memory. A started container either exits immediately
//! according to its [`MockBehavior`] or keeps running until stopped or killed.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::error::{Result, RuntimeError};
use crate::paths::split_reference;
use crate::runtime::ContainerRuntime;
use crate::types::{
    BuildOptions, BuildOutput, ContainerFilters, ContainerInspect, ContainerLogs, ContainerSpec,
    ContainerState, ContainerStats, ContainerSummary, ImageSummary, PruneReport, StopOutcome,
    normalize_signal,
};

/// How a mock container behaves once started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockBehavior {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    /// Keep running until stopped or killed.
    pub hang: bool,
    pub oom_killed: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            exit_code: 0,
            stdout: "ok\n".to_string(),
            stderr: String::new(),
            hang: false,
            oom_killed: false,
        }
    }
}

impl MockBehavior {
    pub fn exits(code: i64) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    pub fn hangs() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn oom() -> Self {
        Self {
            exit_code: 137,
            oom_killed: true,
            stdout: String::new(),
            ..Self::default()
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }
}

#[derive(Debug, Clone)]
struct MockContainer {
    id: String,
    name: String,
    spec: ContainerSpec,
    state: ContainerState,
    exit_code: i64,
    oom_killed: bool,
    behavior: MockBehavior,
    created: i64,
}

impl MockContainer {
    fn run(&mut self) {
        if self.behavior.hang {
            self.state = ContainerState::Running;
        } else {
            self.state = ContainerState::Exited;
            self.exit_code = self.behavior.exit_code;
            self.oom_killed = self.behavior.oom_killed;
        }
    }

    fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            id: self.id.clone(),
            names: vec![format!("/{}", self.name)],
            image: self.spec.image.clone(),
            state: self.state.to_string(),
            status: self.state.to_string(),
            labels: Some(self.spec.labels.clone().into_iter().collect()),
            created: self.created,
        }
    }
}

/// In-memory [`ContainerRuntime`] with failure injection.
#[derive(Default)]
pub struct MockRuntime {
    images: Mutex<BTreeSet<String>>,
    containers: Mutex<HashMap<String, MockContainer>>,
    behaviors: Mutex<HashMap<String, MockBehavior>>,
    default_behavior: Mutex<MockBehavior>,
    failing_kills: Mutex<HashSet<String>>,
    created_specs: Mutex<Vec<ContainerSpec>>,
    fail_builds: AtomicBool,
    failing_pulls: AtomicUsize,
    next_id: AtomicU64,
    /// Unix seconds used as the creation time of new containers; 0 means now.
    clock: AtomicU64,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load an image.
    pub async fn add_image(&self, reference: &str) {
        self.images.lock().await.insert(normalize_reference(reference));
    }

    /// Behaviour for containers created from `image`.
    pub async fn set_behavior(&self, image: &str, behavior: MockBehavior) {
        self.behaviors
            .lock()
            .await
            .insert(normalize_reference(image), behavior);
    }

    /// Behaviour for images without their own.
    pub async fn set_default_behavior(&self, behavior: MockBehavior) {
        *self.default_behavior.lock().await = behavior;
    }

    /// Make every build fail.
    pub fn fail_builds(&self, fail: bool) {
        self.fail_builds.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` pulls fail with a 503.
    pub fn fail_next_pulls(&self, count: usize) {
        self.failing_pulls.store(count, Ordering::SeqCst);
    }

    /// Make kills of container `id` fail with a 500.
    pub async fn fail_kill(&self, id: &str) {
        self.failing_kills.lock().await.insert(id.to_string());
    }

    /// Creation time (Unix seconds) stamped on containers created from now on.
    pub fn set_clock(&self, unix_secs: u64) {
        self.clock.store(unix_secs, Ordering::SeqCst);
    }

    pub async fn container_count(&self) -> usize {
        self.containers.lock().await.len()
    }

    pub async fn container_spec(&self, id: &str) -> Option<ContainerSpec> {
        self.containers.lock().await.get(id).map(|c| c.spec.clone())
    }

    /// Specs of every container created so far, including removed ones.
    pub async fn created_specs(&self) -> Vec<ContainerSpec> {
        self.created_specs.lock().await.clone()
    }

    pub async fn container_state(&self, id: &str) -> Option<ContainerState> {
        self.containers.lock().await.get(id).map(|c| c.state)
    }

    pub async fn image_count(&self) -> usize {
        self.images.lock().await.len()
    }

    fn now(&self) -> i64 {
        match self.clock.load(Ordering::SeqCst) {
            0 => std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or_default(),
            secs => secs as i64,
        }
    }
}

fn normalize_reference(reference: &str) -> String {
    match split_reference(reference) {
        (repo, Some(tag)) => format!("{}:{}", repo, tag),
        (whole, None) => whole.to_string(),
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn runtime_type(&self) -> &'static str {
        "mock"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn platform(&self) -> String {
        "linux/amd64".to_string()
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        let remaining = self.failing_pulls.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_pulls.store(remaining - 1, Ordering::SeqCst);
            return Err(RuntimeError::Daemon {
                status: 503,
                message: "registry unavailable".to_string(),
            });
        }
        self.images.lock().await.insert(normalize_reference(reference));
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        Ok(self
            .images
            .lock()
            .await
            .contains(&normalize_reference(reference)))
    }

    async fn delete_image(&self, reference: &str, _force: bool) -> Result<bool> {
        Ok(self
            .images
            .lock()
            .await
            .remove(&normalize_reference(reference)))
    }

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> Result<()> {
        let mut images = self.images.lock().await;
        if !images.contains(&normalize_reference(source)) {
            return Err(RuntimeError::NotFound(source.to_string()));
        }
        images.insert(format!("{}:{}", repo, tag));
        Ok(())
    }

    async fn build_image(
        &self,
        tag: &str,
        context: Bytes,
        options: &BuildOptions,
    ) -> Result<BuildOutput> {
        if self.fail_builds.load(Ordering::SeqCst) {
            return Err(RuntimeError::BuildFailed(
                "COPY failed: file not found in build context".to_string(),
            ));
        }

        let mut images = self.images.lock().await;
        let key = normalize_reference(tag);
        if images.contains(&key) && !options.force {
            return Err(RuntimeError::ImageExists(tag.to_string()));
        }
        images.insert(key);

        Ok(BuildOutput {
            image_id: Some(format!("sha256:{:064x}", context.len())),
            platform: options
                .platform
                .clone()
                .unwrap_or_else(|| "linux/amd64".to_string()),
            logs: vec![
                format!("Step 1/1 : FROM {}", options.dockerfile),
                format!("Successfully tagged {}", tag),
            ],
        })
    }

    async fn list_images(&self, _all: bool) -> Result<Vec<ImageSummary>> {
        Ok(self
            .images
            .lock()
            .await
            .iter()
            .map(|reference| ImageSummary {
                id: format!("sha256:{}", reference),
                repo_tags: Some(vec![reference.clone()]),
                repo_digests: None,
                size: 0,
                created: 0,
            })
            .collect())
    }

    async fn prune_images(&self) -> Result<PruneReport> {
        Ok(PruneReport::default())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        if !self.image_exists(&spec.image).await? {
            return Err(RuntimeError::NotFound(spec.image.clone()));
        }
        let behavior = self
            .behaviors
            .lock()
            .await
            .get(&normalize_reference(&spec.image))
            .cloned();
        let behavior = match behavior {
            Some(b) => b,
            None => self.default_behavior.lock().await.clone(),
        };

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("mock{:012x}", n);
        let name = spec.name.clone().unwrap_or_else(|| id.clone());

        let mut containers = self.containers.lock().await;
        if containers.values().any(|c| c.name == name) {
            return Err(RuntimeError::Conflict(format!(
                "container name {} is already in use",
                name
            )));
        }
        self.created_specs.lock().await.push(spec.clone());
        containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name,
                spec: spec.clone(),
                state: ContainerState::Created,
                exit_code: 0,
                oom_killed: false,
                behavior,
                created: self.now(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if container.state != ContainerState::Running {
            container.run();
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Option<Duration>) -> Result<StopOutcome> {
        let mut containers = self.containers.lock().await;
        let Some(container) = containers.get_mut(id) else {
            return Ok(StopOutcome::NotFound);
        };
        if !container.state.is_running() {
            return Ok(StopOutcome::AlreadyStopped);
        }
        container.state = ContainerState::Exited;
        container.exit_code = 143;
        Ok(StopOutcome::Stopped)
    }

    async fn kill_container(&self, id: &str, signal: &str) -> Result<()> {
        normalize_signal(signal)?;
        if self.failing_kills.lock().await.contains(id) {
            return Err(RuntimeError::Daemon {
                status: 500,
                message: format!("kill of {} failed", id),
            });
        }
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if !container.state.is_running() {
            return Err(RuntimeError::Conflict(format!(
                "container {} is not running",
                id
            )));
        }
        container.state = ContainerState::Exited;
        container.exit_code = 137;
        Ok(())
    }

    async fn pause_container(&self, id: &str) -> Result<()> {
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if container.state != ContainerState::Running {
            return Err(RuntimeError::Conflict(format!(
                "container {} is not running",
                id
            )));
        }
        container.state = ContainerState::Paused;
        Ok(())
    }

    async fn unpause_container(&self, id: &str) -> Result<()> {
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if container.state != ContainerState::Paused {
            return Err(RuntimeError::Conflict(format!(
                "container {} is not paused",
                id
            )));
        }
        container.state = ContainerState::Running;
        Ok(())
    }

    async fn restart_container(&self, id: &str, _timeout: Option<Duration>) -> Result<()> {
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.run();
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect> {
        let containers = self.containers.lock().await;
        let container = containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        Ok(ContainerInspect {
            id: container.id.clone(),
            name: container.name.clone(),
            image: container.spec.image.clone(),
            state: container.state,
            exit_code: container.exit_code,
            oom_killed: container.oom_killed,
            labels: container.spec.labels.clone().into_iter().collect(),
            created: None,
            started_at: None,
            finished_at: None,
        })
    }

    async fn container_exists(&self, id: &str) -> Result<bool> {
        Ok(self.containers.lock().await.contains_key(id))
    }

    async fn delete_container(&self, id: &str, force: bool) -> Result<bool> {
        let mut containers = self.containers.lock().await;
        match containers.get(id) {
            None => Ok(false),
            Some(c) if c.state.is_running() && !force => Err(RuntimeError::Conflict(format!(
                "container {} is running; stop it or use force",
                id
            ))),
            Some(_) => {
                containers.remove(id);
                Ok(true)
            }
        }
    }

    async fn container_logs(&self, id: &str) -> Result<ContainerLogs> {
        let containers = self.containers.lock().await;
        let container = containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if container.state == ContainerState::Created {
            return Ok(ContainerLogs::default());
        }
        Ok(ContainerLogs {
            stdout: container.behavior.stdout.clone(),
            stderr: container.behavior.stderr.clone(),
        })
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerStats> {
        let containers = self.containers.lock().await;
        let container = containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        Ok(ContainerStats {
            memory_limit: container.spec.memory_bytes.unwrap_or(0).max(0) as u64,
            online_cpus: 1,
            ..ContainerStats::default()
        })
    }

    async fn list_containers(
        &self,
        filters: &ContainerFilters,
        all: bool,
    ) -> Result<Vec<ContainerSummary>> {
        let containers = self.containers.lock().await;
        let mut listed: Vec<ContainerSummary> = containers
            .values()
            .filter(|c| all || c.state.is_running())
            .filter(|c| filters.matches(&c.name, &c.spec.image, c.state, &c.spec.labels))
            .map(MockContainer::summary)
            .collect();
        listed.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(listed)
    }
}

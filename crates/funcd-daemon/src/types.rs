// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container and image model shared by every runtime implementation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use bytes::{Buf, Bytes};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{Result, RuntimeError};

/// Restart policy forwarded to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    UnlessStopped,
    OnFailure { max_retries: u32 },
}

impl RestartPolicy {
    fn to_json(self) -> Value {
        match self {
            RestartPolicy::No => json!({"Name": "no"}),
            RestartPolicy::Always => json!({"Name": "always"}),
            RestartPolicy::UnlessStopped => json!({"Name": "unless-stopped"}),
            RestartPolicy::OnFailure { max_retries } => {
                json!({"Name": "on-failure", "MaximumRetryCount": max_retries})
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
    /// `tcp` or `udp`.
    pub protocol: String,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: Option<String>,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// Memory ceiling in bytes. Swap is capped to the same value.
    pub memory_bytes: Option<i64>,
    /// CPUs available to the container, e.g. `0.5`.
    pub cpu_share: Option<f64>,
    pub mounts: Vec<BindMount>,
    pub ports: Vec<PortBinding>,
    pub dns: Vec<String>,
    pub restart_policy: RestartPolicy,
    pub auto_remove: bool,
    pub network_mode: Option<String>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            name: None,
            image: image.into(),
            command: None,
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            memory_bytes: None,
            cpu_share: None,
            mounts: Vec::new(),
            ports: Vec::new(),
            dns: Vec::new(),
            restart_policy: RestartPolicy::No,
            auto_remove: false,
            network_mode: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Saturates at `i64::MAX` bytes.
    pub fn with_memory_mb(self, mb: u64) -> Self {
        let bytes = i64::try_from(mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX);
        self.with_memory_bytes(bytes)
    }

    pub fn with_memory_bytes(mut self, bytes: i64) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }

    pub fn with_cpu_share(mut self, cpus: f64) -> Self {
        self.cpu_share = Some(cpus);
        self
    }

    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    /// Body of the `containers/create` request.
    pub fn to_create_body(&self) -> Value {
        let mut host_config = serde_json::Map::new();
        if let Some(memory) = self.memory_bytes {
            host_config.insert("Memory".into(), json!(memory));
            host_config.insert("MemorySwap".into(), json!(memory));
            host_config.insert("MemorySwappiness".into(), json!(0));
        }
        if let Some(cpus) = self.cpu_share {
            host_config.insert("NanoCpus".into(), json!((cpus * 1e9) as i64));
        }
        if !self.mounts.is_empty() {
            let binds: Vec<String> = self
                .mounts
                .iter()
                .map(|m| {
                    let mode = if m.read_only { "ro" } else { "rw" };
                    format!("{}:{}:{}", m.source, m.target, mode)
                })
                .collect();
            host_config.insert("Binds".into(), json!(binds));
        }
        let mut exposed = serde_json::Map::new();
        if !self.ports.is_empty() {
            let mut bindings = serde_json::Map::new();
            for port in &self.ports {
                let key = format!("{}/{}", port.container_port, port.protocol);
                exposed.insert(key.clone(), json!({}));
                bindings.insert(key, json!([{"HostPort": port.host_port.to_string()}]));
            }
            host_config.insert("PortBindings".into(), Value::Object(bindings));
        }
        if !self.dns.is_empty() {
            host_config.insert("Dns".into(), json!(self.dns));
        }
        host_config.insert("RestartPolicy".into(), self.restart_policy.to_json());
        host_config.insert("AutoRemove".into(), json!(self.auto_remove));
        if let Some(mode) = &self.network_mode {
            host_config.insert("NetworkMode".into(), json!(mode));
        }

        let env: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut body = json!({
            "Image": self.image,
            "Env": env,
            "Labels": self.labels,
            "HostConfig": Value::Object(host_config),
        });
        if let Some(cmd) = &self.command {
            body["Cmd"] = json!(cmd);
        }
        if !exposed.is_empty() {
            body["ExposedPorts"] = Value::Object(exposed);
        }
        body
    }
}

/// Observed container state, collapsed from the daemon's status strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Exited,
    Unknown,
}

impl ContainerState {
    pub fn from_daemon(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "created" | "configured" | "initialized" => ContainerState::Created,
            "running" | "restarting" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "exited" | "dead" | "stopped" | "removing" => ContainerState::Exited,
            _ => ContainerState::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running | ContainerState::Paused)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Exited => "exited",
            ContainerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A container id and the last state observed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub state: ContainerState,
}

impl ContainerHandle {
    pub fn created(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: ContainerState::Created,
        }
    }
}

/// What `wait` blocks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    NotRunning,
    Running,
    Removed,
}

impl WaitCondition {
    pub(crate) fn is_met(&self, state: ContainerState) -> bool {
        match self {
            WaitCondition::NotRunning => state == ContainerState::Exited,
            WaitCondition::Running => state == ContainerState::Running,
            WaitCondition::Removed => false,
        }
    }
}

/// Outcome of a completed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub exit_code: i64,
    pub oom_killed: bool,
    pub state: ContainerState,
}

/// Subset of `containers/{id}/json` the engine relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInspect {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub exit_code: i64,
    pub oom_killed: bool,
    pub labels: HashMap<String, String>,
    pub created: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl ContainerInspect {
    pub fn from_value(value: &Value) -> Self {
        let str_at = |ptr: &str| value.pointer(ptr).and_then(Value::as_str).map(str::to_string);
        let labels = value
            .pointer("/Config/Labels")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            id: str_at("/Id").unwrap_or_default(),
            name: str_at("/Name")
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image: str_at("/Config/Image").unwrap_or_default(),
            state: str_at("/State/Status")
                .map(|s| ContainerState::from_daemon(&s))
                .unwrap_or(ContainerState::Unknown),
            exit_code: value
                .pointer("/State/ExitCode")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            oom_killed: value
                .pointer("/State/OOMKilled")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            labels,
            created: str_at("/Created"),
            started_at: str_at("/State/StartedAt"),
            finished_at: str_at("/State/FinishedAt"),
        }
    }

    pub fn exit_info(&self) -> ExitInfo {
        ExitInfo {
            exit_code: self.exit_code,
            oom_killed: self.oom_killed,
            state: self.state,
        }
    }
}

/// Filter set for container listing; empty fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilters {
    pub labels: Vec<String>,
    pub name: Option<String>,
    pub status: Option<String>,
    pub ancestor: Option<String>,
}

impl ContainerFilters {
    pub fn new() -> Self {
        Self::default()
    }

    /// `key=value` or bare `key`.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn ancestor(mut self, image: impl Into<String>) -> Self {
        self.ancestor = Some(image.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
            && self.name.is_none()
            && self.status.is_none()
            && self.ancestor.is_none()
    }

    /// The `filters` query parameter value, e.g. `{"label":["app=x"]}`.
    pub fn to_query_json(&self) -> String {
        let mut map: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        if !self.labels.is_empty() {
            map.insert("label", self.labels.iter().map(String::as_str).collect());
        }
        if let Some(name) = &self.name {
            map.insert("name", vec![name]);
        }
        if let Some(status) = &self.status {
            map.insert("status", vec![status]);
        }
        if let Some(ancestor) = &self.ancestor {
            map.insert("ancestor", vec![ancestor]);
        }
        serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
    }

    /// Evaluate the filter locally against a container's attributes.
    pub fn matches(
        &self,
        name: &str,
        image: &str,
        state: ContainerState,
        labels: &BTreeMap<String, String>,
    ) -> bool {
        let labels_ok = self.labels.iter().all(|filter| match filter.split_once('=') {
            Some((k, v)) => labels.get(k).map(|actual| actual == v).unwrap_or(false),
            None => labels.contains_key(filter.as_str()),
        });
        let name_ok = self.name.as_deref().is_none_or(|n| name.contains(n));
        let status_ok = self
            .status
            .as_deref()
            .is_none_or(|s| ContainerState::from_daemon(s) == state);
        let ancestor_ok = self.ancestor.as_deref().is_none_or(|a| a == image);
        labels_ok && name_ok && status_ok && ancestor_ok
    }
}

/// One entry of `containers/json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "Labels", default)]
    pub labels: Option<HashMap<String, String>>,
    /// Unix seconds.
    #[serde(rename = "Created", default)]
    pub created: i64,
}

impl ContainerSummary {
    pub fn state(&self) -> ContainerState {
        ContainerState::from_daemon(&self.state)
    }

    pub fn name(&self) -> &str {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or_default()
    }
}

/// One entry of `images/json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Option<Vec<String>>,
    #[serde(rename = "RepoDigests", default)]
    pub repo_digests: Option<Vec<String>>,
    #[serde(rename = "Size", default)]
    pub size: i64,
    #[serde(rename = "Created", default)]
    pub created: i64,
}

impl ImageSummary {
    pub fn tags(&self) -> &[String] {
        self.repo_tags.as_deref().unwrap_or_default()
    }

    pub fn digest(&self) -> Option<&str> {
        self.repo_digests
            .as_ref()
            .and_then(|d| d.first())
            .map(String::as_str)
    }
}

/// Container output split by stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLogs {
    pub stdout: String,
    pub stderr: String,
}

impl ContainerLogs {
    /// Split a raw log body.
    ///
    /// Multiplexed bodies carry 8-byte frame headers: stream byte (1 stdout, 2 stderr),
    /// three zero bytes, big-endian payload length. Anything else is a TTY stream and is
    /// taken as stdout.
    pub fn demux(raw: &[u8]) -> Self {
        if !looks_multiplexed(raw) {
            return Self {
                stdout: String::from_utf8_lossy(raw).into_owned(),
                stderr: String::new(),
            };
        }

        let mut buf = Bytes::copy_from_slice(raw);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        while buf.remaining() >= 8 {
            let stream = buf.get_u8();
            buf.advance(3);
            let len = buf.get_u32() as usize;
            let take = len.min(buf.remaining());
            let payload = buf.split_to(take);
            match stream {
                2 => stderr.extend_from_slice(&payload),
                _ => stdout.extend_from_slice(&payload),
            }
        }

        Self {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        }
    }

    pub fn stdout_lines(&self) -> Vec<String> {
        self.stdout.lines().map(str::to_string).collect()
    }

    pub fn stderr_lines(&self) -> Vec<String> {
        self.stderr.lines().map(str::to_string).collect()
    }
}

fn looks_multiplexed(raw: &[u8]) -> bool {
    raw.len() >= 8 && raw[0] <= 2 && raw[1..4] == [0, 0, 0]
}

/// Point-in-time resource usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub cpu_total_usage: u64,
    pub system_cpu_usage: u64,
    pub online_cpus: u64,
    pub pids: u64,
}

impl ContainerStats {
    pub fn from_value(value: &Value) -> Self {
        let u64_at = |ptr: &str| value.pointer(ptr).and_then(Value::as_u64).unwrap_or(0);
        Self {
            memory_usage: u64_at("/memory_stats/usage"),
            memory_limit: u64_at("/memory_stats/limit"),
            cpu_total_usage: u64_at("/cpu_stats/cpu_usage/total_usage"),
            system_cpu_usage: u64_at("/cpu_stats/system_cpu_usage"),
            online_cpus: u64_at("/cpu_stats/online_cpus"),
            pids: u64_at("/pids_stats/current"),
        }
    }
}

/// Image build parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub dockerfile: String,
    pub build_args: BTreeMap<String, String>,
    /// `os/arch`; detected from the daemon when unset.
    pub platform: Option<String>,
    pub nocache: bool,
    /// Remove intermediate containers.
    pub rm: bool,
    /// Replace an existing image with the same tag.
    pub force: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            dockerfile: "Dockerfile".to_string(),
            build_args: BTreeMap::new(),
            platform: None,
            nocache: false,
            rm: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutput {
    pub image_id: Option<String>,
    pub platform: String,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub images_deleted: Vec<String>,
    pub space_reclaimed: u64,
}

impl PruneReport {
    pub fn from_value(value: &Value) -> Self {
        let images_deleted = value
            .get("ImagesDeleted")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| {
                        e.get("Deleted")
                            .or_else(|| e.get("Untagged"))
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            images_deleted,
            space_reclaimed: value
                .get("SpaceReclaimed")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        }
    }
}

/// Result of a stop request. Only `Stopped` changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
    NotFound,
}

/// Canonical signal name (`SIGKILL`) for a name, short name or number.
pub fn normalize_signal(signal: &str) -> Result<&'static str> {
    let trimmed = signal.trim();
    let invalid = || RuntimeError::InvalidSignal(signal.to_string());

    if let Ok(number) = trimmed.parse::<i32>() {
        return Signal::try_from(number).map(|s| s.as_str()).map_err(|_| invalid());
    }

    let upper = trimmed.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&name).map(|s| s.as_str()).map_err(|_| invalid())
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! [`ContainerRuntime`] backed by a Docker- or Podman-compatible daemon.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::error::{Result, RuntimeError, check_status, daemon_message};
use crate::paths::{ApiPaths, DaemonFlavor, split_reference};
use crate::protocol::{Request, Response, SocketClient};
use crate::runtime::ContainerRuntime;
use crate::types::{
    BuildOptions, BuildOutput, ContainerFilters, ContainerInspect, ContainerLogs, ContainerSpec,
    ContainerStats, ContainerSummary, ImageSummary, PruneReport, StopOutcome, normalize_signal,
};

/// Platform reported when the daemon's host info is unavailable.
pub const DEFAULT_PLATFORM: &str = "linux/amd64";

/// Container runtime talking to a daemon over its Unix socket.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket: SocketClient,
    paths: ApiPaths,
}

impl DaemonClient {
    pub fn new(config: DaemonConfig) -> Self {
        let socket = SocketClient::new(config.socket_path, config.api_version)
            .with_timeout(config.request_timeout);
        Self {
            socket,
            paths: ApiPaths::new(config.flavor),
        }
    }

    pub fn from_env() -> Self {
        Self::new(DaemonConfig::from_env())
    }

    pub fn socket(&self) -> &SocketClient {
        &self.socket
    }

    pub fn flavor(&self) -> DaemonFlavor {
        self.paths.flavor()
    }

    async fn call(&self, request: Request, subject: &str) -> Result<Response> {
        let response = self.socket.send(request).await?;
        check_status(response, subject)
    }

    /// GET a probe path: success means present, 404 means absent.
    async fn probe(&self, path: String, subject: &str) -> Result<bool> {
        let response = self.socket.send(Request::get(path)).await?;
        if response.status == 404 {
            return Ok(false);
        }
        check_status(response, subject).map(|_| true)
    }

    fn stop_query(timeout: Option<Duration>) -> String {
        timeout
            .map(|t| format!("?t={}", t.as_secs()))
            .unwrap_or_default()
    }
}

/// Split a streamed progress body into JSON messages.
fn progress_messages(body: &[u8]) -> Vec<Value> {
    serde_json::Deserializer::from_slice(body)
        .into_iter::<Value>()
        .filter_map(|m| m.ok())
        .collect()
}

fn stream_error(message: &Value) -> Option<String> {
    message
        .get("error")
        .or_else(|| message.pointer("/errorDetail/message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Map daemon host info to `os/arch`.
pub(crate) fn platform_from_info(info: &Value) -> Option<String> {
    let (os, arch) = match (
        info.pointer("/host/os").and_then(Value::as_str),
        info.pointer("/host/arch").and_then(Value::as_str),
    ) {
        (Some(os), Some(arch)) => (os, arch),
        _ => (
            info.get("OSType").and_then(Value::as_str)?,
            info.get("Architecture").and_then(Value::as_str)?,
        ),
    };
    let arch = match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    Some(format!("{}/{}", os, arch))
}

#[async_trait]
impl ContainerRuntime for DaemonClient {
    fn runtime_type(&self) -> &'static str {
        match self.paths.flavor() {
            DaemonFlavor::Podman => "podman",
            DaemonFlavor::Docker => "docker",
        }
    }

    async fn ping(&self) -> Result<()> {
        self.call(Request::get(self.paths.ping()), "daemon").await?;
        Ok(())
    }

    async fn platform(&self) -> String {
        let info = match self.call(Request::get(self.paths.info()), "info").await {
            Ok(response) => response.json::<Value>().ok(),
            Err(e) => {
                warn!(error = %e, "Failed to read daemon info");
                None
            }
        };
        info.as_ref()
            .and_then(platform_from_info)
            .unwrap_or_else(|| DEFAULT_PLATFORM.to_string())
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        let (repository, tag) = split_reference(reference);
        info!(image = %reference, "Pulling image");

        let response = self
            .call(
                Request::post(self.paths.image_pull(repository, tag)),
                reference,
            )
            .await?;

        if let Some(error) = progress_messages(&response.body).iter().find_map(stream_error) {
            return Err(RuntimeError::PullFailed(error));
        }
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        self.probe(self.paths.image_exists(reference), reference)
            .await
    }

    async fn delete_image(&self, reference: &str, force: bool) -> Result<bool> {
        match self
            .call(
                Request::delete(self.paths.image_delete(reference, force)),
                reference,
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(RuntimeError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> Result<()> {
        self.call(
            Request::post(self.paths.image_tag(source, repo, tag)),
            source,
        )
        .await?;
        Ok(())
    }

    async fn build_image(
        &self,
        tag: &str,
        context: Bytes,
        options: &BuildOptions,
    ) -> Result<BuildOutput> {
        if self.image_exists(tag).await? {
            if !options.force {
                return Err(RuntimeError::ImageExists(tag.to_string()));
            }
            info!(image = %tag, "Removing existing image before rebuild");
            self.delete_image(tag, true).await?;
        }

        let platform = match &options.platform {
            Some(p) => p.clone(),
            None => self.platform().await,
        };

        let mut query = vec![
            ("t", tag.to_string()),
            ("dockerfile", options.dockerfile.clone()),
            ("rm", options.rm.to_string()),
            ("nocache", options.nocache.to_string()),
            ("platform", platform.clone()),
        ];
        if !options.build_args.is_empty() {
            query.push(("buildargs", serde_json::to_string(&options.build_args)?));
        }

        info!(image = %tag, platform = %platform, context_bytes = context.len(), "Building image");

        let response = self
            .call(
                Request::post(self.paths.build(&query)).body("application/x-tar", context),
                tag,
            )
            .await
            .map_err(|e| match e {
                RuntimeError::Daemon { message, .. } => RuntimeError::BuildFailed(message),
                other => other,
            })?;

        let mut output = BuildOutput {
            image_id: None,
            platform,
            logs: Vec::new(),
        };
        for message in progress_messages(&response.body) {
            if let Some(error) = stream_error(&message) {
                return Err(RuntimeError::BuildFailed(error));
            }
            if let Some(line) = message.get("stream").and_then(Value::as_str) {
                let line = line.trim();
                if !line.is_empty() {
                    output.logs.push(line.to_string());
                }
            }
            if let Some(id) = message.pointer("/aux/ID").and_then(Value::as_str) {
                output.image_id = Some(id.to_string());
            }
        }

        debug!(image = %tag, log_lines = output.logs.len(), "Image build finished");
        Ok(output)
    }

    async fn list_images(&self, all: bool) -> Result<Vec<ImageSummary>> {
        let response = self
            .call(Request::get(self.paths.images_list(all)), "images")
            .await?;
        Ok(response.json()?)
    }

    async fn prune_images(&self) -> Result<PruneReport> {
        let response = self
            .call(Request::post(self.paths.images_prune()), "images")
            .await?;
        Ok(PruneReport::from_value(&response.json::<Value>()?))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let request = Request::post(self.paths.containers_create(spec.name.as_deref()))
            .json(&spec.to_create_body())?;
        let response = self.call(request, &spec.image).await?;
        let body: Value = response.json()?;

        if let Some(warnings) = body.get("Warnings").and_then(Value::as_array) {
            for warning in warnings.iter().filter_map(Value::as_str) {
                warn!(image = %spec.image, warning, "Daemon warning on container create");
            }
        }

        body.get("Id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RuntimeError::Daemon {
                status: response.status,
                message: format!("create response has no Id: {}", response.text()),
            })
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.call(Request::post(self.paths.container(id, "start")), id)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout: Option<Duration>) -> Result<StopOutcome> {
        let path = format!(
            "{}{}",
            self.paths.container(id, "stop"),
            Self::stop_query(timeout)
        );
        let response = self.socket.send(Request::post(path)).await?;
        match response.status {
            304 => Ok(StopOutcome::AlreadyStopped),
            404 => Ok(StopOutcome::NotFound),
            _ => check_status(response, id).map(|_| StopOutcome::Stopped),
        }
    }

    async fn kill_container(&self, id: &str, signal: &str) -> Result<()> {
        let signal = normalize_signal(signal)?;
        let path = format!("{}?signal={}", self.paths.container(id, "kill"), signal);
        self.call(Request::post(path), id).await?;
        Ok(())
    }

    async fn pause_container(&self, id: &str) -> Result<()> {
        self.call(Request::post(self.paths.container(id, "pause")), id)
            .await?;
        Ok(())
    }

    async fn unpause_container(&self, id: &str) -> Result<()> {
        self.call(Request::post(self.paths.container(id, "unpause")), id)
            .await?;
        Ok(())
    }

    async fn restart_container(&self, id: &str, timeout: Option<Duration>) -> Result<()> {
        let path = format!(
            "{}{}",
            self.paths.container(id, "restart"),
            Self::stop_query(timeout)
        );
        self.call(Request::post(path), id).await?;
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect> {
        let response = self
            .call(Request::get(self.paths.container(id, "json")), id)
            .await?;
        Ok(ContainerInspect::from_value(&response.json::<Value>()?))
    }

    async fn container_exists(&self, id: &str) -> Result<bool> {
        self.probe(self.paths.container_exists(id), id).await
    }

    async fn delete_container(&self, id: &str, force: bool) -> Result<bool> {
        let response = self
            .socket
            .send(Request::delete(self.paths.container_delete(id, force)))
            .await?;
        match response.status {
            404 => Ok(false),
            409 => Err(RuntimeError::Conflict(daemon_message(&response))),
            _ => check_status(response, id).map(|_| true),
        }
    }

    async fn container_logs(&self, id: &str) -> Result<ContainerLogs> {
        let path = format!("{}?stdout=true&stderr=true", self.paths.container(id, "logs"));
        let response = self.call(Request::get(path), id).await?;
        Ok(ContainerLogs::demux(&response.body))
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerStats> {
        let path = format!("{}?stream=false", self.paths.container(id, "stats"));
        let response = self.call(Request::get(path), id).await?;
        Ok(ContainerStats::from_value(&response.json::<Value>()?))
    }

    async fn list_containers(
        &self,
        filters: &ContainerFilters,
        all: bool,
    ) -> Result<Vec<ContainerSummary>> {
        let query = (!filters.is_empty()).then(|| filters.to_query_json());
        let response = self
            .call(
                Request::get(self.paths.containers_list(all, query.as_deref())),
                "containers",
            )
            .await?;
        Ok(response.json()?)
    }
}

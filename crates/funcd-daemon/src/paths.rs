// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request paths for the two API families a daemon may expose.
//!
//! Lifecycle calls always use the Docker-compatible family. Podman additionally serves a
//! native `libpod/` family, used for existence checks, ping and host info; on Docker those
//! calls fall back to compat equivalents.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which daemon sits behind the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonFlavor {
    #[default]
    Podman,
    Docker,
}

impl DaemonFlavor {
    /// Version prefix used when none is configured.
    pub fn default_api_version(&self) -> &'static str {
        match self {
            DaemonFlavor::Podman => "v4.0.0",
            DaemonFlavor::Docker => "v1.41",
        }
    }
}

impl fmt::Display for DaemonFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonFlavor::Podman => write!(f, "podman"),
            DaemonFlavor::Docker => write!(f, "docker"),
        }
    }
}

impl FromStr for DaemonFlavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "podman" => Ok(DaemonFlavor::Podman),
            "docker" => Ok(DaemonFlavor::Docker),
            other => Err(format!("Unknown daemon flavor: {}", other)),
        }
    }
}

/// Path builder selected by [`DaemonFlavor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiPaths {
    flavor: DaemonFlavor,
}

impl ApiPaths {
    pub fn new(flavor: DaemonFlavor) -> Self {
        Self { flavor }
    }

    pub fn flavor(&self) -> DaemonFlavor {
        self.flavor
    }

    /// Native path, only available on Podman.
    fn native(&self, path: &str) -> Option<String> {
        match self.flavor {
            DaemonFlavor::Podman => Some(format!("libpod/{}", path)),
            DaemonFlavor::Docker => None,
        }
    }

    pub fn ping(&self) -> String {
        self.native("_ping")
            .unwrap_or_else(|| "_ping".to_string())
    }

    pub fn info(&self) -> String {
        self.native("info").unwrap_or_else(|| "info".to_string())
    }

    /// Existence probe: 204 on libpod, inspect (200) on Docker; 404 means absent.
    pub fn container_exists(&self, id: &str) -> String {
        self.native(&format!("containers/{}/exists", id))
            .unwrap_or_else(|| self.container(id, "json"))
    }

    pub fn image_exists(&self, reference: &str) -> String {
        self.native(&format!("images/{}/exists", reference))
            .unwrap_or_else(|| self.image(reference, "json"))
    }

    pub fn containers_create(&self, name: Option<&str>) -> String {
        match name {
            Some(name) => format!("containers/create?name={}", urlencoding::encode(name)),
            None => "containers/create".to_string(),
        }
    }

    pub fn containers_list(&self, all: bool, filters: Option<&str>) -> String {
        match filters {
            Some(filters) => format!(
                "containers/json?all={}&filters={}",
                all,
                urlencoding::encode(filters)
            ),
            None => format!("containers/json?all={}", all),
        }
    }

    /// `containers/{id}/{action}`.
    pub fn container(&self, id: &str, action: &str) -> String {
        format!("containers/{}/{}", id, action)
    }

    pub fn container_delete(&self, id: &str, force: bool) -> String {
        format!("containers/{}?force={}&v=true", id, force)
    }

    /// `images/{reference}/{action}`.
    pub fn image(&self, reference: &str, action: &str) -> String {
        format!("images/{}/{}", reference, action)
    }

    pub fn image_delete(&self, reference: &str, force: bool) -> String {
        format!("images/{}?force={}", reference, force)
    }

    pub fn image_pull(&self, repository: &str, tag: Option<&str>) -> String {
        match tag {
            Some(tag) => format!(
                "images/create?fromImage={}&tag={}",
                urlencoding::encode(repository),
                urlencoding::encode(tag)
            ),
            None => format!("images/create?fromImage={}", urlencoding::encode(repository)),
        }
    }

    pub fn image_tag(&self, source: &str, repo: &str, tag: &str) -> String {
        format!(
            "images/{}/tag?repo={}&tag={}",
            source,
            urlencoding::encode(repo),
            urlencoding::encode(tag)
        )
    }

    pub fn images_list(&self, all: bool) -> String {
        format!("images/json?all={}", all)
    }

    pub fn images_prune(&self) -> String {
        "images/prune".to_string()
    }

    pub fn build(&self, query: &[(&str, String)]) -> String {
        let encoded: Vec<String> = query
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect();
        format!("build?{}", encoded.join("&"))
    }
}

/// Split `repo[:tag]` into repository and tag, defaulting the tag to `latest`.
///
/// Registry ports (`host:5000/app`) are not mistaken for tags. Digest references are
/// returned whole with no tag.
pub fn split_reference(reference: &str) -> (&str, Option<&str>) {
    if reference.contains('@') {
        return (reference, None);
    }
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (&reference[..split], Some(&reference[split + 1..]))
        }
        None => (reference, Some("latest")),
    }
}

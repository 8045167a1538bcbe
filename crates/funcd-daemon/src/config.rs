// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Daemon connection settings.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::paths::DaemonFlavor;
use crate::protocol::DEFAULT_REQUEST_TIMEOUT;

/// Default socket path (rootful Podman).
pub const DEFAULT_SOCKET_PATH: &str = "/run/podman/podman.sock";

/// Where and how to reach the container daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub flavor: DaemonFlavor,
    /// Path prefix such as `v4.0.0`.
    pub api_version: String,
    pub request_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let flavor = DaemonFlavor::default();
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            flavor,
            api_version: flavor.default_api_version().to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl DaemonConfig {
    /// Load from environment variables.
    ///
    /// - `FUNCD_DAEMON_SOCKET`: socket path (default: `/run/podman/podman.sock`)
    /// - `FUNCD_DAEMON_FLAVOR`: `podman` or `docker` (default: `podman`)
    /// - `FUNCD_DAEMON_API_VERSION`: path prefix (default depends on flavor)
    /// - `FUNCD_DAEMON_REQUEST_TIMEOUT_SECS`: per-exchange timeout (default: 30)
    pub fn from_env() -> Self {
        let flavor = match std::env::var("FUNCD_DAEMON_FLAVOR") {
            Ok(value) => value.parse().unwrap_or_else(|e| {
                warn!(error = %e, "Invalid FUNCD_DAEMON_FLAVOR, using podman");
                DaemonFlavor::Podman
            }),
            Err(_) => DaemonFlavor::default(),
        };

        let socket_path = std::env::var("FUNCD_DAEMON_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKET_PATH));

        let api_version = std::env::var("FUNCD_DAEMON_API_VERSION")
            .unwrap_or_else(|_| flavor.default_api_version().to_string());

        let request_timeout = std::env::var("FUNCD_DAEMON_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        Self {
            socket_path,
            flavor,
            api_version,
            request_timeout,
        }
    }

    pub fn new(socket_path: impl Into<PathBuf>, flavor: DaemonFlavor) -> Self {
        Self {
            socket_path: socket_path.into(),
            flavor,
            api_version: flavor.default_api_version().to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.socket_path, PathBuf::from("/run/podman/podman.sock"));
        assert_eq!(config.flavor, DaemonFlavor::Podman);
        assert_eq!(config.api_version, "v4.0.0");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_new_uses_flavor_version() {
        let config = DaemonConfig::new("/var/run/docker.sock", DaemonFlavor::Docker)
            .with_request_timeout(Duration::from_secs(5));
        assert_eq!(config.api_version, "v1.41");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container daemon client for funcd.
//!
//! Talks to a Docker- or Podman-compatible daemon over its Unix socket using hand-built
//! HTTP/1.1 requests.
//!
//! # Layers
//!
//! - [`protocol`]: one request per connection, raw response parsing, chunked bodies
//! - [`paths`]: compat and native (`libpod/`) path families selected by [`DaemonFlavor`]
//! - [`ContainerRuntime`]: image and container lifecycle, waits, batch-by-filter operations
//! - [`DaemonClient`]: the runtime over a real daemon
//! - [`MockRuntime`]: in-memory runtime for tests
//!
//! # Example
//!
//! ```no_run
//! use funcd_daemon::{ContainerRuntime, ContainerSpec, DaemonClient, DaemonConfig, DaemonFlavor};
//!
//! # async fn example() -> funcd_daemon::Result<()> {
//! let client = DaemonClient::new(DaemonConfig::new("/run/podman/podman.sock", DaemonFlavor::Podman));
//! client.pull_image("alpine:3.19").await?;
//! let id = client.create_container(&ContainerSpec::new("alpine:3.19")).await?;
//! client.start_container(&id).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod mock;
pub mod paths;
pub mod protocol;
pub mod runtime;
pub mod types;

pub use client::{DEFAULT_PLATFORM, DaemonClient};
pub use config::DaemonConfig;
pub use error::{Result, RuntimeError};
pub use mock::{MockBehavior, MockRuntime};
pub use paths::{ApiPaths, DaemonFlavor};
pub use protocol::{HeaderMap, Method, ProtocolError, Request, Response, SocketClient};
pub use runtime::ContainerRuntime;
pub use types::{
    BindMount, BuildOptions, BuildOutput, ContainerFilters, ContainerHandle, ContainerInspect,
    ContainerLogs, ContainerSpec, ContainerState, ContainerStats, ContainerSummary, ExitInfo,
    ImageSummary, PortBinding, PruneReport, RestartPolicy, StopOutcome, WaitCondition,
};

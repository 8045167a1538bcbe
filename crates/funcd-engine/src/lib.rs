// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! funcd Engine - Function Deployment and Execution
//!
//! Deploys user functions as container images under monotonically versioned deployments
//! and runs each invocation in a fresh, resource-limited container.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                              Engine                              │
//! │  ┌────────────────────┐  ┌────────────────────┐  ┌────────────┐  │
//! │  │ DeploymentManager  │  │ InvocationExecutor │  │  Orphan    │  │
//! │  │ deploy / rollback  │  │ invoke / cancel    │  │  Reaper    │  │
//! │  └─────────┬──────────┘  └─────────┬──────────┘  └─────┬──────┘  │
//! └────────────┼───────────────────────┼───────────────────┼─────────┘
//!              │                       │                   │
//!      ┌───────┴────────┐              ▼                   ▼
//!      ▼                ▼     ┌──────────────────────────────────┐
//! ┌──────────┐  ┌─────────────┐│  ContainerRuntime (funcd-daemon)│
//! │ Metadata │  │  Artifact   ││  Podman / Docker over Unix sock │
//! │  Store   │  │   Store     │└──────────────────────────────────┘
//! └──────────┘  └─────────────┘
//! ```
//!
//! # Deployment State Machine
//!
//! ```text
//!   ┌──────────┐  image ready  ┌────────┐  superseded  ┌──────────┐
//!   │ BUILDING │──────────────►│ ACTIVE │─────────────►│ ARCHIVED │
//!   └────┬─────┘               └────────┘◄─────────────└──────────┘
//!        │ build/pull failed                 rollback
//!        ▼
//!   ┌────────┐
//!   │ FAILED │
//!   └────────┘
//! ```
//!
//! At most one deployment per function is active. Every `is_active` transition happens in
//! a single store transaction, backed by a partial unique index.
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FUNCD_DATABASE_URL` | `sqlite:.data/funcd.db?mode=rwc` | Metadata store (sqlite or postgres) |
//! | `DATA_DIR` | `.data` | Data directory; artifacts under `artifacts/` |
//! | `FUNCD_DAEMON_SOCKET` | `/run/podman/podman.sock` | Daemon socket |
//! | `FUNCD_DAEMON_FLAVOR` | `podman` | `podman` or `docker` |
//! | `FUNCD_EXECUTION_TIMEOUT_SECS` | `30` | Invocation deadline |
//! | `FUNCD_MAX_MEMORY_MB` | `20` | Memory ceiling per container |
//! | `FUNCD_CPU_SHARE` | `0.5` | CPUs per container |
//! | `FUNCD_MAX_CONCURRENT_EXECUTIONS` | `16` | Concurrency ceiling |
//! | `FUNCD_SLOT_WAIT_MS` | `100` | Wait for a slot before rejecting |
//!
//! See [`config`] for the full list.

#![deny(missing_docs)]

/// Deployment artifact storage.
pub mod artifact;

/// Configuration loaded from environment variables.
pub mod config;

/// Versioned deployments and rollback.
pub mod deployment;

/// Embeddable engine runtime.
pub mod engine;

/// Error types for engine operations.
pub mod error;

/// Bounded container invocations.
pub mod invocation;

/// Domain records.
pub mod model;

/// Background worker removing orphaned containers.
pub mod reaper;

/// Metadata persistence (SQLite and PostgreSQL).
pub mod store;

pub use artifact::{ArtifactError, ArtifactStore, FsArtifactStore};
pub use config::{Config, ConfigError, ResourceLimits};
pub use deployment::{Artifact, DeployRequest, DeploymentManager};
pub use engine::{Engine, EngineBuilder, EngineConfig};
pub use error::{Error, Result};
pub use invocation::{InvocationExecutor, InvokeRequest};
pub use model::{
    Deployment, DeploymentStatus, Function, FunctionStatus, InvocationLogs, InvocationRecord,
    InvocationStatus,
};
pub use reaper::{OrphanReaper, ReaperConfig};
pub use store::{MetadataStore, PostgresStore, SqliteStore, StoreError, open_store};
pub use tokio_util::sync::CancellationToken;

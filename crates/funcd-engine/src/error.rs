// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for funcd-engine.

use std::time::Duration;

use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Metadata store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// Container runtime operation failed.
    #[error("Runtime error: {0}")]
    Runtime(#[from] funcd_daemon::RuntimeError),

    /// Artifact store operation failed.
    #[error("Artifact error: {0}")]
    Artifact(#[from] crate::artifact::ArtifactError),

    /// Function was not found.
    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    /// Deployment was not found, or belongs to another function.
    #[error("Deployment not found: {0}")]
    DeploymentNotFound(String),

    /// The function cannot be invoked or changed in its current state.
    #[error("Function {function_id} is not available: {reason}")]
    Unavailable {
        /// Function id.
        function_id: String,
        /// Why it is unavailable.
        reason: String,
    },

    /// Every execution slot stayed busy for the whole slot wait.
    #[error("Too many concurrent executions (max {max_concurrent}), waited {waited:?}")]
    Backpressure {
        /// Configured ceiling.
        max_concurrent: usize,
        /// How long the request waited for a slot.
        waited: Duration,
    },

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A deploy named an existing function owned by someone else.
    #[error("Function {function_id} is owned by another account")]
    OwnerMismatch {
        /// Function id.
        function_id: String,
    },

    /// The image build or pull failed; the deployment was recorded as failed.
    #[error("Deployment {deployment_id} failed: {message}")]
    BuildFailed {
        /// The failed deployment.
        deployment_id: String,
        /// Failure text stored on the deployment.
        message: String,
    },

    /// A rollback target's image is gone from the daemon.
    #[error("Image {0} no longer exists")]
    ImageMissing(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the engine Error.
pub type Result<T> = std::result::Result<T, Error>;

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Metadata persistence for functions, deployments and invocations.
//!
//! One trait, two backends. Both schemas carry a partial unique index on
//! `deployments(function_id) WHERE is_active`, so the single-active invariant holds even
//! if a caller bypasses [`MetadataStore::activate_deployment`].

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{
    Deployment, DeploymentStatus, Function, FunctionStatus, InvocationLogs, InvocationRecord,
    InvocationStatus,
};

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Query or connection failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failure.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Filesystem failure while preparing the database location.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON column could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored status value is not recognised.
    #[error("Invalid stored value: {0}")]
    InvalidValue(String),

    /// The addressed row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of row.
        entity: &'static str,
        /// Row id.
        id: String,
    },

    /// The database URL has an unsupported scheme.
    #[error("Unsupported database URL: {0}")]
    UnsupportedUrl(String),
}

/// Persistence contract used by the deployment manager and invocation executor.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a new function.
    async fn create_function(&self, function: &Function) -> Result<(), StoreError>;

    /// Fetch a function by id.
    async fn get_function(&self, function_id: &str) -> Result<Option<Function>, StoreError>;

    /// Set a function's status.
    async fn update_function_status(
        &self,
        function_id: &str,
        status: FunctionStatus,
    ) -> Result<(), StoreError>;

    /// Mark a function deleted and remove its deployments. Returns the removed deployments.
    async fn delete_function(&self, function_id: &str) -> Result<Vec<Deployment>, StoreError>;

    /// Highest deployment version of a function, 0 when it has none.
    async fn max_version(&self, function_id: &str) -> Result<i64, StoreError>;

    /// Insert a deployment. `(function_id, version)` is unique.
    async fn insert_deployment(&self, deployment: &Deployment) -> Result<(), StoreError>;

    /// Fetch a deployment by id.
    async fn get_deployment(&self, deployment_id: &str)
    -> Result<Option<Deployment>, StoreError>;

    /// All deployments of a function, newest version first.
    async fn list_deployments(&self, function_id: &str) -> Result<Vec<Deployment>, StoreError>;

    /// The function's active deployment.
    async fn get_active_deployment(
        &self,
        function_id: &str,
    ) -> Result<Option<Deployment>, StoreError>;

    /// Mark a deployment failed with its error text.
    async fn mark_deployment_failed(
        &self,
        deployment_id: &str,
        error: &str,
    ) -> Result<(), StoreError>;

    /// In one transaction: archive the current active deployment, activate `deployment_id`,
    /// point the function at it and set the function `active`.
    async fn activate_deployment(
        &self,
        function_id: &str,
        deployment_id: &str,
    ) -> Result<Deployment, StoreError>;

    /// Insert an invocation record.
    async fn insert_invocation(&self, record: &InvocationRecord) -> Result<(), StoreError>;

    /// Fetch an invocation record by id.
    async fn get_invocation(
        &self,
        invocation_id: &str,
    ) -> Result<Option<InvocationRecord>, StoreError>;

    /// Most recent invocations of a function, newest first.
    async fn list_invocations(
        &self,
        function_id: &str,
        limit: i64,
    ) -> Result<Vec<InvocationRecord>, StoreError>;

    /// Check the database is reachable.
    async fn health_check(&self) -> Result<bool, StoreError>;
}

/// Open a store for `database_url` and run its migrations.
///
/// `postgres://` and `postgresql://` select PostgreSQL; `sqlite:` selects SQLite.
pub async fn open_store(database_url: &str) -> Result<Arc<dyn MetadataStore>, StoreError> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        Ok(Arc::new(PostgresStore::connect(database_url).await?))
    } else if database_url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteStore::connect(database_url).await?))
    } else {
        Err(StoreError::UnsupportedUrl(database_url.to_string()))
    }
}

// ============================================================================
// Row types shared by both backends
// ============================================================================

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct FunctionRow {
    pub id: String,
    pub owner: String,
    pub name: String,
    pub status: String,
    pub active_deployment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<FunctionRow> for Function {
    type Error = StoreError;

    fn try_from(row: FunctionRow) -> Result<Self, Self::Error> {
        Ok(Function {
            id: row.id,
            owner: row.owner,
            name: row.name,
            status: row
                .status
                .parse::<FunctionStatus>()
                .map_err(StoreError::InvalidValue)?,
            active_deployment_id: row.active_deployment_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct DeploymentRow {
    pub id: String,
    pub function_id: String,
    pub version: i64,
    pub image_tag: String,
    pub artifact_key: String,
    pub status: String,
    pub is_active: bool,
    pub error: Option<String>,
    pub command: Option<String>,
    pub env: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DeploymentRow> for Deployment {
    type Error = StoreError;

    fn try_from(row: DeploymentRow) -> Result<Self, Self::Error> {
        let command = row
            .command
            .as_deref()
            .map(serde_json::from_str::<Vec<String>>)
            .transpose()?;
        let env: BTreeMap<String, String> = serde_json::from_str(&row.env)?;

        Ok(Deployment {
            id: row.id,
            function_id: row.function_id,
            version: row.version,
            image_tag: row.image_tag,
            artifact_key: row.artifact_key,
            status: row
                .status
                .parse::<DeploymentStatus>()
                .map_err(StoreError::InvalidValue)?,
            is_active: row.is_active,
            error: row.error,
            command,
            env,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct InvocationRow {
    pub id: String,
    pub function_id: String,
    pub deployment_id: String,
    pub status: String,
    pub duration_ms: i64,
    pub error: Option<String>,
    pub logs: Option<String>,
    pub container_id: Option<String>,
    pub exit_code: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<InvocationRow> for InvocationRecord {
    type Error = StoreError;

    fn try_from(row: InvocationRow) -> Result<Self, Self::Error> {
        let logs = row
            .logs
            .as_deref()
            .map(serde_json::from_str::<InvocationLogs>)
            .transpose()?;

        Ok(InvocationRecord {
            id: row.id,
            function_id: row.function_id,
            deployment_id: row.deployment_id,
            status: row
                .status
                .parse::<InvocationStatus>()
                .map_err(StoreError::InvalidValue)?,
            duration_ms: row.duration_ms,
            error: row.error,
            logs,
            container_id: row.container_id,
            exit_code: row.exit_code,
            created_at: row.created_at,
        })
    }
}

/// JSON-encoded columns of a deployment: `(command, env)`.
pub(crate) fn encode_deployment_json(
    deployment: &Deployment,
) -> Result<(Option<String>, String), StoreError> {
    let command = deployment
        .command
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let env = serde_json::to_string(&deployment.env)?;
    Ok((command, env))
}

pub(crate) fn encode_logs(record: &InvocationRecord) -> Result<Option<String>, StoreError> {
    Ok(record
        .logs
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?)
}

pub(crate) fn collect<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

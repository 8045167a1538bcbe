// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed metadata store.

use std::path::Path;

use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::{
    DeploymentRow, FunctionRow, InvocationRow, MetadataStore, StoreError, collect,
    encode_deployment_json, encode_logs,
};
use crate::model::{Deployment, Function, FunctionStatus, InvocationRecord};

pub(crate) static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const DEPLOYMENT_COLUMNS: &str = "id, function_id, version, image_tag, artifact_key, status, \
     is_active, error, command, env, created_at, updated_at";

const INVOCATION_COLUMNS: &str = "id, function_id, deployment_id, status, duration_ms, error, \
     logs, container_id, exit_code, created_at";

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a `sqlite:` URL, creating the database directory, and run migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let path = url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:");
        let path = path.split('?').next().unwrap_or_default();
        if !path.is_empty()
            && path != ":memory:"
            && let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Open (or create) a database file and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let url = format!("sqlite:{}?mode=rwc", path.as_ref().to_string_lossy());
        Self::connect(&url).await
    }

    /// Private in-memory database, migrated. Single connection so every query sees it.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl MetadataStore for SqliteStore {
    async fn create_function(&self, function: &Function) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO functions (id, owner, name, status, active_deployment_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&function.id)
        .bind(&function.owner)
        .bind(&function.name)
        .bind(function.status.as_str())
        .bind(&function.active_deployment_id)
        .bind(function.created_at)
        .bind(function.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_function(&self, function_id: &str) -> Result<Option<Function>, StoreError> {
        let row = sqlx::query_as::<_, FunctionRow>(
            r#"
            SELECT id, owner, name, status, active_deployment_id, created_at, updated_at
            FROM functions
            WHERE id = ?
            "#,
        )
        .bind(function_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Function::try_from).transpose()
    }

    async fn update_function_status(
        &self,
        function_id: &str,
        status: FunctionStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE functions
            SET status = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(function_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "function",
                id: function_id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_function(&self, function_id: &str) -> Result<Vec<Deployment>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query_as::<_, DeploymentRow>(&format!(
            "SELECT {} FROM deployments WHERE function_id = ? ORDER BY version DESC",
            DEPLOYMENT_COLUMNS
        ))
        .bind(function_id)
        .fetch_all(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE functions
            SET status = 'deleted', active_deployment_id = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(function_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "function",
                id: function_id.to_string(),
            });
        }

        sqlx::query("DELETE FROM deployments WHERE function_id = ?")
            .bind(function_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        collect(rows)
    }

    async fn max_version(&self, function_id: &str) -> Result<i64, StoreError> {
        let max: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) FROM deployments WHERE function_id = ?",
        )
        .bind(function_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(max)
    }

    async fn insert_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
        let (command, env) = encode_deployment_json(deployment)?;

        sqlx::query(
            r#"
            INSERT INTO deployments
                (id, function_id, version, image_tag, artifact_key, status, is_active,
                 error, command, env, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&deployment.id)
        .bind(&deployment.function_id)
        .bind(deployment.version)
        .bind(&deployment.image_tag)
        .bind(&deployment.artifact_key)
        .bind(deployment.status.as_str())
        .bind(deployment.is_active)
        .bind(&deployment.error)
        .bind(command)
        .bind(env)
        .bind(deployment.created_at)
        .bind(deployment.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<Option<Deployment>, StoreError> {
        let row = sqlx::query_as::<_, DeploymentRow>(&format!(
            "SELECT {} FROM deployments WHERE id = ?",
            DEPLOYMENT_COLUMNS
        ))
        .bind(deployment_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Deployment::try_from).transpose()
    }

    async fn list_deployments(&self, function_id: &str) -> Result<Vec<Deployment>, StoreError> {
        let rows = sqlx::query_as::<_, DeploymentRow>(&format!(
            "SELECT {} FROM deployments WHERE function_id = ? ORDER BY version DESC",
            DEPLOYMENT_COLUMNS
        ))
        .bind(function_id)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn get_active_deployment(
        &self,
        function_id: &str,
    ) -> Result<Option<Deployment>, StoreError> {
        let row = sqlx::query_as::<_, DeploymentRow>(&format!(
            "SELECT {} FROM deployments WHERE function_id = ? AND is_active = 1",
            DEPLOYMENT_COLUMNS
        ))
        .bind(function_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Deployment::try_from).transpose()
    }

    async fn mark_deployment_failed(
        &self,
        deployment_id: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET status = 'failed', is_active = 0, error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(Utc::now())
        .bind(deployment_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "deployment",
                id: deployment_id.to_string(),
            });
        }
        Ok(())
    }

    async fn activate_deployment(
        &self,
        function_id: &str,
        deployment_id: &str,
    ) -> Result<Deployment, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Deactivate first; the partial unique index rejects two active rows.
        sqlx::query(
            r#"
            UPDATE deployments
            SET is_active = 0, status = 'archived', updated_at = ?
            WHERE function_id = ? AND is_active = 1 AND id <> ?
            "#,
        )
        .bind(now)
        .bind(function_id)
        .bind(deployment_id)
        .execute(&mut *tx)
        .await?;

        let activated = sqlx::query(
            r#"
            UPDATE deployments
            SET is_active = 1, status = 'active', updated_at = ?
            WHERE id = ? AND function_id = ?
            "#,
        )
        .bind(now)
        .bind(deployment_id)
        .bind(function_id)
        .execute(&mut *tx)
        .await?;

        if activated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "deployment",
                id: deployment_id.to_string(),
            });
        }

        sqlx::query(
            r#"
            UPDATE functions
            SET active_deployment_id = ?, status = 'active', updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(deployment_id)
        .bind(now)
        .bind(function_id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, DeploymentRow>(&format!(
            "SELECT {} FROM deployments WHERE id = ?",
            DEPLOYMENT_COLUMNS
        ))
        .bind(deployment_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Deployment::try_from(row)
    }

    async fn insert_invocation(&self, record: &InvocationRecord) -> Result<(), StoreError> {
        let logs = encode_logs(record)?;

        sqlx::query(
            r#"
            INSERT INTO invocations
                (id, function_id, deployment_id, status, duration_ms, error, logs,
                 container_id, exit_code, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.function_id)
        .bind(&record.deployment_id)
        .bind(record.status.as_str())
        .bind(record.duration_ms)
        .bind(&record.error)
        .bind(logs)
        .bind(&record.container_id)
        .bind(record.exit_code)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_invocation(
        &self,
        invocation_id: &str,
    ) -> Result<Option<InvocationRecord>, StoreError> {
        let row = sqlx::query_as::<_, InvocationRow>(&format!(
            "SELECT {} FROM invocations WHERE id = ?",
            INVOCATION_COLUMNS
        ))
        .bind(invocation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(InvocationRecord::try_from).transpose()
    }

    async fn list_invocations(
        &self,
        function_id: &str,
        limit: i64,
    ) -> Result<Vec<InvocationRecord>, StoreError> {
        let rows = sqlx::query_as::<_, InvocationRow>(&format!(
            "SELECT {} FROM invocations WHERE function_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
            INVOCATION_COLUMNS
        ))
        .bind(function_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn health_check(&self) -> Result<bool, StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeploymentStatus, InvocationLogs, InvocationStatus};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    async fn test_store() -> SqliteStore {
        SqliteStore::in_memory()
            .await
            .expect("Failed to create in-memory store")
    }

    fn function(id: &str) -> Function {
        let now = Utc::now();
        Function {
            id: id.to_string(),
            owner: "owner-1".to_string(),
            name: "hello".to_string(),
            status: FunctionStatus::Init,
            active_deployment_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn deployment(function_id: &str, version: i64) -> Deployment {
        let now = Utc::now();
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hi".to_string());
        Deployment {
            id: Uuid::new_v4().to_string(),
            function_id: function_id.to_string(),
            version,
            image_tag: format!("funcd-fn-{}:v{}", function_id, version),
            artifact_key: format!("functions/{}/v{}.tar", function_id, version),
            status: DeploymentStatus::Building,
            is_active: false,
            error: None,
            command: Some(vec!["python".to_string(), "main.py".to_string()]),
            env,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_function() {
        let store = test_store().await;
        store.create_function(&function("f1")).await.unwrap();

        let loaded = store.get_function("f1").await.unwrap().unwrap();
        assert_eq!(loaded.owner, "owner-1");
        assert_eq!(loaded.status, FunctionStatus::Init);
        assert!(store.get_function("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_status_of_missing_function() {
        let store = test_store().await;
        let err = store
            .update_function_status("missing", FunctionStatus::Disabled)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "function", .. }));
    }

    #[tokio::test]
    async fn test_deployment_round_trip_and_ordering() {
        let store = test_store().await;
        store.create_function(&function("f1")).await.unwrap();
        assert_eq!(store.max_version("f1").await.unwrap(), 0);

        let d1 = deployment("f1", 1);
        let d2 = deployment("f1", 2);
        store.insert_deployment(&d1).await.unwrap();
        store.insert_deployment(&d2).await.unwrap();

        assert_eq!(store.max_version("f1").await.unwrap(), 2);

        let listed = store.list_deployments("f1").await.unwrap();
        assert_eq!(
            listed.iter().map(|d| d.version).collect::<Vec<_>>(),
            vec![2, 1]
        );

        let loaded = store.get_deployment(&d1.id).await.unwrap().unwrap();
        assert_eq!(loaded.command, d1.command);
        assert_eq!(loaded.env.get("GREETING").map(String::as_str), Some("hi"));
    }

    #[tokio::test]
    async fn test_duplicate_version_is_rejected() {
        let store = test_store().await;
        store.create_function(&function("f1")).await.unwrap();
        store.insert_deployment(&deployment("f1", 1)).await.unwrap();

        let err = store
            .insert_deployment(&deployment("f1", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
    }

    #[tokio::test]
    async fn test_activate_swaps_active_deployment() {
        let store = test_store().await;
        store.create_function(&function("f1")).await.unwrap();
        let d1 = deployment("f1", 1);
        let d2 = deployment("f1", 2);
        store.insert_deployment(&d1).await.unwrap();
        store.insert_deployment(&d2).await.unwrap();

        store.activate_deployment("f1", &d1.id).await.unwrap();
        let active = store.activate_deployment("f1", &d2.id).await.unwrap();
        assert!(active.is_active);
        assert_eq!(active.status, DeploymentStatus::Active);

        let old = store.get_deployment(&d1.id).await.unwrap().unwrap();
        assert!(!old.is_active);
        assert_eq!(old.status, DeploymentStatus::Archived);

        let function = store.get_function("f1").await.unwrap().unwrap();
        assert_eq!(function.active_deployment_id.as_deref(), Some(d2.id.as_str()));
        assert_eq!(function.status, FunctionStatus::Active);

        let active = store.get_active_deployment("f1").await.unwrap().unwrap();
        assert_eq!(active.id, d2.id);
    }

    #[tokio::test]
    async fn test_activate_unknown_deployment_keeps_current() {
        let store = test_store().await;
        store.create_function(&function("f1")).await.unwrap();
        let d1 = deployment("f1", 1);
        store.insert_deployment(&d1).await.unwrap();
        store.activate_deployment("f1", &d1.id).await.unwrap();

        let err = store
            .activate_deployment("f1", "no-such-deployment")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "deployment", .. }));

        let active = store.get_active_deployment("f1").await.unwrap().unwrap();
        assert_eq!(active.id, d1.id);
    }

    #[tokio::test]
    async fn test_schema_rejects_second_active_row() {
        let store = test_store().await;
        store.create_function(&function("f1")).await.unwrap();
        let mut d1 = deployment("f1", 1);
        d1.is_active = true;
        let mut d2 = deployment("f1", 2);
        d2.is_active = true;

        store.insert_deployment(&d1).await.unwrap();
        assert!(store.insert_deployment(&d2).await.is_err());
    }

    #[tokio::test]
    async fn test_mark_failed() {
        let store = test_store().await;
        store.create_function(&function("f1")).await.unwrap();
        let d1 = deployment("f1", 1);
        store.insert_deployment(&d1).await.unwrap();

        store
            .mark_deployment_failed(&d1.id, "COPY failed")
            .await
            .unwrap();
        let failed = store.get_deployment(&d1.id).await.unwrap().unwrap();
        assert_eq!(failed.status, DeploymentStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("COPY failed"));
    }

    #[tokio::test]
    async fn test_delete_function_removes_deployments() {
        let store = test_store().await;
        store.create_function(&function("f1")).await.unwrap();
        let d1 = deployment("f1", 1);
        store.insert_deployment(&d1).await.unwrap();
        store.activate_deployment("f1", &d1.id).await.unwrap();

        let removed = store.delete_function("f1").await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(store.list_deployments("f1").await.unwrap().is_empty());

        let function = store.get_function("f1").await.unwrap().unwrap();
        assert_eq!(function.status, FunctionStatus::Deleted);
        assert!(function.active_deployment_id.is_none());
    }

    #[tokio::test]
    async fn test_invocations_round_trip() {
        let store = test_store().await;
        store.create_function(&function("f1")).await.unwrap();

        for i in 0..3 {
            let record = InvocationRecord {
                id: format!("inv-{}", i),
                function_id: "f1".to_string(),
                deployment_id: "d1".to_string(),
                status: if i == 2 {
                    InvocationStatus::Timeout
                } else {
                    InvocationStatus::Success
                },
                duration_ms: 10 * i,
                error: None,
                logs: Some(InvocationLogs {
                    stdout: vec![format!("run {}", i)],
                    stderr: vec![],
                }),
                container_id: Some(format!("c{}", i)),
                exit_code: Some(0),
                created_at: Utc::now() + chrono::Duration::milliseconds(i),
            };
            store.insert_invocation(&record).await.unwrap();
        }

        let listed = store.list_invocations("f1", 2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "inv-2");
        assert_eq!(listed[0].status, InvocationStatus::Timeout);

        let loaded = store.get_invocation("inv-0").await.unwrap().unwrap();
        assert_eq!(loaded.logs.unwrap().stdout, vec!["run 0"]);
    }

    #[tokio::test]
    async fn test_health_check() {
        let store = test_store().await;
        assert!(store.health_check().await.unwrap());
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed metadata store.

use chrono::Utc;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::{
    DeploymentRow, FunctionRow, InvocationRow, MetadataStore, StoreError, collect,
    encode_deployment_json, encode_logs,
};
use crate::model::{Deployment, Function, FunctionStatus, InvocationRecord};

pub(crate) static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

const DEPLOYMENT_COLUMNS: &str = "id, function_id, version, image_tag, artifact_key, status, \
     is_active, error, command, env, created_at, updated_at";

const INVOCATION_COLUMNS: &str = "id, function_id, deployment_id, status, duration_ms, error, \
     logs, container_id, exit_code, created_at";

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing pool. Migrations are not run.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl MetadataStore for PostgresStore {
    async fn create_function(&self, function: &Function) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO functions (id, owner, name, status, active_deployment_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
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
            WHERE id = $1
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
            SET status = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(status.as_str())
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

        let result = sqlx::query(
            r#"
            UPDATE functions
            SET status = 'deleted', active_deployment_id = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(function_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "function",
                id: function_id.to_string(),
            });
        }

        let rows = sqlx::query_as::<_, DeploymentRow>(&format!(
            "DELETE FROM deployments WHERE function_id = $1 RETURNING {}",
            DEPLOYMENT_COLUMNS
        ))
        .bind(function_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut removed: Vec<Deployment> = collect(rows)?;
        removed.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(removed)
    }

    async fn max_version(&self, function_id: &str) -> Result<i64, StoreError> {
        let max: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0)::BIGINT FROM deployments WHERE function_id = $1",
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
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
            "SELECT {} FROM deployments WHERE id = $1",
            DEPLOYMENT_COLUMNS
        ))
        .bind(deployment_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Deployment::try_from).transpose()
    }

    async fn list_deployments(&self, function_id: &str) -> Result<Vec<Deployment>, StoreError> {
        let rows = sqlx::query_as::<_, DeploymentRow>(&format!(
            "SELECT {} FROM deployments WHERE function_id = $1 ORDER BY version DESC",
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
            "SELECT {} FROM deployments WHERE function_id = $1 AND is_active",
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
            SET status = 'failed', is_active = FALSE, error = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(error)
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

        // Lock the function row so concurrent activations serialize.
        sqlx::query("SELECT id FROM functions WHERE id = $1 FOR UPDATE")
            .bind(function_id)
            .fetch_optional(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE deployments
            SET is_active = FALSE, status = 'archived', updated_at = $1
            WHERE function_id = $2 AND is_active AND id <> $3
            "#,
        )
        .bind(now)
        .bind(function_id)
        .bind(deployment_id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, DeploymentRow>(&format!(
            r#"
            UPDATE deployments
            SET is_active = TRUE, status = 'active', updated_at = $1
            WHERE id = $2 AND function_id = $3
            RETURNING {}
            "#,
            DEPLOYMENT_COLUMNS
        ))
        .bind(now)
        .bind(deployment_id)
        .bind(function_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(StoreError::NotFound {
                entity: "deployment",
                id: deployment_id.to_string(),
            });
        };

        sqlx::query(
            r#"
            UPDATE functions
            SET active_deployment_id = $1, status = 'active', updated_at = $2
            WHERE id = $3
            "#,
        )
        .bind(deployment_id)
        .bind(now)
        .bind(function_id)
        .execute(&mut *tx)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
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
            "SELECT {} FROM invocations WHERE id = $1",
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
            "SELECT {} FROM invocations WHERE function_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
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
    use crate::model::DeploymentStatus;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    macro_rules! skip_if_no_db {
        () => {
            if std::env::var("TEST_FUNCD_DATABASE_URL").is_err() {
                eprintln!("Skipping test: TEST_FUNCD_DATABASE_URL not set");
                return;
            }
        };
    }

    async fn test_store() -> Option<PostgresStore> {
        let url = std::env::var("TEST_FUNCD_DATABASE_URL").ok()?;
        PostgresStore::connect(&url).await.ok()
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
        Deployment {
            id: Uuid::new_v4().to_string(),
            function_id: function_id.to_string(),
            version,
            image_tag: format!("funcd-fn-{}:v{}", function_id, version),
            artifact_key: format!("functions/{}/v{}.tar", function_id, version),
            status: DeploymentStatus::Building,
            is_active: false,
            error: None,
            command: None,
            env: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn cleanup(store: &PostgresStore, function_id: &str) {
        sqlx::query("DELETE FROM functions WHERE id = $1")
            .bind(function_id)
            .execute(store.pool())
            .await
            .expect("Failed to clean up function");
    }

    #[tokio::test]
    async fn test_activate_swaps_active_deployment() {
        skip_if_no_db!();
        let Some(store) = test_store().await else {
            return;
        };
        let function_id = format!("pg-{}", Uuid::new_v4());
        store.create_function(&function(&function_id)).await.unwrap();

        let d1 = deployment(&function_id, 1);
        let d2 = deployment(&function_id, 2);
        store.insert_deployment(&d1).await.unwrap();
        store.insert_deployment(&d2).await.unwrap();
        assert_eq!(store.max_version(&function_id).await.unwrap(), 2);

        store.activate_deployment(&function_id, &d1.id).await.unwrap();
        store.activate_deployment(&function_id, &d2.id).await.unwrap();

        let deployments = store.list_deployments(&function_id).await.unwrap();
        assert_eq!(deployments.iter().filter(|d| d.is_active).count(), 1);
        assert_eq!(deployments[0].id, d2.id);
        assert_eq!(deployments[1].status, DeploymentStatus::Archived);

        cleanup(&store, &function_id).await;
    }

    #[tokio::test]
    async fn test_schema_rejects_second_active_row() {
        skip_if_no_db!();
        let Some(store) = test_store().await else {
            return;
        };
        let function_id = format!("pg-{}", Uuid::new_v4());
        store.create_function(&function(&function_id)).await.unwrap();

        let mut d1 = deployment(&function_id, 1);
        d1.is_active = true;
        let mut d2 = deployment(&function_id, 2);
        d2.is_active = true;
        store.insert_deployment(&d1).await.unwrap();
        assert!(store.insert_deployment(&d2).await.is_err());

        cleanup(&store, &function_id).await;
    }

    #[tokio::test]
    async fn test_delete_function_returns_removed_deployments() {
        skip_if_no_db!();
        let Some(store) = test_store().await else {
            return;
        };
        let function_id = format!("pg-{}", Uuid::new_v4());
        store.create_function(&function(&function_id)).await.unwrap();
        store
            .insert_deployment(&deployment(&function_id, 1))
            .await
            .unwrap();

        let removed = store.delete_function(&function_id).await.unwrap();
        assert_eq!(removed.len(), 1);
        let function = store.get_function(&function_id).await.unwrap().unwrap();
        assert_eq!(function.status, FunctionStatus::Deleted);

        cleanup(&store, &function_id).await;
    }
}

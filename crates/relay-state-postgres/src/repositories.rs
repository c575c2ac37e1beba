use async_trait::async_trait;
use sqlx::Row;
use tracing::{debug, warn};

use relay_core::{
    domain::definition::{DefinitionId, ProcessDefinition},
    domain::instance::{Instance, InstanceId, InstanceKey, InstanceStatus},
    domain::repository::{DefinitionRepository, InstanceRepository},
    CoreError,
};

use crate::errors::map_sqlx_error;
use crate::PostgresConnection;

fn status_label(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Running => "running",
        InstanceStatus::Waiting => "waiting",
        InstanceStatus::Completed => "completed",
        InstanceStatus::Failed => "failed",
    }
}

fn decode_instance(row: &sqlx::postgres::PgRow) -> Result<Instance, CoreError> {
    let data: serde_json::Value = row
        .try_get("data")
        .map_err(|e| map_sqlx_error("read instance", e))?;
    serde_json::from_value(data).map_err(|e| {
        CoreError::SerializationError(format!("Error deserializing instance: {}", e))
    })
}

/// Postgres implementation of the InstanceRepository
#[derive(Clone)]
pub struct PostgresInstanceRepository {
    conn: PostgresConnection,
}

impl PostgresInstanceRepository {
    /// Create a new Postgres instance repository
    pub fn new(conn: PostgresConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl InstanceRepository for PostgresInstanceRepository {
    async fn create(&self, instance: &Instance) -> Result<(), CoreError> {
        let data = serde_json::to_value(instance)?;
        let query = "
            INSERT INTO relay_instances
                (id, definition_id, instance_key, status, data, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ";
        // A duplicate instance_key surfaces as AlreadyExists through the unique index.
        sqlx::query(query)
            .bind(&instance.id.0)
            .bind(&instance.definition_id.0)
            .bind(&instance.instance_key.0)
            .bind(status_label(instance.status))
            .bind(&data)
            .bind(instance.version() as i64)
            .bind(instance.created_at)
            .bind(instance.updated_at)
            .execute(self.conn.pool())
            .await
            .map_err(|e| map_sqlx_error("create instance", e))?;
        debug!(instance_id = %instance.id, instance_key = %instance.instance_key, "Instance inserted");
        Ok(())
    }

    async fn find_by_id(&self, id: &InstanceId) -> Result<Option<Instance>, CoreError> {
        let row = sqlx::query("SELECT data FROM relay_instances WHERE id = $1")
            .bind(&id.0)
            .fetch_optional(self.conn.pool())
            .await
            .map_err(|e| map_sqlx_error("find instance", e))?;
        row.as_ref().map(decode_instance).transpose()
    }

    async fn find_by_key(&self, key: &InstanceKey) -> Result<Option<Instance>, CoreError> {
        let row = sqlx::query("SELECT data FROM relay_instances WHERE instance_key = $1")
            .bind(&key.0)
            .fetch_optional(self.conn.pool())
            .await
            .map_err(|e| map_sqlx_error("find instance by key", e))?;
        row.as_ref().map(decode_instance).transpose()
    }

    async fn save(&self, instance: &Instance, expected_version: u64) -> Result<(), CoreError> {
        let data = serde_json::to_value(instance)?;
        // Compare-and-set on version: a writer in another process that saved
        // first makes this update match no row.
        let query = "
            UPDATE relay_instances
            SET status = $2, data = $3, version = $4, updated_at = NOW()
            WHERE id = $1 AND version = $5
        ";
        let result = sqlx::query(query)
            .bind(&instance.id.0)
            .bind(status_label(instance.status))
            .bind(&data)
            .bind(instance.version() as i64)
            .bind(expected_version as i64)
            .execute(self.conn.pool())
            .await
            .map_err(|e| map_sqlx_error("save instance", e))?;
        if result.rows_affected() == 1 {
            return Ok(());
        }

        let current: Option<i64> =
            sqlx::query_scalar("SELECT version FROM relay_instances WHERE id = $1")
                .bind(&instance.id.0)
                .fetch_optional(self.conn.pool())
                .await
                .map_err(|e| map_sqlx_error("check instance version", e))?;
        match current {
            Some(version) => {
                warn!(
                    instance_id = %instance.id,
                    stored = version,
                    expected = expected_version,
                    "Instance changed underneath this save"
                );
                Err(CoreError::VersionConflict(format!(
                    "instance {} is at version {}, expected {}",
                    instance.id, version, expected_version
                )))
            }
            None => Err(CoreError::InstanceNotFound(instance.id.to_string())),
        }
    }
}

/// Postgres implementation of the DefinitionRepository
#[derive(Clone)]
pub struct PostgresDefinitionRepository {
    conn: PostgresConnection,
}

impl PostgresDefinitionRepository {
    /// Create a new Postgres definition repository
    pub fn new(conn: PostgresConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DefinitionRepository for PostgresDefinitionRepository {
    async fn find_by_id(&self, id: &DefinitionId) -> Result<Option<ProcessDefinition>, CoreError> {
        let row = sqlx::query("SELECT graph FROM relay_process_definitions WHERE id = $1")
            .bind(&id.0)
            .fetch_optional(self.conn.pool())
            .await
            .map_err(|e| map_sqlx_error("find definition", e))?;
        match row {
            Some(row) => {
                let graph: serde_json::Value = row
                    .try_get("graph")
                    .map_err(|e| map_sqlx_error("read definition", e))?;
                Ok(Some(serde_json::from_value(graph)?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, definition: &ProcessDefinition, source: &str) -> Result<(), CoreError> {
        let graph = serde_json::to_value(definition)?;
        // The ID is the content hash, so an existing row already holds this graph.
        sqlx::query(
            "INSERT INTO relay_process_definitions (id, name, source, graph)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&definition.id.0)
        .bind(&definition.name)
        .bind(source)
        .bind(&graph)
        .execute(self.conn.pool())
        .await
        .map_err(|e| map_sqlx_error("save definition", e))?;
        Ok(())
    }
}

//! PostgreSQL-backed implementation of [`DurableStore`].
//!
//! Runtime-bound queries only; the schema lives in `migrations/` and is
//! applied with [`PostgresDurableStore::migrate`]. Lifecycle-plus-log writes
//! share one transaction at the call sites that need it via the upsert
//! semantics here; status enums are stored as their wire strings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::store::DurableStore;
use crate::types::*;

pub struct PostgresDurableStore {
    pool: sqlx::PgPool,
}

impl PostgresDurableStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EngineError::Store(format!("migration failed: {e}")))?;
        Ok(())
    }
}

fn store_err(e: sqlx::Error) -> EngineError {
    EngineError::Store(e.to_string())
}

fn json_err(e: serde_json::Error) -> EngineError {
    EngineError::Store(e.to_string())
}

fn status_from_str(s: &str) -> Result<InstanceStatus> {
    match s {
        "RUNNING" => Ok(InstanceStatus::Running),
        "SUSPENDED" => Ok(InstanceStatus::Suspended),
        "COMPLETED" => Ok(InstanceStatus::Completed),
        "ERROR" => Ok(InstanceStatus::Error),
        other => Err(EngineError::Store(format!("unknown instance status '{other}'"))),
    }
}

fn activity_type_from_str(s: &str) -> Result<ActivityType> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| EngineError::Store(format!("unknown activity type '{s}'")))
}

fn variable_type_from_str(s: &str) -> Result<VariableType> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| EngineError::Store(format!("unknown variable type '{s}'")))
}

#[async_trait]
impl DurableStore for PostgresDurableStore {
    // ── Definitions ──

    async fn save_definition(&self, definition: &ProcessDefinitionRecord) -> Result<()> {
        let variable_definitions =
            serde_json::to_value(&definition.variable_definitions).map_err(json_err)?;
        sqlx::query(
            r#"
            INSERT INTO process_definitions (id, name, version, bpmn_xml, variable_definitions)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                version = EXCLUDED.version,
                bpmn_xml = EXCLUDED.bpmn_xml,
                variable_definitions = EXCLUDED.variable_definitions
            "#,
        )
        .bind(definition.id)
        .bind(&definition.name)
        .bind(definition.version)
        .bind(&definition.bpmn_xml)
        .bind(&variable_definitions)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn load_definition(&self, id: Uuid) -> Result<Option<ProcessDefinitionRecord>> {
        let row = sqlx::query(
            "SELECT id, name, version, bpmn_xml, variable_definitions \
             FROM process_definitions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(definition_from_row).transpose()
    }

    async fn list_definitions(&self) -> Result<Vec<ProcessDefinitionRecord>> {
        let rows = sqlx::query(
            "SELECT id, name, version, bpmn_xml, variable_definitions \
             FROM process_definitions ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(definition_from_row).collect()
    }

    // ── Instances ──

    async fn save_instance(&self, instance: &ProcessInstanceRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO process_instances (id, definition_id, status, start_time, end_time)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                end_time = EXCLUDED.end_time
            "#,
        )
        .bind(instance.id)
        .bind(instance.definition_id)
        .bind(instance.status.to_string())
        .bind(instance.start_time)
        .bind(instance.end_time)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn load_instance(&self, id: Uuid) -> Result<Option<ProcessInstanceRecord>> {
        let row = sqlx::query(
            "SELECT id, definition_id, status, start_time, end_time \
             FROM process_instances WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(instance_from_row).transpose()
    }

    async fn list_instances(&self) -> Result<Vec<ProcessInstanceRecord>> {
        let rows = sqlx::query(
            "SELECT id, definition_id, status, start_time, end_time \
             FROM process_instances ORDER BY start_time",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(instance_from_row).collect()
    }

    async fn update_instance_status(
        &self,
        id: Uuid,
        status: InstanceStatus,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE process_instances SET status = $2, end_time = COALESCE($3, end_time) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.to_string())
        .bind(end_time)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(EngineError::InstanceNotFound(id));
        }
        Ok(())
    }

    // ── Variables ──

    async fn upsert_variable(&self, variable: &VariableRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO variables (id, instance_id, name, value_type, value_data, scope_id, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (instance_id, COALESCE(scope_id, ''), name) DO UPDATE SET
                value_type = EXCLUDED.value_type,
                value_data = EXCLUDED.value_data,
                version = variables.version + 1
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(variable.instance_id)
        .bind(&variable.name)
        .bind(variable.value.value_type.to_string())
        .bind(&variable.value.value)
        .bind(&variable.scope_id)
        .bind(variable.version)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn load_variables(
        &self,
        instance_id: Uuid,
        scope_id: Option<&str>,
    ) -> Result<Vec<VariableRecord>> {
        let rows = match scope_id {
            Some(scope) => {
                sqlx::query(
                    "SELECT instance_id, scope_id, name, value_type, value_data, version \
                     FROM variables WHERE instance_id = $1 AND scope_id = $2 ORDER BY name",
                )
                .bind(instance_id)
                .bind(scope)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT instance_id, scope_id, name, value_type, value_data, version \
                     FROM variables WHERE instance_id = $1 ORDER BY name",
                )
                .bind(instance_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(store_err)?;
        rows.into_iter().map(variable_from_row).collect()
    }

    // ── Activity log ──

    async fn append_activity(&self, entry: &ActivityLogRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_logs (id, instance_id, activity_type, node_id, details, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id)
        .bind(entry.instance_id)
        .bind(entry.activity_type.to_string())
        .bind(&entry.node_id)
        .bind(&entry.details)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn read_activities(&self, instance_id: Uuid) -> Result<Vec<ActivityLogRecord>> {
        let rows = sqlx::query(
            "SELECT id, instance_id, activity_type, node_id, details, timestamp \
             FROM activity_logs WHERE instance_id = $1 ORDER BY timestamp, id",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(activity_from_row).collect()
    }
}

// ─── Row mapping ──────────────────────────────────────────────

fn definition_from_row(row: sqlx::postgres::PgRow) -> Result<ProcessDefinitionRecord> {
    let variable_definitions: serde_json::Value =
        row.try_get("variable_definitions").map_err(store_err)?;
    Ok(ProcessDefinitionRecord {
        id: row.try_get("id").map_err(store_err)?,
        name: row.try_get("name").map_err(store_err)?,
        version: row.try_get("version").map_err(store_err)?,
        bpmn_xml: row.try_get("bpmn_xml").map_err(store_err)?,
        variable_definitions: serde_json::from_value(variable_definitions).map_err(json_err)?,
    })
}

fn instance_from_row(row: sqlx::postgres::PgRow) -> Result<ProcessInstanceRecord> {
    let status: String = row.try_get("status").map_err(store_err)?;
    Ok(ProcessInstanceRecord {
        id: row.try_get("id").map_err(store_err)?,
        definition_id: row.try_get("definition_id").map_err(store_err)?,
        status: status_from_str(&status)?,
        start_time: row.try_get("start_time").map_err(store_err)?,
        end_time: row.try_get("end_time").map_err(store_err)?,
    })
}

fn variable_from_row(row: sqlx::postgres::PgRow) -> Result<VariableRecord> {
    let value_type: String = row.try_get("value_type").map_err(store_err)?;
    Ok(VariableRecord {
        instance_id: row.try_get("instance_id").map_err(store_err)?,
        scope_id: row.try_get("scope_id").map_err(store_err)?,
        name: row.try_get("name").map_err(store_err)?,
        value: VariableValue {
            value_type: variable_type_from_str(&value_type)?,
            value: row.try_get("value_data").map_err(store_err)?,
        },
        version: row.try_get("version").map_err(store_err)?,
    })
}

fn activity_from_row(row: sqlx::postgres::PgRow) -> Result<ActivityLogRecord> {
    let activity_type: String = row.try_get("activity_type").map_err(store_err)?;
    Ok(ActivityLogRecord {
        id: row.try_get("id").map_err(store_err)?,
        instance_id: row.try_get("instance_id").map_err(store_err)?,
        activity_type: activity_type_from_str(&activity_type)?,
        node_id: row.try_get("node_id").map_err(store_err)?,
        details: row.try_get("details").map_err(store_err)?,
        timestamp: row.try_get("timestamp").map_err(store_err)?,
    })
}

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use uuid::Uuid;

use super::{Registry, TaskSeed};
use crate::error::{StoreError, StoreResult};
use crate::model::{
    NewResource, ReservationWindow, Resource, Task, TaskState, format_timestamp, parse_timestamp,
};

const RESOURCE_COLUMNS: &str = "id, uuid, resource_type, name, properties, deleted, suspended, \
     revision, created_at, updated_at";

const TASK_COLUMNS: &str = "id, resource_id, worker_name, state, state_details, last_error, \
     defer_reason, defer_count, observed_revision, next_check_at, version, updated_at";

/// SQLite-backed registry and task store.
pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    /// Open (or create) the database at `path` and apply migrations.
    pub async fn new(path: &Path) -> StoreResult<Self> {
        Self::connect(&format!("sqlite:{}", path.display())).await
    }

    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Private in-memory database. A single connection that is never
    /// recycled, since the data lives and dies with it.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    async fn require_resource(&self, id: i64) -> StoreResult<Resource> {
        self.get_resource(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("resource {id}")))
    }

    async fn get_task(&self, id: i64) -> StoreResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_task).transpose()
    }

    async fn bump_revision(&self, id: i64, assignments: &str) -> StoreResult<Resource> {
        let now = format_timestamp(&Utc::now());
        let result = sqlx::query(&format!(
            "UPDATE resources SET {assignments}revision = revision + 1, updated_at = ? WHERE id = ?"
        ))
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("resource {id}")));
        }
        self.require_resource(id).await
    }
}

#[async_trait]
impl Registry for SqliteRegistry {
    async fn get_resource(&self, id: i64) -> StoreResult<Option<Resource>> {
        let row = sqlx::query(&format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_resource).transpose()
    }

    async fn get_resource_by_uuid(&self, uuid: Uuid) -> StoreResult<Option<Resource>> {
        let row = sqlx::query(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources WHERE uuid = ?"
        ))
        .bind(uuid.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_resource).transpose()
    }

    async fn list_resources(&self) -> StoreResult<Vec<Resource>> {
        let rows = sqlx::query(&format!("SELECT {RESOURCE_COLUMNS} FROM resources ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_resource).collect()
    }

    async fn create_resource(
        &self,
        resource: NewResource,
        worker_names: &[String],
        seed: TaskSeed,
    ) -> StoreResult<Resource> {
        let now = format_timestamp(&Utc::now());
        let properties = serde_json::to_string(&resource.properties)?;
        // Seeded-steady tasks have already seen revision 1; pending ones have not.
        let observed_revision: i64 = match seed.state {
            TaskState::Steady => 1,
            _ => 0,
        };

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO resources (uuid, resource_type, name, properties, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(resource.uuid.to_string())
        .bind(&resource.resource_type)
        .bind(&resource.name)
        .bind(&properties)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| conflict_or(e, format!("resource {} already exists", resource.uuid)))?;
        let id = inserted.last_insert_rowid();

        for worker_name in worker_names {
            sqlx::query(
                r#"
                INSERT INTO tasks (resource_id, worker_name, state, state_details,
                                   observed_revision, next_check_at, version, updated_at)
                VALUES (?, ?, ?, '{}', ?, ?, 1, ?)
                "#,
            )
            .bind(id)
            .bind(worker_name)
            .bind(seed.state.as_str())
            .bind(observed_revision)
            .bind(format_timestamp(&seed.next_check_at))
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.require_resource(id).await
    }

    async fn update_resource_properties(
        &self,
        id: i64,
        properties: Map<String, Value>,
    ) -> StoreResult<Resource> {
        let now = format_timestamp(&Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE resources SET properties = ?, revision = revision + 1, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(serde_json::to_string(&properties)?)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("resource {id}")));
        }
        self.require_resource(id).await
    }

    async fn mark_resource_deleted(&self, id: i64) -> StoreResult<Resource> {
        self.bump_revision(id, "deleted = 1, ").await
    }

    async fn set_resource_suspended(&self, id: i64, suspended: bool) -> StoreResult<Resource> {
        let now = format_timestamp(&Utc::now());
        let result = sqlx::query("UPDATE resources SET suspended = ?, updated_at = ? WHERE id = ?")
            .bind(suspended)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("resource {id}")));
        }
        self.require_resource(id).await
    }

    async fn purge_deleted_resources(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM resources
            WHERE deleted = 1
              AND NOT EXISTS (
                SELECT 1 FROM tasks t
                WHERE t.resource_id = resources.id
                  AND (t.state != 'STEADY' OR t.observed_revision < resources.revision)
              )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn add_reservation_window(&self, window: &ReservationWindow) -> StoreResult<()> {
        if window.end <= window.start {
            return Err(StoreError::Invalid(format!(
                "window {} ends before it starts",
                window.uuid
            )));
        }

        let now = format_timestamp(&Utc::now());
        let mut tx = self.pool.begin().await?;

        let bumped = sqlx::query(
            "UPDATE resources SET revision = revision + 1, updated_at = ? WHERE uuid = ?",
        )
        .bind(&now)
        .bind(window.resource_uuid.to_string())
        .execute(&mut *tx)
        .await?;
        if bumped.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "resource {}",
                window.resource_uuid
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO reservation_windows (uuid, resource_uuid, start_at, end_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(window.uuid.to_string())
        .bind(window.resource_uuid.to_string())
        .bind(format_timestamp(&window.start))
        .bind(format_timestamp(&window.end))
        .execute(&mut *tx)
        .await
        .map_err(|e| conflict_or(e, format!("window {} already exists", window.uuid)))?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_reservation_window(&self, uuid: Uuid) -> StoreResult<bool> {
        let now = format_timestamp(&Utc::now());
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT resource_uuid FROM reservation_windows WHERE uuid = ?")
            .bind(uuid.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let resource_uuid: String = row.get("resource_uuid");

        sqlx::query("DELETE FROM reservation_windows WHERE uuid = ?")
            .bind(uuid.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE resources SET revision = revision + 1, updated_at = ? WHERE uuid = ?")
            .bind(&now)
            .bind(&resource_uuid)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn list_reservation_windows_for_resource(
        &self,
        resource_uuid: Uuid,
    ) -> StoreResult<Vec<ReservationWindow>> {
        let rows = sqlx::query(
            r#"
            SELECT uuid, resource_uuid, start_at, end_at
            FROM reservation_windows WHERE resource_uuid = ? ORDER BY start_at
            "#,
        )
        .bind(resource_uuid.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_window).collect()
    }

    async fn ensure_tasks(&self, worker_name: &str, resource_types: &[String]) -> StoreResult<u64> {
        let now = format_timestamp(&Utc::now());
        let mut created = 0;

        for resource_type in resource_types {
            let result = sqlx::query(
                r#"
                INSERT INTO tasks (resource_id, worker_name, state, state_details,
                                   observed_revision, next_check_at, version, updated_at)
                SELECT id, ?, 'PENDING', '{}', 0, ?, 1, ?
                FROM resources
                WHERE resource_type = ? AND deleted = 0
                ON CONFLICT (resource_id, worker_name) DO NOTHING
                "#,
            )
            .bind(worker_name)
            .bind(&now)
            .bind(&now)
            .bind(resource_type)
            .execute(&self.pool)
            .await?;
            created += result.rows_affected();
        }

        Ok(created)
    }

    async fn list_due_tasks(&self, now: DateTime<Utc>) -> StoreResult<Vec<Task>> {
        let now = format_timestamp(&now);
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.resource_id, t.worker_name, t.state, t.state_details, t.last_error,
                   t.defer_reason, t.defer_count, t.observed_revision, t.next_check_at,
                   t.version, t.updated_at
            FROM tasks t
            JOIN resources r ON r.id = t.resource_id
            WHERE r.suspended = 0
              AND NOT (t.state = 'IN_PROGRESS' AND t.next_check_at IS NOT NULL
                       AND t.next_check_at > ?)
              AND (
                t.observed_revision < r.revision
                OR (t.next_check_at IS NOT NULL AND t.next_check_at <= ?
                    AND NOT (r.deleted = 1 AND t.state = 'STEADY'))
              )
            ORDER BY t.resource_id, t.id
            "#,
        )
        .bind(&now)
        .bind(&now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_task).collect()
    }

    async fn list_tasks_for_resource(&self, resource_id: i64) -> StoreResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE resource_id = ? ORDER BY id"
        ))
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_task).collect()
    }

    async fn upsert_task(&self, task: &Task, expected_version: Option<i64>) -> StoreResult<Task> {
        let now = format_timestamp(&Utc::now());
        let details = serde_json::to_string(&task.state_details)?;
        let next_check_at = task.next_check_at.as_ref().map(format_timestamp);

        let Some(expected) = expected_version else {
            let inserted = sqlx::query(
                r#"
                INSERT INTO tasks (resource_id, worker_name, state, state_details, last_error,
                                   defer_reason, defer_count, observed_revision, next_check_at,
                                   version, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
                "#,
            )
            .bind(task.resource_id)
            .bind(&task.worker_name)
            .bind(task.state.as_str())
            .bind(&details)
            .bind(&task.last_error)
            .bind(&task.defer_reason)
            .bind(task.defer_count as i64)
            .bind(task.observed_revision)
            .bind(&next_check_at)
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                conflict_or(
                    e,
                    format!(
                        "task for resource {} and worker {} already exists",
                        task.resource_id, task.worker_name
                    ),
                )
            })?;

            return self
                .get_task(inserted.last_insert_rowid())
                .await?
                .ok_or_else(|| StoreError::NotFound("inserted task".to_string()));
        };

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = ?, state_details = ?, last_error = ?, defer_reason = ?,
                defer_count = ?, observed_revision = ?, next_check_at = ?,
                version = version + 1, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(task.state.as_str())
        .bind(&details)
        .bind(&task.last_error)
        .bind(&task.defer_reason)
        .bind(task.defer_count as i64)
        .bind(task.observed_revision)
        .bind(&next_check_at)
        .bind(&now)
        .bind(task.id)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_task(task.id).await? {
                Some(current) => Err(StoreError::VersionMismatch {
                    expected,
                    actual: current.version,
                }),
                None => Err(StoreError::NotFound(format!("task {}", task.id))),
            };
        }

        self.get_task(task.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task.id)))
    }
}

fn conflict_or(err: sqlx::Error, message: String) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(message),
        _ => StoreError::Database(err),
    }
}

fn parse_uuid(s: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("uuid '{s}': {e}")))
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    parse_timestamp(s).map_err(|e| StoreError::Corrupt(format!("timestamp '{s}': {e}")))
}

fn row_to_resource(row: SqliteRow) -> StoreResult<Resource> {
    let properties: String = row.get("properties");
    Ok(Resource {
        id: row.get("id"),
        uuid: parse_uuid(row.get("uuid"))?,
        resource_type: row.get("resource_type"),
        name: row.get("name"),
        properties: serde_json::from_str(&properties)?,
        deleted: row.get("deleted"),
        suspended: row.get("suspended"),
        revision: row.get("revision"),
        created_at: parse_ts(row.get("created_at"))?,
        updated_at: parse_ts(row.get("updated_at"))?,
    })
}

fn row_to_window(row: SqliteRow) -> StoreResult<ReservationWindow> {
    Ok(ReservationWindow {
        uuid: parse_uuid(row.get("uuid"))?,
        resource_uuid: parse_uuid(row.get("resource_uuid"))?,
        start: parse_ts(row.get("start_at"))?,
        end: parse_ts(row.get("end_at"))?,
    })
}

fn row_to_task(row: SqliteRow) -> StoreResult<Task> {
    let state: String = row.get("state");
    let details: String = row.get("state_details");
    let next_check_at: Option<String> = row.get("next_check_at");

    Ok(Task {
        id: row.get("id"),
        resource_id: row.get("resource_id"),
        worker_name: row.get("worker_name"),
        state: state.parse().map_err(StoreError::Corrupt)?,
        state_details: serde_json::from_str(&details)?,
        last_error: row.get("last_error"),
        defer_reason: row.get("defer_reason"),
        defer_count: row.get::<i64, _>("defer_count") as u32,
        observed_revision: row.get("observed_revision"),
        next_check_at: next_check_at.as_deref().map(parse_ts).transpose()?,
        version: row.get("version"),
        updated_at: parse_ts(row.get("updated_at"))?,
    })
}

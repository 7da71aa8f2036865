//! Resource registry and task state store.
//!
//! The [`Registry`] trait is the narrow interface the manager, the workers
//! and the import flow use; [`SqliteRegistry`] is the persistent backend.

mod sqlite;

pub use sqlite::SqliteRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::model::{NewResource, ReservationWindow, Resource, Task, TaskState};

/// How tasks of a newly registered resource start out.
#[derive(Debug, Clone, Copy)]
pub struct TaskSeed {
    pub state: TaskState,
    pub next_check_at: DateTime<Utc>,
}

impl TaskSeed {
    /// Due immediately.
    pub fn pending(now: DateTime<Utc>) -> Self {
        Self {
            state: TaskState::Pending,
            next_check_at: now,
        }
    }

    /// Already converged (imported from the external service); next check at `next_check_at`.
    pub fn steady(next_check_at: DateTime<Utc>) -> Self {
        Self {
            state: TaskState::Steady,
            next_check_at,
        }
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    // Resources

    async fn get_resource(&self, id: i64) -> StoreResult<Option<Resource>>;

    async fn get_resource_by_uuid(&self, uuid: Uuid) -> StoreResult<Option<Resource>>;

    async fn list_resources(&self) -> StoreResult<Vec<Resource>>;

    /// Insert a resource and one task per worker, atomically.
    async fn create_resource(
        &self,
        resource: NewResource,
        worker_names: &[String],
        seed: TaskSeed,
    ) -> StoreResult<Resource>;

    /// Replace the desired-state payload. Bumps the revision.
    async fn update_resource_properties(
        &self,
        id: i64,
        properties: Map<String, Value>,
    ) -> StoreResult<Resource>;

    /// Soft delete. Workers tear down external state before the record is purged.
    async fn mark_resource_deleted(&self, id: i64) -> StoreResult<Resource>;

    async fn set_resource_suspended(&self, id: i64, suspended: bool) -> StoreResult<Resource>;

    /// Hard-delete soft-deleted resources whose tasks have all converged.
    async fn purge_deleted_resources(&self) -> StoreResult<u64>;

    // Reservation windows

    async fn add_reservation_window(&self, window: &ReservationWindow) -> StoreResult<()>;

    async fn delete_reservation_window(&self, uuid: Uuid) -> StoreResult<bool>;

    async fn list_reservation_windows_for_resource(
        &self,
        resource_uuid: Uuid,
    ) -> StoreResult<Vec<ReservationWindow>>;

    // Tasks

    /// Create missing tasks for live resources of the given types.
    async fn ensure_tasks(&self, worker_name: &str, resource_types: &[String]) -> StoreResult<u64>;

    async fn list_due_tasks(&self, now: DateTime<Utc>) -> StoreResult<Vec<Task>>;

    async fn list_tasks_for_resource(&self, resource_id: i64) -> StoreResult<Vec<Task>>;

    /// Write a task.
    ///
    /// With `expected_version` set this is a compare-and-set: it fails with
    /// `StoreError::VersionMismatch` unless the stored version matches, and
    /// returns the task with its new version. With `None` the task is
    /// inserted and an existing (resource, worker) pair is a conflict.
    async fn upsert_task(&self, task: &Task, expected_version: Option<i64>) -> StoreResult<Task>;
}

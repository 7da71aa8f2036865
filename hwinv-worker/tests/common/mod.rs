//! Shared fixtures for hwinv-worker integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tempfile::TempDir;

use hwinv_worker::backoff::Backoff;
use hwinv_worker::config::ManagerConfig;
use hwinv_worker::error::Result;
use hwinv_worker::model::{NewResource, ReservationWindow, Resource, StateDetails, Task};
use hwinv_worker::store::{Registry, SqliteRegistry, TaskSeed};
use hwinv_worker::worker::{Worker, WorkerContext, WorkerField, WorkerOptions, WorkerResult};

pub const RESOURCE_TYPE: &str = "baremetal";

/// A registry in a throwaway directory.
pub struct TestEnv {
    pub registry: Arc<dyn Registry>,
    _dir: TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let registry = SqliteRegistry::new(&dir.path().join("registry.db"))
            .await
            .expect("Failed to open registry");
        Self {
            registry: Arc::new(registry),
            _dir: dir,
        }
    }

    /// Register a resource with PENDING tasks for `workers`.
    pub async fn add_resource(&self, name: &str, properties: Value, workers: &[&str]) -> Resource {
        let workers: Vec<String> = workers.iter().map(|w| w.to_string()).collect();
        self.registry
            .create_resource(
                NewResource::new(RESOURCE_TYPE, name, props(properties)),
                &workers,
                TaskSeed::pending(Utc::now()),
            )
            .await
            .expect("Failed to create resource")
    }

    pub async fn task(&self, resource: &Resource, worker: &str) -> Task {
        self.registry
            .list_tasks_for_resource(resource.id)
            .await
            .expect("Failed to list tasks")
            .into_iter()
            .find(|t| t.worker_name == worker)
            .expect("No such task")
    }

    /// Make a task due now without touching its state.
    pub async fn make_due(&self, resource: &Resource, worker: &str) {
        let mut task = self.task(resource, worker).await;
        let version = task.version;
        task.next_check_at = Some(Utc::now() - chrono::Duration::seconds(1));
        self.registry
            .upsert_task(&task, Some(version))
            .await
            .expect("Failed to update task");
    }
}

pub fn props(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub fn config() -> ManagerConfig {
    ManagerConfig {
        process_interval: Duration::from_millis(10),
        resync_interval: Duration::from_secs(3600),
        backoff: Backoff::new(Duration::from_secs(30), Duration::from_secs(900)),
        claim_timeout: Duration::from_secs(600),
        task_concurrency: 4,
    }
}

/// What a worker was called with.
#[derive(Debug, Clone)]
pub struct Call {
    pub resource: Resource,
    pub windows: Vec<ReservationWindow>,
    pub state_details: StateDetails,
}

type Script = Box<dyn Fn(&Resource, &StateDetails) -> Result<WorkerResult> + Send + Sync>;

/// Worker whose outcome is decided by a closure; records every call.
pub struct ScriptedWorker {
    name: String,
    consumes_windows: bool,
    script: Script,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedWorker {
    pub fn new<F>(name: &str, script: F) -> Arc<Self>
    where
        F: Fn(&Resource, &StateDetails) -> Result<WorkerResult> + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.to_string(),
            consumes_windows: false,
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn consuming_windows<F>(name: &str, script: F) -> Arc<Self>
    where
        F: Fn(&Resource, &StateDetails) -> Result<WorkerResult> + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.to_string(),
            consumes_windows: true,
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Always succeeds with an empty payload.
    pub fn steady(name: &str) -> Arc<Self> {
        Self::new(name, |_, _| Ok(WorkerResult::success(StateDetails::new())))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn register_options(&self) -> WorkerOptions {
        WorkerOptions {
            name: self.name.clone(),
            resource_types: vec![RESOURCE_TYPE.to_string()],
            consumes_windows: self.consumes_windows,
        }
    }

    fn fields(&self) -> Vec<WorkerField> {
        Vec::new()
    }

    async fn process(
        &self,
        _ctx: &WorkerContext,
        resource: &Resource,
        windows: &[ReservationWindow],
        state_details: &StateDetails,
    ) -> Result<WorkerResult> {
        self.calls.lock().unwrap().push(Call {
            resource: resource.clone(),
            windows: windows.to_vec(),
            state_details: state_details.clone(),
        });
        (self.script)(resource, state_details)
    }
}

//! End-to-end tests of the worker manager against a SQLite registry.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use hwinv_worker::error::{Error, Result, ServiceError};
use hwinv_worker::manager::{TaskOutcome, WorkerManager};
use hwinv_worker::model::{ReservationWindow, Resource, StateDetails, TaskState};
use hwinv_worker::worker::{
    Worker, WorkerContext, WorkerField, WorkerOptions, WorkerRegistry, WorkerResult, payload,
};

use common::{RESOURCE_TYPE, ScriptedWorker, TestEnv, config, props};

fn manager(env: &TestEnv, workers: Vec<Arc<dyn Worker>>) -> WorkerManager {
    let mut registry = WorkerRegistry::new();
    for worker in workers {
        registry.register(worker).unwrap();
    }
    WorkerManager::new(Arc::clone(&env.registry), registry, config())
}

#[tokio::test]
async fn test_success_converges_and_merges_payload() {
    let env = TestEnv::new().await;
    let worker = ScriptedWorker::new("alpha", |_, _| {
        Ok(WorkerResult::success(payload(json!({"external_id": "node-1"}))))
    });
    let manager = manager(&env, vec![worker.clone()]);
    let resource = env.add_resource("r1", json!({"cpu_arch": "x86_64"}), &["alpha"]).await;

    let before = Utc::now();
    let report = manager.process_pending().await.unwrap();
    assert_eq!(report.steady, 1);
    assert_eq!(report.total(), 1);

    let task = env.task(&resource, "alpha").await;
    assert_eq!(task.state, TaskState::Steady);
    assert_eq!(task.state_details.get("external_id"), Some(&json!("node-1")));
    assert_eq!(task.observed_revision, resource.revision);
    assert_eq!(task.defer_count, 0);
    let next = task.next_check_at.unwrap();
    assert!(next >= before + chrono::Duration::seconds(3599));

    let calls = worker.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].resource.properties.get("cpu_arch"), Some(&json!("x86_64")));
    assert!(calls[0].state_details.is_empty());

    // Nothing is due until the resync interval passes or properties change.
    let report = manager.process_pending().await.unwrap();
    assert_eq!(report.total(), 0);
    assert_eq!(worker.calls().len(), 1);
}

#[tokio::test]
async fn test_properties_change_reprocesses_with_previous_details() {
    let env = TestEnv::new().await;
    let worker = ScriptedWorker::new("alpha", |resource, details| {
        let runs = details.get("runs").and_then(Value::as_u64).unwrap_or(0);
        Ok(WorkerResult::success(payload(json!({
            "runs": runs + 1,
            "name_seen": resource.name,
        }))))
    });
    let manager = manager(&env, vec![worker.clone()]);
    let resource = env.add_resource("r1", json!({"cpu_arch": "x86_64"}), &["alpha"]).await;

    manager.process_pending().await.unwrap();
    let updated = env
        .registry
        .update_resource_properties(resource.id, props(json!({"cpu_arch": "aarch64"})))
        .await
        .unwrap();
    assert!(updated.revision > resource.revision);

    let report = manager.process_pending().await.unwrap();
    assert_eq!(report.steady, 1);

    let calls = worker.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].resource.properties.get("cpu_arch"), Some(&json!("aarch64")));
    assert_eq!(calls[1].state_details.get("runs"), Some(&json!(1)));

    let task = env.task(&resource, "alpha").await;
    assert_eq!(task.state_details.get("runs"), Some(&json!(2)));
    assert_eq!(task.observed_revision, updated.revision);
}

#[tokio::test]
async fn test_defer_backs_off_and_counts_attempts() {
    let env = TestEnv::new().await;
    let worker = ScriptedWorker::new("alpha", |_, _| {
        Ok(WorkerResult::defer_with(
            payload(json!({"external_id": "5"})),
            "node is locked",
        ))
    });
    let manager = manager(&env, vec![worker.clone()]);
    let resource = env.add_resource("r1", json!({}), &["alpha"]).await;

    let before = Utc::now();
    let report = manager.process_pending().await.unwrap();
    assert_eq!(report.deferred, 1);

    let task = env.task(&resource, "alpha").await;
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.defer_count, 1);
    assert_eq!(task.defer_reason.as_deref(), Some("node is locked"));
    assert_eq!(task.last_error, None);
    assert_eq!(task.state_details.get("external_id"), Some(&json!("5")));
    assert_eq!(task.observed_revision, resource.revision);

    // Jittered between half and all of the 30s base delay.
    let next = task.next_check_at.unwrap();
    assert!(next >= before + chrono::Duration::seconds(14));
    assert!(next <= Utc::now() + chrono::Duration::seconds(31));

    // Not due again until the backoff passes.
    assert_eq!(manager.process_pending().await.unwrap().total(), 0);

    env.make_due(&resource, "alpha").await;
    let report = manager.process_pending().await.unwrap();
    assert_eq!(report.deferred, 1);
    let task = env.task(&resource, "alpha").await;
    assert_eq!(task.defer_count, 2);
    assert_eq!(worker.calls().len(), 2);
}

#[tokio::test]
async fn test_success_after_defer_resets_counters() {
    let env = TestEnv::new().await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&attempts);
    let worker = ScriptedWorker::new("alpha", move |_, _| {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(WorkerResult::defer("still cleaning"))
        } else {
            Ok(WorkerResult::success(StateDetails::new()))
        }
    });
    let manager = manager(&env, vec![worker]);
    let resource = env.add_resource("r1", json!({}), &["alpha"]).await;

    manager.process_pending().await.unwrap();
    env.make_due(&resource, "alpha").await;
    let report = manager.process_pending().await.unwrap();
    assert_eq!(report.steady, 1);

    let task = env.task(&resource, "alpha").await;
    assert_eq!(task.state, TaskState::Steady);
    assert_eq!(task.defer_count, 0);
    assert_eq!(task.defer_reason, None);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retryable_error_keeps_details_and_retries() {
    let env = TestEnv::new().await;
    let worker = ScriptedWorker::new("alpha", |resource, _| {
        if resource.properties.contains_key("broken") {
            Err(Error::Inconsistent("conflict without a matching record".to_string()))
        } else {
            Ok(WorkerResult::success(payload(json!({"external_id": "7"}))))
        }
    });
    let manager = manager(&env, vec![worker]);
    let resource = env.add_resource("r1", json!({}), &["alpha"]).await;
    manager.process_pending().await.unwrap();

    env.registry
        .update_resource_properties(resource.id, props(json!({"broken": true})))
        .await
        .unwrap();
    let report = manager.process_pending().await.unwrap();
    assert_eq!(report.failed, 1);

    let task = env.task(&resource, "alpha").await;
    assert_eq!(task.state, TaskState::Error);
    assert!(task.last_error.as_deref().unwrap().contains("conflict without a matching record"));
    assert_eq!(task.state_details.get("external_id"), Some(&json!("7")));
    assert!(task.next_check_at.is_some());

    env.make_due(&resource, "alpha").await;
    assert_eq!(manager.process_pending().await.unwrap().failed, 1);
}

#[tokio::test]
async fn test_repeated_service_errors_back_off_further() {
    let env = TestEnv::new().await;
    let worker = ScriptedWorker::new("alpha", |_, _| {
        Err(Error::Service(ServiceError::Api {
            service: "Blazar".to_string(),
            code: 500,
            text: "internal error".to_string(),
        }))
    });
    let manager = manager(&env, vec![worker.clone()]);
    let resource = env.add_resource("r1", json!({}), &["alpha"]).await;

    assert_eq!(manager.process_pending().await.unwrap().failed, 1);
    let task = env.task(&resource, "alpha").await;
    assert_eq!(task.state, TaskState::Error);
    assert_eq!(task.defer_count, 1);
    // First attempt: at most the 30s base delay.
    assert!(task.next_check_at.unwrap() <= Utc::now() + chrono::Duration::seconds(30));

    env.make_due(&resource, "alpha").await;
    let second_started = Utc::now();
    assert_eq!(manager.process_pending().await.unwrap().failed, 1);
    let task = env.task(&resource, "alpha").await;
    assert_eq!(task.defer_count, 2);
    // Second attempt: jittered between 30s and 60s, past the first ceiling
    // (less a millisecond lost to timestamp precision).
    let second = task.next_check_at.unwrap();
    assert!(second >= second_started + chrono::Duration::milliseconds(29_999));
    assert_eq!(worker.calls().len(), 2);
}

#[tokio::test]
async fn test_invalid_input_is_parked_until_properties_change() {
    let env = TestEnv::new().await;
    let worker = ScriptedWorker::new("alpha", |resource, _| {
        if resource.properties.contains_key("management_address") {
            Ok(WorkerResult::success(StateDetails::new()))
        } else {
            Err(Error::MissingProperty("management_address".to_string()))
        }
    });
    let manager = manager(&env, vec![worker.clone()]);
    let resource = env.add_resource("r1", json!({}), &["alpha"]).await;

    let report = manager.process_pending().await.unwrap();
    assert_eq!(report.failed, 1);
    let task = env.task(&resource, "alpha").await;
    assert_eq!(task.state, TaskState::Error);
    assert_eq!(task.next_check_at, None);

    // Parked: no amount of passes retries it.
    assert_eq!(manager.process_pending().await.unwrap().total(), 0);
    assert_eq!(worker.calls().len(), 1);

    env.registry
        .update_resource_properties(resource.id, props(json!({"management_address": "10.0.0.5"})))
        .await
        .unwrap();
    let report = manager.process_pending().await.unwrap();
    assert_eq!(report.steady, 1);
    let task = env.task(&resource, "alpha").await;
    assert_eq!(task.state, TaskState::Steady);
    assert_eq!(task.last_error, None);
}

#[tokio::test]
async fn test_stale_task_is_lost_without_running_worker() {
    let env = TestEnv::new().await;
    let worker = ScriptedWorker::steady("alpha");
    let manager = manager(&env, vec![worker.clone()]);
    env.add_resource("r1", json!({}), &["alpha"]).await;

    let stale = env.registry.list_due_tasks(Utc::now()).await.unwrap().remove(0);
    // Another manager claims it first.
    let mut other = stale.clone();
    other.state = TaskState::InProgress;
    other.next_check_at = Some(Utc::now() + chrono::Duration::minutes(10));
    env.registry.upsert_task(&other, Some(stale.version)).await.unwrap();

    assert_eq!(manager.process_task(stale).await.unwrap(), TaskOutcome::Lost);
    assert!(worker.calls().is_empty());

    // The claim lease hides the task from further passes.
    assert_eq!(manager.process_pending().await.unwrap().total(), 0);
}

/// Touches its own task while running, like a second manager would.
struct Interfering;

#[async_trait]
impl Worker for Interfering {
    fn register_options(&self) -> WorkerOptions {
        WorkerOptions {
            name: "interfering".to_string(),
            resource_types: vec![RESOURCE_TYPE.to_string()],
            consumes_windows: false,
        }
    }

    fn fields(&self) -> Vec<WorkerField> {
        Vec::new()
    }

    async fn process(
        &self,
        ctx: &WorkerContext,
        resource: &Resource,
        _windows: &[ReservationWindow],
        _state_details: &StateDetails,
    ) -> Result<WorkerResult> {
        let tasks = ctx.registry.list_tasks_for_resource(resource.id).await?;
        if let Some(task) = tasks.into_iter().find(|t| t.worker_name == "interfering") {
            let version = task.version;
            ctx.registry.upsert_task(&task, Some(version)).await?;
        }
        Ok(WorkerResult::success(payload(json!({"external_id": "x"}))))
    }
}

#[tokio::test]
async fn test_concurrent_update_discards_result() {
    let env = TestEnv::new().await;
    let manager = manager(&env, vec![Arc::new(Interfering)]);
    let resource = env.add_resource("r1", json!({}), &["interfering"]).await;

    let report = manager.process_pending().await.unwrap();
    assert_eq!(report.lost, 1);

    let task = env.task(&resource, "interfering").await;
    assert_eq!(task.state, TaskState::InProgress);
    assert!(task.state_details.is_empty());
}

/// Records a discovered value on the resource through the registry handle.
struct Discovering;

#[async_trait]
impl Worker for Discovering {
    fn register_options(&self) -> WorkerOptions {
        WorkerOptions {
            name: "discovering".to_string(),
            resource_types: vec![RESOURCE_TYPE.to_string()],
            consumes_windows: false,
        }
    }

    fn fields(&self) -> Vec<WorkerField> {
        Vec::new()
    }

    async fn process(
        &self,
        ctx: &WorkerContext,
        resource: &Resource,
        _windows: &[ReservationWindow],
        _state_details: &StateDetails,
    ) -> Result<WorkerResult> {
        if !resource.properties.contains_key("serial") {
            let mut properties = resource.properties.clone();
            properties.insert("serial".to_string(), json!("SN-1234"));
            ctx.registry
                .update_resource_properties(resource.id, properties)
                .await?;
        }
        Ok(WorkerResult::success(StateDetails::new()))
    }
}

#[tokio::test]
async fn test_worker_writes_back_through_registry() {
    let env = TestEnv::new().await;
    let manager = manager(&env, vec![Arc::new(Discovering)]);
    let resource = env.add_resource("r1", json!({"cpu_arch": "x86_64"}), &["discovering"]).await;

    assert_eq!(manager.process_pending().await.unwrap().steady, 1);
    let stored = env.registry.get_resource(resource.id).await.unwrap().unwrap();
    assert_eq!(stored.properties.get("serial"), Some(&json!("SN-1234")));
    assert_eq!(stored.properties.get("cpu_arch"), Some(&json!("x86_64")));

    // The write bumped the revision, so one more pass observes it.
    assert_eq!(manager.process_pending().await.unwrap().steady, 1);
    let task = env.task(&resource, "discovering").await;
    assert_eq!(task.observed_revision, stored.revision);
    assert_eq!(manager.process_pending().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_windows_reach_only_consuming_workers() {
    let env = TestEnv::new().await;
    let leases = ScriptedWorker::consuming_windows("leases", |_, _| {
        Ok(WorkerResult::success(StateDetails::new()))
    });
    let plain = ScriptedWorker::steady("plain");
    let manager = manager(&env, vec![leases.clone(), plain.clone()]);
    let resource = env.add_resource("r1", json!({}), &["leases", "plain"]).await;

    let start = Utc::now() + chrono::Duration::days(1);
    for offset in [0, 7] {
        let window = ReservationWindow::new(
            resource.uuid,
            start + chrono::Duration::days(offset),
            start + chrono::Duration::days(offset + 1),
        );
        env.registry.add_reservation_window(&window).await.unwrap();
    }

    let report = manager.process_pending().await.unwrap();
    assert_eq!(report.steady, 2);

    let calls = leases.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].windows.len(), 2);
    assert!(calls[0].windows.iter().all(|w| w.resource_uuid == resource.uuid));
    assert!(plain.calls()[0].windows.is_empty());
}

#[tokio::test]
async fn test_unknown_worker_is_skipped() {
    let env = TestEnv::new().await;
    let worker = ScriptedWorker::steady("alpha");
    let manager = manager(&env, vec![worker]);
    let resource = env.add_resource("r1", json!({}), &["retired", "alpha"]).await;

    let report = manager.process_pending().await.unwrap();
    assert_eq!(report.steady, 1);
    assert_eq!(report.skipped, 1);

    let task = env.task(&resource, "retired").await;
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.version, 1);
}

#[tokio::test]
async fn test_missing_tasks_are_created_for_new_workers() {
    let env = TestEnv::new().await;
    let resource = env.add_resource("r1", json!({}), &["alpha"]).await;
    let manager = manager(
        &env,
        vec![ScriptedWorker::steady("alpha"), ScriptedWorker::steady("beta")],
    );

    let report = manager.process_pending().await.unwrap();
    assert_eq!(report.steady, 2);
    let tasks = env.registry.list_tasks_for_resource(resource.id).await.unwrap();
    let mut names: Vec<&str> = tasks.iter().map(|t| t.worker_name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["alpha", "beta"]);
}

#[tokio::test]
async fn test_suspended_resource_is_not_processed() {
    let env = TestEnv::new().await;
    let worker = ScriptedWorker::steady("alpha");
    let manager = manager(&env, vec![worker.clone()]);
    let resource = env.add_resource("r1", json!({}), &["alpha"]).await;

    env.registry.set_resource_suspended(resource.id, true).await.unwrap();
    assert_eq!(manager.process_pending().await.unwrap().total(), 0);
    assert!(worker.calls().is_empty());

    env.registry.set_resource_suspended(resource.id, false).await.unwrap();
    assert_eq!(manager.process_pending().await.unwrap().steady, 1);
}

#[tokio::test]
async fn test_deleted_resource_is_purged_after_teardown() {
    let env = TestEnv::new().await;
    let worker = ScriptedWorker::new("alpha", |resource, _| {
        if resource.deleted {
            Ok(WorkerResult::success(payload(json!({"external_id": null}))))
        } else {
            Ok(WorkerResult::success(payload(json!({"external_id": "node-1"}))))
        }
    });
    let manager = manager(&env, vec![worker.clone()]);
    let resource = env.add_resource("r1", json!({}), &["alpha"]).await;
    manager.process_pending().await.unwrap();

    env.registry.mark_resource_deleted(resource.id).await.unwrap();
    let report = manager.process_pending().await.unwrap();
    assert_eq!(report.steady, 1);
    assert_eq!(report.purged, 1);

    assert!(env.registry.get_resource(resource.id).await.unwrap().is_none());
    let calls = worker.calls();
    assert!(calls[1].resource.deleted);
    assert_eq!(calls[1].state_details.get("external_id"), Some(&json!("node-1")));
}

#[tokio::test]
async fn test_deleted_resource_waits_for_deferred_teardown() {
    let env = TestEnv::new().await;
    let worker = ScriptedWorker::new("alpha", |resource, _| {
        if resource.deleted {
            Ok(WorkerResult::defer("active leases exist for resource"))
        } else {
            Ok(WorkerResult::success(StateDetails::new()))
        }
    });
    let manager = manager(&env, vec![worker]);
    let resource = env.add_resource("r1", json!({}), &["alpha"]).await;
    manager.process_pending().await.unwrap();

    env.registry.mark_resource_deleted(resource.id).await.unwrap();
    let report = manager.process_pending().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.purged, 0);
    assert!(env.registry.get_resource(resource.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_run_until_processes_then_stops() {
    let env = TestEnv::new().await;
    let worker = ScriptedWorker::steady("alpha");
    let manager = manager(&env, vec![worker.clone()]);
    env.add_resource("r1", json!({}), &["alpha"]).await;

    tokio::time::timeout(
        Duration::from_secs(10),
        manager.run_until(tokio::time::sleep(Duration::from_millis(200))),
    )
    .await
    .expect("manager did not stop on shutdown");

    assert_eq!(worker.calls().len(), 1);
}

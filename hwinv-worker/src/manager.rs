//! Worker manager: discovers due tasks, dispatches them to workers and
//! records the outcome.
//!
//! Several managers may share one registry. A task is claimed with a
//! compare-and-set write before its worker runs, and the outcome is written
//! back against the claimed version, so a task is never worked on by two
//! managers at once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::error::{Result, StoreError};
use crate::model::{Task, TaskState};
use crate::store::Registry;
use crate::worker::{WorkerContext, WorkerRegistry, WorkerResult};

/// What happened to a single task in a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Steady,
    Deferred,
    Failed,
    /// No enabled worker applies; the task was left untouched.
    Skipped,
    /// Another manager claimed or updated the task first.
    Lost,
}

/// Counts for one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub steady: usize,
    pub deferred: usize,
    pub failed: usize,
    pub skipped: usize,
    pub lost: usize,
    pub purged: u64,
}

impl BatchReport {
    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Steady => self.steady += 1,
            TaskOutcome::Deferred => self.deferred += 1,
            TaskOutcome::Failed => self.failed += 1,
            TaskOutcome::Skipped => self.skipped += 1,
            TaskOutcome::Lost => self.lost += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.steady + self.deferred + self.failed + self.skipped + self.lost
    }
}

#[derive(Clone)]
pub struct WorkerManager {
    registry: Arc<dyn Registry>,
    workers: Arc<WorkerRegistry>,
    config: ManagerConfig,
}

impl WorkerManager {
    pub fn new(registry: Arc<dyn Registry>, workers: WorkerRegistry, config: ManagerConfig) -> Self {
        Self {
            registry,
            workers: Arc::new(workers),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Run one discovery pass over every due task.
    ///
    /// Individual task failures are recorded on the task and counted; only
    /// failures to read or write the registry itself abort the pass.
    pub async fn process_pending(&self) -> Result<BatchReport> {
        for (name, worker) in self.workers.iter() {
            let types = worker.register_options().resource_types;
            let created = self.registry.ensure_tasks(name, &types).await?;
            if created > 0 {
                info!(worker = %name, created, "created missing tasks");
            }
        }

        let due = self.registry.list_due_tasks(Utc::now()).await?;
        let mut report = BatchReport::default();
        if !due.is_empty() {
            debug!(count = due.len(), "found due tasks");
        }

        let permits = Arc::new(Semaphore::new(self.config.task_concurrency));
        for layer in layers(due) {
            let mut set = JoinSet::new();
            for task in layer {
                let manager = self.clone();
                let permits = Arc::clone(&permits);
                set.spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    let task_id = task.id;
                    let worker = task.worker_name.clone();
                    (task_id, worker, manager.process_task(task).await)
                });
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((_, _, Ok(outcome))) => report.record(outcome),
                    Ok((task_id, worker, Err(e))) => {
                        error!(task_id, worker = %worker, error = %e, "failed to process task");
                        report.record(TaskOutcome::Failed);
                    }
                    Err(e) => {
                        error!(error = %e, "task processing panicked");
                        report.record(TaskOutcome::Failed);
                    }
                }
            }
        }

        report.purged = self.registry.purge_deleted_resources().await?;
        if report.total() > 0 || report.purged > 0 {
            info!(
                steady = report.steady,
                deferred = report.deferred,
                failed = report.failed,
                skipped = report.skipped,
                lost = report.lost,
                purged = report.purged,
                "processed tasks"
            );
        }
        Ok(report)
    }

    /// Claim `task`, run its worker and persist the outcome.
    ///
    /// `Err` is returned only for registry failures; worker errors are
    /// recorded on the task and reported as [`TaskOutcome::Failed`].
    pub async fn process_task(&self, task: Task) -> Result<TaskOutcome> {
        let Some(worker) = self.workers.get(&task.worker_name) else {
            debug!(task_id = task.id, worker = %task.worker_name, "worker not enabled, skipping");
            return Ok(TaskOutcome::Skipped);
        };
        let Some(resource) = self.registry.get_resource(task.resource_id).await? else {
            return Ok(TaskOutcome::Skipped);
        };
        if !self.workers.applies_to(&task.worker_name, &resource.resource_type) {
            debug!(
                task_id = task.id,
                worker = %task.worker_name,
                resource_type = %resource.resource_type,
                "worker does not apply to resource type, skipping"
            );
            return Ok(TaskOutcome::Skipped);
        }

        let mut claim = task.clone();
        claim.state = TaskState::InProgress;
        claim.next_check_at = Some(after(Utc::now(), self.config.claim_timeout));
        let claimed = match self.registry.upsert_task(&claim, Some(task.version)).await {
            Ok(claimed) => claimed,
            Err(StoreError::VersionMismatch { .. } | StoreError::NotFound(_)) => {
                debug!(task_id = task.id, "task claimed elsewhere");
                return Ok(TaskOutcome::Lost);
            }
            Err(e) => return Err(e.into()),
        };

        let windows = if worker.register_options().consumes_windows {
            self.registry
                .list_reservation_windows_for_resource(resource.uuid)
                .await?
        } else {
            Vec::new()
        };

        let ctx = WorkerContext::new(Arc::clone(&self.registry));
        debug!(
            task_id = task.id,
            worker = %task.worker_name,
            resource = %resource.uuid,
            request_id = %ctx.request_id,
            "processing task"
        );
        let result = worker
            .process(&ctx, &resource, &windows, &claimed.state_details)
            .await;

        let now = Utc::now();
        let mut next = claimed.clone();
        next.observed_revision = resource.revision;
        let outcome = match result {
            Ok(WorkerResult::Success { payload }) => {
                next.merge_details(payload);
                next.state = TaskState::Steady;
                next.last_error = None;
                next.defer_reason = None;
                next.defer_count = 0;
                next.next_check_at = Some(after(now, self.config.resync_interval));
                debug!(task_id = task.id, worker = %task.worker_name, resource = %resource.uuid, "task converged");
                TaskOutcome::Steady
            }
            Ok(WorkerResult::Defer { payload, reason }) => {
                next.merge_details(payload);
                next.state = TaskState::Pending;
                next.last_error = None;
                next.defer_count = next.defer_count.saturating_add(1);
                next.next_check_at = Some(now + self.config.backoff.delay_chrono(next.defer_count));
                info!(
                    task_id = task.id,
                    worker = %task.worker_name,
                    resource = %resource.uuid,
                    attempt = next.defer_count,
                    reason = %reason,
                    "task deferred"
                );
                next.defer_reason = Some(reason);
                TaskOutcome::Deferred
            }
            Err(e) => {
                next.state = TaskState::Error;
                next.last_error = Some(e.to_string());
                next.next_check_at = if e.is_retryable() {
                    // Failures count as attempts too, so a failing service is polled less and less.
                    next.defer_count = next.defer_count.saturating_add(1);
                    Some(now + self.config.backoff.delay_chrono(next.defer_count))
                } else {
                    // Parked until the desired state changes.
                    None
                };
                error!(
                    task_id = task.id,
                    worker = %task.worker_name,
                    resource = %resource.uuid,
                    retryable = e.is_retryable(),
                    attempt = next.defer_count,
                    error = %e,
                    "task failed"
                );
                TaskOutcome::Failed
            }
        };

        match self.registry.upsert_task(&next, Some(claimed.version)).await {
            Ok(_) => Ok(outcome),
            Err(StoreError::VersionMismatch { expected, actual }) => {
                warn!(
                    task_id = task.id,
                    expected,
                    actual,
                    "task changed while processing, discarding result"
                );
                Ok(TaskOutcome::Lost)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run discovery passes until ctrl-c.
    pub async fn run(&self) {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await
    }

    /// Run discovery passes every `process_interval` until `shutdown` completes.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.config.process_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(workers = ?self.workers.names(), "worker manager started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down worker manager");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.process_pending().await {
                        error!(error = %e, "processing pass failed");
                    }
                }
            }
        }
    }
}

/// Group tasks so that no two tasks of one resource run concurrently: the
/// first task of every resource, then the second, and so on.
fn layers(tasks: Vec<Task>) -> Vec<Vec<Task>> {
    let mut layers: Vec<Vec<Task>> = Vec::new();
    let mut depth: HashMap<i64, usize> = HashMap::new();
    for task in tasks {
        let level = depth.entry(task.resource_id).or_insert(0);
        if layers.len() <= *level {
            layers.push(Vec::new());
        }
        layers[*level].push(task);
        *level += 1;
    }
    layers
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

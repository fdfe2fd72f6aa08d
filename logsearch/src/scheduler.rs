//! Lifecycle of log search task groups.
//!
//! A group runs one [`TaskRunner`] per target under a cancellation token scoped to
//! the group. The group flips to `finished` once its last runner has stopped.
//! Every state transition of a group goes through one lock so that cancel, retry
//! and delete observe a consistent state.

use crate::merger::merge_previews;
use crate::model::{
    GroupState, PreviewRow, SearchLogRequest, TASK_MAX_PREVIEW_LINES, Target, Task, TaskGroup,
    TaskGroupId, TaskId,
};
use crate::rpc::LogStreamClient;
use crate::runner::TaskRunner;
use crate::store::{Recovered, StoreError, TaskStore};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use http::StatusCode;
use shared::errors::{ErrorClass, chain_message};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("at least one target is required")]
    NoTargets,
    #[error("start time must not be after end time")]
    InvalidTimeRange,
    #[error("task group {0} does not exist")]
    GroupNotFound(TaskGroupId),
    #[error("task group {0} is not running")]
    GroupNotRunning(TaskGroupId),
    #[error("task group {0} is still running")]
    GroupRunning(TaskGroupId),
    #[error("task {0} does not exist")]
    TaskNotFound(TaskId),
    #[error("task {0} has no log bundle")]
    BundleMissing(TaskId),
    #[error("log search storage failed")]
    Store(#[from] StoreError),
    #[error("could not remove log bundles")]
    Io(#[from] std::io::Error),
}

impl ErrorClass for SchedulerError {
    fn code(&self) -> &'static str {
        match self {
            SchedulerError::NoTargets | SchedulerError::InvalidTimeRange => {
                "api.logs.invalid_request"
            }
            SchedulerError::GroupNotFound(_) => "api.logs.task_group_not_found",
            SchedulerError::GroupNotRunning(_) => "api.logs.task_group_not_running",
            SchedulerError::GroupRunning(_) => "api.logs.task_group_running",
            SchedulerError::TaskNotFound(_) => "api.logs.task_not_found",
            SchedulerError::BundleMissing(_) => "api.logs.bundle_missing",
            SchedulerError::Store(_) => "api.logs.storage",
            SchedulerError::Io(_) => "api.logs.io",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            SchedulerError::NoTargets
            | SchedulerError::InvalidTimeRange
            | SchedulerError::GroupNotRunning(_)
            | SchedulerError::GroupRunning(_)
            | SchedulerError::BundleMissing(_) => StatusCode::BAD_REQUEST,
            SchedulerError::GroupNotFound(_) | SchedulerError::TaskNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            SchedulerError::Store(_) | SchedulerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

struct Inner {
    store: TaskStore,
    runner: TaskRunner,
    log_dir: PathBuf,
    groups: DashMap<TaskGroupId, CancellationToken>,
    transitions: Mutex<()>,
    tracker: TaskTracker,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(store: TaskStore, client: Arc<dyn LogStreamClient>, log_dir: PathBuf) -> Self {
        let runner = TaskRunner::new(store.clone(), client, log_dir.clone());
        Scheduler {
            inner: Arc::new(Inner {
                store,
                runner,
                log_dir,
                groups: DashMap::new(),
                transitions: Mutex::new(()),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.inner.store
    }

    pub fn log_dir(&self) -> &Path {
        &self.inner.log_dir
    }

    /// Rewrites state left running by a previous process. Call before serving.
    pub async fn recover(&self) -> Result<Recovered, SchedulerError> {
        let recovered = self.inner.store.recover_interrupted().await?;
        if recovered.tasks > 0 || recovered.groups > 0 {
            tracing::warn!(
                tasks = recovered.tasks,
                groups = recovered.groups,
                "marked interrupted log searches as canceled"
            );
        }
        Ok(recovered)
    }

    /// Persists a new group and starts it in the background.
    pub async fn create_group(
        &self,
        request: SearchLogRequest,
        targets: Vec<Target>,
    ) -> Result<(TaskGroup, Vec<Task>), SchedulerError> {
        if targets.is_empty() {
            return Err(SchedulerError::NoTargets);
        }
        if request.start_time > request.end_time {
            return Err(SchedulerError::InvalidTimeRange);
        }

        let (group, tasks) = self.inner.store.create_group(&request, &targets).await?;
        tracing::info!(
            group_id = group.id,
            targets = tasks.len(),
            "created log search task group"
        );
        self.async_start(group.id, request, tasks.clone());
        Ok((group, tasks))
    }

    /// Spawns the runners of a group. Returns false when the group is already
    /// scheduled.
    pub fn async_start(
        &self,
        group_id: TaskGroupId,
        request: SearchLogRequest,
        tasks: Vec<Task>,
    ) -> bool {
        let cancel = match self.inner.groups.entry(group_id) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(entry) => entry.insert(CancellationToken::new()).clone(),
        };

        let inner = self.inner.clone();
        self.inner.tracker.spawn(async move {
            let request = Arc::new(request);
            let mut runners = JoinSet::new();
            for task in tasks {
                let runner = inner.runner.clone();
                let request = request.clone();
                let cancel = cancel.clone();
                runners.spawn(async move { runner.run(&task, &request, &cancel).await });
            }
            while let Some(joined) = runners.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(group_id, error = %e, "log search runner panicked");
                }
            }
            inner.finish_group(group_id).await;
        });
        true
    }

    /// Signals the runners of a running group to stop. Does not wait for them.
    pub async fn abort(&self, group_id: TaskGroupId) -> Result<(), SchedulerError> {
        let _guard = self.inner.transitions.lock().await;
        let group = self.inner.require_group(group_id).await?;
        if group.state != GroupState::Running {
            return Err(SchedulerError::GroupNotRunning(group_id));
        }
        if let Some(cancel) = self.inner.groups.get(&group_id) {
            cancel.cancel();
        }
        tracing::info!(group_id, "canceling log search task group");
        Ok(())
    }

    /// Restarts the failed tasks of a finished group. Returns the restarted tasks.
    pub async fn retry(&self, group_id: TaskGroupId) -> Result<Vec<Task>, SchedulerError> {
        let _guard = self.inner.transitions.lock().await;
        let group = self.inner.require_group(group_id).await?;
        if group.state == GroupState::Running {
            return Err(SchedulerError::GroupRunning(group_id));
        }

        let tasks = self.inner.store.reset_failed_tasks(group_id).await?;
        if tasks.is_empty() {
            return Ok(tasks);
        }
        self.inner
            .store
            .set_group_state(group_id, GroupState::Running)
            .await?;
        tracing::info!(group_id, tasks = tasks.len(), "retrying failed log search tasks");
        self.async_start(group_id, group.search_request, tasks.clone());
        Ok(tasks)
    }

    /// Deletes a stopped group with its bundles and previews.
    pub async fn delete(&self, group_id: TaskGroupId) -> Result<(), SchedulerError> {
        let _guard = self.inner.transitions.lock().await;
        let group = self.inner.require_group(group_id).await?;
        if group.state == GroupState::Running {
            return Err(SchedulerError::GroupRunning(group_id));
        }

        let dir = self.inner.log_dir.join(group_id.to_string());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.inner.store.delete_group(group_id).await?;
        tracing::info!(group_id, "deleted log search task group");
        Ok(())
    }

    pub async fn get_group(
        &self,
        group_id: TaskGroupId,
    ) -> Result<(TaskGroup, Vec<Task>), SchedulerError> {
        let group = self.inner.require_group(group_id).await?;
        let tasks = self.inner.store.list_tasks(group_id).await?;
        Ok((group, tasks))
    }

    pub async fn list_groups(&self) -> Result<Vec<TaskGroup>, SchedulerError> {
        Ok(self.inner.store.list_groups().await?)
    }

    /// Time-ordered preview across all tasks of the group.
    pub async fn preview(&self, group_id: TaskGroupId) -> Result<Vec<PreviewRow>, SchedulerError> {
        let (_, tasks) = self.get_group(group_id).await?;
        let mut sequences = Vec::with_capacity(tasks.len());
        for task in &tasks {
            sequences.push(
                self.inner
                    .store
                    .list_previews(task.id, TASK_MAX_PREVIEW_LINES)
                    .await?,
            );
        }
        Ok(merge_previews(sequences, TASK_MAX_PREVIEW_LINES))
    }

    /// Tasks whose bundles can be downloaded, in the order requested.
    pub async fn bundles(&self, task_ids: &[TaskId]) -> Result<Vec<Task>, SchedulerError> {
        let mut tasks = Vec::with_capacity(task_ids.len());
        for &id in task_ids {
            let task = self
                .inner
                .store
                .get_task(id)
                .await?
                .ok_or(SchedulerError::TaskNotFound(id))?;
            if task.log_store_path.is_none() {
                return Err(SchedulerError::BundleMissing(id));
            }
            tasks.push(task);
        }
        Ok(tasks)
    }

    pub fn is_scheduled(&self, group_id: TaskGroupId) -> bool {
        self.inner.groups.contains_key(&group_id)
    }

    /// Cancels every running group and waits for the runners to stop.
    pub async fn shutdown(&self) {
        for entry in self.inner.groups.iter() {
            entry.value().cancel();
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

impl Inner {
    async fn require_group(&self, group_id: TaskGroupId) -> Result<TaskGroup, SchedulerError> {
        self.store
            .get_group(group_id)
            .await?
            .ok_or(SchedulerError::GroupNotFound(group_id))
    }

    async fn finish_group(&self, group_id: TaskGroupId) {
        let _guard = self.transitions.lock().await;
        self.groups.remove(&group_id);
        match self
            .store
            .set_group_state(group_id, GroupState::Finished)
            .await
        {
            Ok(()) => tracing::info!(group_id, "log search task group finished"),
            Err(e) => tracing::error!(
                group_id,
                error = %chain_message(&e),
                "could not mark task group finished"
            ),
        }
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::dispatch::{TaskKind, TaskRegistry};
use crate::error::Result;
use crate::events::{self, EventBus};
use crate::persistence::Persistence;
use crate::scheduler::{DependencyState, DeviceAllocator, Job, JobId, JobStatus, QueueStore};
use crate::worker::executor::run_job;

/// A task submission.
#[derive(Debug, Clone, Default)]
pub struct EnqueueRequest {
    /// Use a previously reserved identifier instead of generating one.
    pub id: Option<JobId>,
    pub name: String,
    pub tasks: Vec<TaskKind>,
    pub device: String,
    pub item_type: String,
    pub dependencies: Vec<JobId>,
    pub source_file_path: Option<PathBuf>,
    pub task_data: Option<Value>,
    pub on_stop_event: Option<String>,
    pub required_device_type: Option<String>,
}

impl EnqueueRequest {
    pub fn new(name: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device: device.into(),
            ..Default::default()
        }
    }

    pub fn with_tasks(mut self, tasks: impl IntoIterator<Item = TaskKind>) -> Self {
        self.tasks = tasks.into_iter().collect();
        self
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_item_type(mut self, item_type: impl Into<String>) -> Self {
        self.item_type = item_type.into();
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<JobId>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn with_source_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_file_path = Some(path.into());
        self
    }

    pub fn with_task_data(mut self, data: Value) -> Self {
        self.task_data = Some(data);
        self
    }

    pub fn with_on_stop_event(mut self, event: impl Into<String>) -> Self {
        self.on_stop_event = Some(event.into());
        self
    }

    pub fn with_required_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.required_device_type = Some(device_type.into());
        self
    }

    fn into_job(self, id: JobId) -> Job {
        let mut job = Job::placeholder(id, self.name);
        job.device = self.device;
        job.item_type = self.item_type;
        job.tasks = self.tasks;
        job.dependencies = self.dependencies;
        job.source_file_path = self.source_file_path;
        job.task_data = self.task_data;
        job.on_stop_event = self.on_stop_event;
        job.required_device_type = self.required_device_type;
        job
    }
}

/// What one scheduling pass did to the queue.
#[derive(Default)]
struct PingPass {
    /// A job was launched; the scan should run again.
    launched: bool,
    /// The store changed (a launch, a failure, or a dropped pending entry)
    /// and must be announced and persisted.
    mutated: bool,
    /// At least one job was failed by dependency gating.
    failed: bool,
    stop_events: Vec<String>,
}

struct Inner {
    config: QueueConfig,
    registry: TaskRegistry,
    store: RwLock<QueueStore>,
    devices: RwLock<DeviceAllocator>,
    bus: EventBus,
    persistence: Persistence,
}

/// The orchestrating facade over the queue store, device allocator,
/// scheduler, executor and persistence.
///
/// Cheap to clone; all clones share the same queue. Mutations of the store
/// and device allocator are serialized through their locks, always taken in
/// store-then-devices order.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

impl QueueManager {
    pub fn new(config: QueueConfig, registry: TaskRegistry) -> Self {
        let bus = EventBus::new(config.event_capacity);
        let persistence = Persistence::new(config.state_file.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                store: RwLock::new(QueueStore::new()),
                devices: RwLock::new(DeviceAllocator::new()),
                bus,
                persistence,
            }),
        }
    }

    /// Subscribe to queue change notifications.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<String> {
        self.inner.bus.subscribe()
    }

    /// Notify subscribers of an event by name.
    pub fn notify(&self, event: impl Into<String>) {
        self.inner.bus.notify(event);
    }

    /// Reserve a unique job identifier ahead of the actual enqueue.
    pub async fn generate_job_id(&self, name: &str) -> JobId {
        let id = self.inner.store.write().await.generate_job_id(name);
        self.notify(events::QUEUE_UPDATED);
        id
    }

    /// Resolve, validate and enqueue a task submission.
    ///
    /// Fails without mutating the queue when the tasks resolve to no steps,
    /// or when payload or device are missing. Does not ping; callers decide
    /// when scheduling happens.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId> {
        self.inner.registry.resolve(&request.tasks)?;
        let id = {
            let mut store = self.inner.store.write().await;
            let id = match request.id.clone() {
                Some(id) => id,
                None => store.generate_job_id(&request.name),
            };
            store.enqueue(request.into_job(id))?
        };
        self.notify(events::QUEUE_UPDATED);
        self.persist().await;
        Ok(id)
    }

    /// Declare an inter-job dependency.
    pub async fn add_dependency(&self, id: &JobId, dependency_id: impl Into<JobId>) -> Result<()> {
        self.inner.store.write().await.add_dependency(id, dependency_id)?;
        self.notify(events::QUEUE_ITEM_UPDATED);
        self.persist().await;
        Ok(())
    }

    /// Copy a dependency's fields into a dependent record.
    pub async fn propagate_dependency_fields(
        &self,
        id: &JobId,
        dependency_id: &JobId,
        override_existing: bool,
        only_if_done: bool,
    ) -> Result<bool> {
        let propagated = self.inner.store.write().await.propagate_dependency_fields(
            id,
            dependency_id,
            override_existing,
            only_if_done,
        )?;
        if propagated {
            self.notify(events::QUEUE_ITEM_UPDATED);
            self.persist().await;
        }
        Ok(propagated)
    }

    /// Merge a partial field mapping into a job record. Set `persist` to
    /// false to suppress the snapshot for high-frequency updates such as
    /// progress ticks.
    pub async fn update(&self, id: &JobId, fields: Map<String, Value>, persist: bool) -> Result<Job> {
        let job = self.inner.store.write().await.update(id, fields)?;
        self.notify(events::QUEUE_ITEM_UPDATED);
        if persist {
            self.persist().await;
        }
        Ok(job)
    }

    /// Apply a new desired ordering of the pending jobs.
    pub async fn reorder(&self, new_order: &[JobId]) -> Result<()> {
        self.inner.store.write().await.reorder(new_order)?;
        self.notify(events::QUEUE_UPDATED);
        self.persist().await;
        Ok(())
    }

    /// Cancel a job cooperatively.
    ///
    /// A pending job is canceled synchronously; a job bound to a live
    /// execution context is marked `canceling` and finishes at its next
    /// step boundary. The job's cancellation token is triggered either way
    /// so steps watching it can stop early.
    pub async fn cancel(&self, id: &JobId) {
        let outcome = {
            let mut store = self.inner.store.write().await;
            let devices = self.inner.devices.read().await;
            let running = devices.is_job_bound(id);
            let outcome = store.cancel(id, running);
            if outcome.is_some() {
                if let Some(token) = devices.cancel_token(id) {
                    token.cancel();
                }
            }
            outcome
        };
        if let Some((_, on_stop)) = outcome {
            if let Some(event) = on_stop {
                self.notify(event);
            }
            self.notify(events::QUEUE_UPDATED);
            self.persist().await;
        }
    }

    /// Scan the pending order and launch every startable job.
    ///
    /// Jobs already terminal are dropped from the pending order; jobs with
    /// a failed or missing dependency are failed; jobs with an unfinished
    /// dependency are left in place while scanning continues, so a
    /// later-enqueued job with satisfied dependencies may start first. The
    /// cycle stops when no candidate remains or the candidate's device is
    /// occupied. Executors re-ping on completion, so callers only need to
    /// ping after enqueueing or reordering.
    pub async fn ping(&self) {
        let mut changed = false;
        loop {
            let pass = self.ping_once().await;
            for event in &pass.stop_events {
                self.notify(event.clone());
            }
            if pass.failed {
                self.notify(events::QUEUE_ITEM_UPDATED);
            }
            changed |= pass.mutated;
            if !pass.launched {
                break;
            }
        }
        if changed {
            self.notify(events::QUEUE_UPDATED);
            self.persist().await;
        }
    }

    /// One scheduling pass: fail/drop unstartable jobs, then launch the
    /// first startable candidate if its device is free. Store mutations
    /// are reported even when nothing launches, so dependency-gating
    /// failures reach subscribers and the state file.
    async fn ping_once(&self) -> PingPass {
        let mut store = self.inner.store.write().await;
        let mut devices = self.inner.devices.write().await;
        let mut pass = PingPass::default();

        let mut candidate = None;
        let mut index = 0;
        while index < store.pending_order().len() {
            let id = store.pending_order()[index].clone();
            let (is_terminal, device) = match store.job(&id) {
                Some(job) => (job.status.is_terminal(), job.device.clone()),
                None => {
                    tracing::warn!(job_id = %id, "pending id without a history record, dropping");
                    store.remove_pending_at(index);
                    pass.mutated = true;
                    continue;
                }
            };
            if is_terminal {
                store.remove_pending_at(index);
                pass.mutated = true;
                continue;
            }
            match store.dependency_state(&id) {
                DependencyState::Failed => {
                    tracing::warn!(job_id = %id, "dependency failed or missing, failing job");
                    if let Some(event) = store.fail(&id) {
                        pass.stop_events.push(event);
                    }
                    store.remove_pending_at(index);
                    pass.failed = true;
                    pass.mutated = true;
                    continue;
                }
                DependencyState::Waiting => {
                    index += 1;
                    continue;
                }
                DependencyState::Satisfied => {
                    candidate = Some((index, id, device));
                    break;
                }
            }
        }

        let Some((index, id, device)) = candidate else {
            return pass;
        };
        if !devices.is_available(&device) {
            tracing::debug!(job_id = %id, device = %device, "device busy, deferring scheduling");
            return pass;
        }

        store.remove_pending_at(index);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_job(self.clone(), id.clone(), cancel.clone()));
        devices.bind(&device, id.clone(), handle, cancel);
        tracing::info!(job_id = %id, device = %device, "job started");
        pass.launched = true;
        pass.mutated = true;
        pass
    }

    /// Rebuild the queue from the state file.
    ///
    /// Records without a usable payload are dropped permanently; records
    /// interrupted mid-cancel are finalized to `canceled` without
    /// re-running; every other unfinished record is re-submitted through
    /// the normal enqueue path. Ends with a single scheduling pass. Returns
    /// whether any job re-entered the pending order.
    pub async fn resume(&self) -> bool {
        let loaded = self.inner.persistence.load().await;
        if loaded.is_empty() {
            tracing::info!("no saved queue state to resume");
            return false;
        }

        if self.inner.config.retain_finished_jobs {
            self.inner.store.write().await.replace_history(loaded.clone());
        }

        let mut resumed = false;
        for mut job in loaded {
            if !job.has_payload() {
                tracing::warn!(job_id = %job.id, "saved record has no payload, dropping permanently");
                self.inner.store.write().await.remove(&job.id);
                continue;
            }
            if job.status == JobStatus::Canceling {
                tracing::info!(job_id = %job.id, "finalizing interrupted cancellation");
                let mut store = self.inner.store.write().await;
                if let Some(record) = store.job_mut(&job.id) {
                    record.set_status(JobStatus::Canceled);
                }
                continue;
            }
            if job.status.is_terminal() {
                continue;
            }
            if let Err(err) = self.inner.registry.resolve(&job.tasks) {
                tracing::warn!(job_id = %job.id, error = %err, "saved record no longer resolvable, not resumed");
                continue;
            }
            job.status = JobStatus::Pending;
            match self.inner.store.write().await.enqueue(job) {
                Ok(id) => {
                    tracing::info!(job_id = %id, "job resumed");
                    resumed = true;
                }
                Err(err) => tracing::warn!(error = %err, "saved record not resumed"),
            }
        }

        self.notify(events::QUEUE_UPDATED);
        self.persist().await;
        self.ping().await;
        resumed
    }

    /// Write the current history to the state file, regardless of the
    /// `snapshot_on_update` setting.
    pub async fn snapshot(&self) -> Result<()> {
        let jobs = self.inner.store.read().await.snapshot_jobs();
        self.inner.persistence.snapshot(&jobs).await
    }

    /// Request cancellation of every running job and take a final
    /// snapshot. Cooperative only: running steps finish before their jobs
    /// settle, this merely stops anything new from starting on them.
    pub async fn shutdown(&self) {
        let bound = self.inner.devices.read().await.bound_jobs();
        for id in bound {
            self.cancel(&id).await;
        }
        if let Err(err) = self.snapshot().await {
            tracing::warn!(error = %err, "final snapshot failed");
        }
    }

    // --- queries ---------------------------------------------------------

    pub async fn job(&self, id: &JobId) -> Option<Job> {
        self.inner.store.read().await.job(id).cloned()
    }

    /// All job records in history order.
    pub async fn jobs(&self) -> Vec<Job> {
        self.inner.store.read().await.snapshot_jobs()
    }

    pub async fn pending_order(&self) -> Vec<JobId> {
        self.inner.store.read().await.pending_order().to_vec()
    }

    pub async fn position_in_pending(&self, id: &JobId) -> Option<usize> {
        self.inner.store.read().await.position_in_pending(id)
    }

    // --- internal --------------------------------------------------------

    pub(crate) fn store(&self) -> &RwLock<QueueStore> {
        &self.inner.store
    }

    pub(crate) fn devices(&self) -> &RwLock<DeviceAllocator> {
        &self.inner.devices
    }

    pub(crate) fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    pub(crate) async fn persist(&self) {
        if !self.inner.config.snapshot_on_update {
            return;
        }
        let jobs = self.inner.store.read().await.snapshot_jobs();
        if let Err(err) = self.inner.persistence.snapshot(&jobs).await {
            tracing::warn!(error = %err, "failed to write queue state file");
        }
    }
}

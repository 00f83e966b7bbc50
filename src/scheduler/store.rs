use std::collections::{HashMap, HashSet};

use chrono::Utc;
use indexmap::IndexMap;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::scheduler::job::{Job, JobId, JobStatus};

/// Readiness of a job's predecessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyState {
    /// All dependencies are `done` (or there are none).
    Satisfied,
    /// At least one dependency has not finished yet.
    Waiting,
    /// A dependency is missing from history or can never finish.
    Failed,
}

/// What a cancel request actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still pending and is now terminally canceled.
    Canceled,
    /// The job is bound to a live execution context; it will finish at the
    /// next cooperative checkpoint.
    Canceling,
}

/// Owns the job history and the pending order.
///
/// The history is insertion-ordered and retains every record regardless of
/// terminal status; the pending order holds only identifiers of jobs still
/// awaiting execution. All mutation of either collection goes through this
/// struct, which the manager wraps in a single `RwLock`.
#[derive(Debug, Default)]
pub struct QueueStore {
    history: IndexMap<JobId, Job>,
    pending: Vec<JobId>,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh, history-unique job identifier from a human-readable
    /// name, and register a placeholder record as a reservation.
    pub fn generate_job_id(&mut self, name: &str) -> JobId {
        let slug = slugify(name);
        loop {
            let candidate = format!("{}_{}", slug, Uuid::new_v4().simple());
            if self.history.contains_key(&candidate) {
                continue;
            }
            self.history
                .insert(candidate.clone(), Job::placeholder(candidate.clone(), name));
            tracing::debug!(job_id = %candidate, "job id reserved");
            return candidate;
        }
    }

    /// Admit a job into the queue.
    ///
    /// Requires a payload and a device; the caller has already validated
    /// that the job's tasks resolve to a non-empty pipeline. If the
    /// identifier is already known the given fields are merged into the
    /// existing record (this is how reservations from [`generate_job_id`]
    /// are completed); otherwise a new record is appended. The identifier
    /// is appended to the pending order either way.
    pub fn enqueue(&mut self, job: Job) -> Result<JobId> {
        if !job.has_payload() {
            return Err(QueueError::MissingPayload(job.id));
        }
        if job.device.is_empty() {
            return Err(QueueError::MissingDevice(job.id));
        }

        let id = job.id.clone();
        match self.history.get_mut(&id) {
            Some(existing) => {
                if let Ok(serde_json::Value::Object(overlay)) = serde_json::to_value(&job) {
                    existing.merge_overlay(overlay, true);
                }
                existing.tasks = job.tasks;
                existing.device = job.device;
                existing.dependencies = job.dependencies;
                existing.set_status(JobStatus::Queued);
            }
            None => {
                let mut job = job;
                job.set_status(JobStatus::Queued);
                self.history.insert(id.clone(), job);
            }
        }
        if !self.pending.contains(&id) {
            self.pending.push(id.clone());
        }
        tracing::info!(job_id = %id, position = self.pending.len() - 1, "job enqueued");
        Ok(id)
    }

    /// Declare that `id` must not start before `dependency_id` finishes.
    /// Duplicates are tolerated; evaluation treats the list as a set.
    pub fn add_dependency(&mut self, id: &JobId, dependency_id: impl Into<JobId>) -> Result<()> {
        let job = self
            .history
            .get_mut(id)
            .ok_or_else(|| QueueError::JobNotFound(id.clone()))?;
        job.dependencies.push(dependency_id.into());
        job.last_update = Utc::now();
        Ok(())
    }

    /// Copy the dependency's fields into the dependent record (protected
    /// fields excluded). Returns whether anything was propagated.
    pub fn propagate_dependency_fields(
        &mut self,
        id: &JobId,
        dependency_id: &JobId,
        override_existing: bool,
        only_if_done: bool,
    ) -> Result<bool> {
        let dep = self
            .history
            .get(dependency_id)
            .ok_or_else(|| QueueError::JobNotFound(dependency_id.clone()))?
            .clone();
        let job = self
            .history
            .get_mut(id)
            .ok_or_else(|| QueueError::JobNotFound(id.clone()))?;
        Ok(job.propagate_from(&dep, override_existing, only_if_done))
    }

    /// Merge a partial field mapping into a record and stamp `last_update`.
    pub fn update(&mut self, id: &JobId, fields: serde_json::Map<String, serde_json::Value>) -> Result<Job> {
        let job = self
            .history
            .get_mut(id)
            .ok_or_else(|| QueueError::JobNotFound(id.clone()))?;
        job.merge_overlay(fields, true);
        job.last_update = Utc::now();
        Ok(job.clone())
    }

    /// Apply a new desired ordering of the pending identifiers.
    ///
    /// Identifiers that are not currently pending are filtered out; the
    /// reorder is rejected when the filtered order does not cover the whole
    /// pending set. Jobs no longer pending keep their place at the head of
    /// history in their original relative order, followed by the pending
    /// jobs in the new order.
    pub fn reorder(&mut self, new_order: &[JobId]) -> Result<()> {
        let pending_set: HashSet<&JobId> = self.pending.iter().collect();
        let mut seen: HashSet<&JobId> = HashSet::new();
        let filtered: Vec<JobId> = new_order
            .iter()
            .filter(|id| pending_set.contains(id) && seen.insert(*id))
            .cloned()
            .collect();
        if filtered.len() != self.pending.len() {
            return Err(QueueError::ReorderMismatch {
                expected: self.pending.len(),
                got: filtered.len(),
            });
        }
        self.pending = filtered;

        let mut head = IndexMap::with_capacity(self.history.len());
        let mut pending_jobs: HashMap<JobId, Job> = HashMap::new();
        for (id, job) in std::mem::take(&mut self.history) {
            if self.pending.contains(&id) {
                pending_jobs.insert(id, job);
            } else {
                head.insert(id, job);
            }
        }
        for id in &self.pending {
            if let Some(job) = pending_jobs.remove(id) {
                head.insert(id.clone(), job);
            }
        }
        self.history = head;
        tracing::debug!(pending = self.pending.len(), "pending order rearranged");
        Ok(())
    }

    /// Request cancellation of a job.
    ///
    /// `actively_running` tells the store whether the job is currently
    /// bound to a live execution context: if so the job is only marked
    /// `canceling` and the executor converts it at the next checkpoint;
    /// otherwise it is canceled synchronously. Jobs already `done` or
    /// `failed` cannot be canceled.
    pub fn cancel(&mut self, id: &JobId, actively_running: bool) -> Option<(CancelOutcome, Option<String>)> {
        match self.history.get(id) {
            None => {
                tracing::warn!(job_id = %id, "cancel requested for unknown job");
                return None;
            }
            Some(job) if matches!(job.status, JobStatus::Done | JobStatus::Failed) => {
                tracing::info!(job_id = %id, status = %job.status, "job already finished, cancel ignored");
                return None;
            }
            Some(_) => {}
        }
        self.pending.retain(|p| p != id);
        let job = self.history.get_mut(id)?;
        let outcome = if actively_running {
            job.set_status(JobStatus::Canceling);
            CancelOutcome::Canceling
        } else {
            job.set_status(JobStatus::Canceled);
            CancelOutcome::Canceled
        };
        tracing::info!(job_id = %id, outcome = ?outcome, "cancel requested");
        Some((outcome, job.on_stop_event.clone()))
    }

    /// Cooperative cancellation checkpoint used between pipeline steps:
    /// finalizes a `canceling` (or already `canceled`) job to `canceled`
    /// and reports whether the pipeline must stop.
    pub fn cancel_if_requested(&mut self, id: &JobId) -> bool {
        match self.history.get_mut(id) {
            Some(job) if matches!(job.status, JobStatus::Canceling | JobStatus::Canceled) => {
                job.set_status(JobStatus::Canceled);
                true
            }
            _ => false,
        }
    }

    /// Mark a job failed, keeping `last_task` for post-mortem inspection.
    /// Returns the job's stop event, if any.
    pub fn fail(&mut self, id: &JobId) -> Option<String> {
        let job = self.history.get_mut(id)?;
        job.set_status(JobStatus::Failed);
        job.on_stop_event.clone()
    }

    /// Evaluate the readiness of a job's dependencies.
    ///
    /// A missing dependency, or one in a terminal state other than `done`,
    /// means the job can never start and must be failed rather than left
    /// pending indefinitely.
    pub fn dependency_state(&self, id: &JobId) -> DependencyState {
        let Some(job) = self.history.get(id) else {
            return DependencyState::Failed;
        };
        let mut seen = HashSet::new();
        let mut waiting = false;
        for dep_id in &job.dependencies {
            if !seen.insert(dep_id) {
                continue;
            }
            match self.history.get(dep_id) {
                None => return DependencyState::Failed,
                Some(dep) if dep.status == JobStatus::Done => {}
                Some(dep) if dep.status.is_terminal() => return DependencyState::Failed,
                Some(_) => waiting = true,
            }
        }
        if waiting {
            DependencyState::Waiting
        } else {
            DependencyState::Satisfied
        }
    }

    // --- accessors -------------------------------------------------------

    pub fn job(&self, id: &JobId) -> Option<&Job> {
        self.history.get(id)
    }

    pub fn job_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.history.get_mut(id)
    }

    /// All records in history order.
    pub fn all_jobs(&self) -> Vec<&Job> {
        self.history.values().collect()
    }

    pub fn pending_order(&self) -> &[JobId] {
        &self.pending
    }

    pub fn position_in_pending(&self, id: &JobId) -> Option<usize> {
        self.pending.iter().position(|p| p == id)
    }

    /// Remove the pending entry at `index`, as the scheduler does when it
    /// launches a candidate or drops an unstartable job.
    pub fn remove_pending_at(&mut self, index: usize) -> JobId {
        self.pending.remove(index)
    }

    /// Owned copies of every record, for persistence.
    pub fn snapshot_jobs(&self) -> Vec<Job> {
        self.history.values().cloned().collect()
    }

    /// Replace the whole history (crash-resume with retained finished
    /// jobs). The pending order is rebuilt by re-enqueueing afterwards.
    pub fn replace_history(&mut self, jobs: Vec<Job>) {
        self.pending.clear();
        self.history = jobs.into_iter().map(|job| (job.id.clone(), job)).collect();
    }

    /// Permanently drop a record (only used for unusable records found
    /// during resume).
    pub fn remove(&mut self, id: &JobId) -> Option<Job> {
        self.pending.retain(|p| p != id);
        self.history.shift_remove(id)
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

fn slugify(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "job".to_string()
    } else {
        slug.to_string()
    }
}

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dispatch::TaskKind;

pub type JobId = String;

/// Job lifecycle status. `Done`, `Failed` and `Canceled` are terminal;
/// steps may also report a custom label (e.g. `"downloading_model"`) which
/// serializes as a plain string like the fixed variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Processing,
    Canceling,
    Canceled,
    Done,
    Failed,
    #[serde(untagged)]
    Step(String),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Canceled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Canceling => write!(f, "canceling"),
            JobStatus::Canceled => write!(f, "canceled"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Step(label) => write!(f, "{label}"),
        }
    }
}

/// Fields never copied from a dependency into its dependent, and never
/// overridden by a step's returned context.
const PROTECTED_FIELDS: [&str; 7] =
    ["id", "name", "tasks", "device", "task_queue", "dependencies", "created_at"];

/// A single unit of work in the queue.
///
/// The record is the central entity: created at submission, mutated by the
/// scheduler and the executor, and never physically deleted — cancellation
/// and failure are terminal statuses, not removals. The resolved step
/// pipeline is intentionally not stored here; it is re-resolved from
/// `tasks` at validation and at launch, so it never reaches the state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,

    /// Free-form progress indicator, cleared on any terminal transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,

    /// Caller-defined category used to route completion notifications.
    #[serde(default)]
    pub item_type: String,

    /// Logical device this job must run on; mandatory at enqueue time.
    #[serde(default)]
    pub device: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_device_type: Option<String>,

    /// The originally requested symbolic tasks.
    #[serde(default)]
    pub tasks: Vec<TaskKind>,

    /// Predecessor jobs that must reach `done` before this one may start.
    /// Stored as a sequence but evaluated as a set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<JobId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file_path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_data: Option<Value>,

    /// Event published when the job stops for any reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_stop_event: Option<String>,

    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,

    /// Step currently or most recently executing, for post-mortem
    /// diagnostics. Not persisted.
    #[serde(skip)]
    pub last_task: Option<String>,

    /// Accumulated side-channel output from step execution. Not persisted.
    #[serde(skip)]
    pub output: Vec<String>,

    /// Step-produced fields that are not part of the fixed record. Kept
    /// flattened so the step-context merge round-trips through serde.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    /// Placeholder registered by the id generator as a reservation; the
    /// real fields arrive with the subsequent enqueue.
    pub fn placeholder(id: JobId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            status: JobStatus::Pending,
            progress: None,
            item_type: String::new(),
            device: String::new(),
            required_device_type: None,
            tasks: Vec::new(),
            dependencies: Vec::new(),
            source_file_path: None,
            task_data: None,
            on_stop_event: None,
            created_at: now,
            last_update: now,
            last_task: None,
            output: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn has_payload(&self) -> bool {
        self.source_file_path.is_some() || self.task_data.is_some()
    }

    /// Transition to a new status, clearing the progress indicator on any
    /// terminal or canceling transition and stamping `last_update`.
    pub fn set_status(&mut self, status: JobStatus) {
        if status.is_terminal() || status == JobStatus::Canceling {
            self.progress = None;
        }
        tracing::debug!(job_id = %self.id, from = %self.status, to = %status, "status change");
        self.status = status;
        self.last_update = Utc::now();
    }

    /// Serialize the record into the field mapping handed to step callables.
    pub fn to_context(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Merge a step's returned context back into the record. Returned
    /// fields win over prior ones; protected fields and `status` are
    /// ignored; a `null` clears the field; a non-object value leaves the
    /// record unchanged.
    pub fn merge_context(&mut self, returned: Value) {
        match returned {
            Value::Object(mut overlay) => {
                // Status is the cancellation signal channel: a step echoing
                // its input context back must not clobber a concurrent
                // `canceling` transition.
                overlay.remove("status");
                self.merge_overlay(overlay, true);
            }
            other => {
                tracing::debug!(
                    job_id = %self.id,
                    returned = %other,
                    "step returned a non-object context, keeping prior record"
                );
            }
        }
    }

    /// Copy all fields from `dep` into this record except the protected
    /// set. With `override_existing` false only fields currently unset are
    /// filled in. Skipped entirely if `only_if_done` and the dependency has
    /// not finished.
    pub fn propagate_from(&mut self, dep: &Job, override_existing: bool, only_if_done: bool) -> bool {
        if only_if_done && dep.status != JobStatus::Done {
            return false;
        }
        match serde_json::to_value(dep) {
            Ok(Value::Object(overlay)) => self.merge_overlay(overlay, override_existing),
            _ => false,
        }
    }

    pub(crate) fn merge_overlay(&mut self, mut overlay: Map<String, Value>, override_existing: bool) -> bool {
        for field in PROTECTED_FIELDS {
            overlay.remove(field);
        }
        if overlay.is_empty() {
            return true;
        }
        let mut base = match serde_json::to_value(&*self) {
            Ok(Value::Object(map)) => map,
            _ => return false,
        };
        for (key, value) in overlay {
            if !override_existing && base.get(&key).is_some_and(|v| !v.is_null()) {
                continue;
            }
            if value.is_null() {
                base.remove(&key);
            } else {
                base.insert(key, value);
            }
        }
        match serde_json::from_value::<Job>(Value::Object(base)) {
            Ok(merged) => {
                let last_task = self.last_task.take();
                let output = std::mem::take(&mut self.output);
                *self = merged;
                self.last_task = last_task;
                self.output = output;
                true
            }
            Err(err) => {
                tracing::warn!(
                    job_id = %self.id,
                    error = %err,
                    "discarding a context overlay that does not fit the job record"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(id: &str) -> Job {
        let mut job = Job::placeholder(id.to_string(), id);
        job.device = "cpu".to_string();
        job.task_data = Some(json!({"clip": 7}));
        job
    }

    #[test]
    fn status_serde_round_trip_including_custom_labels() {
        for status in [
            JobStatus::Pending,
            JobStatus::Canceling,
            JobStatus::Done,
            JobStatus::Step("downloading_model".to_string()),
        ] {
            let raw = serde_json::to_string(&status).unwrap();
            let back: JobStatus = serde_json::from_str(&raw).unwrap();
            assert_eq!(back, status);
        }
        assert_eq!(
            serde_json::to_string(&JobStatus::Step("warmup".into())).unwrap(),
            "\"warmup\""
        );
    }

    #[test]
    fn terminal_transition_clears_progress() {
        let mut job = job("a");
        job.progress = Some(json!(0.5));
        job.set_status(JobStatus::Canceling);
        assert!(job.progress.is_none());
        job.progress = Some(json!("90%"));
        job.set_status(JobStatus::Done);
        assert!(job.progress.is_none());
    }

    #[test]
    fn merge_context_keeps_protected_fields() {
        let mut job = job("a");
        job.merge_context(json!({
            "id": "evil",
            "device": "gpu",
            "progress": 0.25,
            "transcript_path": "/tmp/a.srt"
        }));
        assert_eq!(job.id, "a");
        assert_eq!(job.device, "cpu");
        assert_eq!(job.progress, Some(json!(0.25)));
        assert_eq!(job.extra.get("transcript_path"), Some(&json!("/tmp/a.srt")));
    }

    #[test]
    fn merge_context_cannot_change_status() {
        let mut job = job("a");
        job.set_status(JobStatus::Canceling);
        job.merge_context(json!({"status": "processing", "progress": 0.5}));
        assert_eq!(job.status, JobStatus::Canceling);
        assert_eq!(job.progress, Some(json!(0.5)));
    }

    #[test]
    fn merge_context_tolerates_non_object_returns() {
        let mut job = job("a");
        let before = job.clone();
        job.merge_context(json!(42));
        assert_eq!(job.task_data, before.task_data);
        assert_eq!(job.extra, before.extra);
    }

    #[test]
    fn merge_context_null_clears_a_field() {
        let mut job = job("a");
        job.progress = Some(json!(0.9));
        job.merge_context(json!({"progress": null}));
        assert!(job.progress.is_none());
    }

    #[test]
    fn propagate_respects_only_if_done() {
        let mut dep = job("dep");
        dep.extra.insert("transcript_path".into(), json!("/tmp/dep.srt"));
        let mut dependent = job("child");

        assert!(!dependent.propagate_from(&dep, true, true));
        assert!(dependent.extra.get("transcript_path").is_none());

        dep.set_status(JobStatus::Done);
        assert!(dependent.propagate_from(&dep, true, true));
        assert_eq!(dependent.extra.get("transcript_path"), Some(&json!("/tmp/dep.srt")));
        // protected fields survive the copy
        assert_eq!(dependent.id, "child");
        assert_eq!(dependent.name, "child");
    }

    #[test]
    fn transient_fields_are_not_serialized() {
        let mut job = job("a");
        job.last_task = Some("transcribe_audio".to_string());
        job.output.push("line".to_string());
        let value = serde_json::to_value(&job).unwrap();
        assert!(value.get("last_task").is_none());
        assert!(value.get("output").is_none());
    }
}

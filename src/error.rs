use thiserror::Error;

use crate::dispatch::TaskKind;
use crate::scheduler::JobId;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job {0} has no payload (source_file_path or task_data is required)")]
    MissingPayload(JobId),

    #[error("job {0} declares no device")]
    MissingDevice(JobId),

    #[error("no runnable steps resolved from tasks {0:?}")]
    NoRunnableSteps(Vec<TaskKind>),

    #[error("reorder rejected: expected {expected} pending ids, got {got}")]
    ReorderMismatch { expected: usize, got: usize },

    #[error("step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("state file error: {0}")]
    StateFile(#[from] std::io::Error),

    #[error("state file is not valid JSON: {0}")]
    MalformedState(#[from] serde_json::Error),
}

impl QueueError {
    /// Convenience constructor for step implementations that want to report
    /// a failure without defining their own error type.
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepFailed {
            step: step.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

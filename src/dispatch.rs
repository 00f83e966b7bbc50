//! Task dispatch: maps symbolic task kinds to executable step pipelines.
//!
//! The mapping is a closed registry built once at startup by the host
//! application. The queue core never defines step behavior itself; steps
//! are opaque async callables working on the job's field mapping.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{QueueError, Result};

/// The closed set of task kinds the queue knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Transcribe,
    IndexText,
    ClassifySegments,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Transcribe => write!(f, "transcribe"),
            TaskKind::IndexText => write!(f, "index_text"),
            TaskKind::ClassifySegments => write!(f, "classify_segments"),
        }
    }
}

/// Input handed to a step callable: the full current job-record field
/// mapping, plus a cancellation signal the step may optionally watch if it
/// wants sub-step responsiveness. Cancellation is otherwise only observed
/// at step boundaries.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub fields: Map<String, Value>,
    pub cancel: CancellationToken,
}

impl StepContext {
    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

pub type BoxedStepFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;
type StepFn = Arc<dyn Fn(StepContext) -> BoxedStepFuture + Send + Sync>;

/// A single executable pipeline step.
///
/// Steps return an updated field mapping that is merged back into the job
/// record (returned fields win). A non-object return value is tolerated and
/// leaves the record unchanged.
#[derive(Clone)]
pub struct Step {
    label: String,
    run: StepFn,
}

impl Step {
    pub fn new<F, Fut>(label: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            label: label.into(),
            run: Arc::new(move |ctx| Box::pin(f(ctx))),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn invoke(&self, ctx: StepContext) -> BoxedStepFuture {
        (self.run)(ctx)
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("label", &self.label).finish_non_exhaustive()
    }
}

/// Registry mapping each task kind to its ordered step pipeline.
///
/// Built once at startup; resolution is a pure lookup with no side effects.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    pipelines: HashMap<TaskKind, Vec<Step>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the step pipeline for a task kind, replacing any previous
    /// registration.
    pub fn register(&mut self, kind: TaskKind, steps: Vec<Step>) -> &mut Self {
        self.pipelines.insert(kind, steps);
        self
    }

    /// Resolve an ordered sequence of task kinds into a single pipeline by
    /// concatenating the per-task step sequences in input order.
    ///
    /// Unregistered kinds are skipped with a warning; resolution only fails
    /// when no task contributes any step at all.
    pub fn resolve(&self, kinds: &[TaskKind]) -> Result<Vec<Step>> {
        let mut pipeline = Vec::new();
        for kind in kinds {
            match self.pipelines.get(kind) {
                Some(steps) => pipeline.extend(steps.iter().cloned()),
                None => tracing::warn!(task = %kind, "no pipeline registered for task, skipping"),
            }
        }
        if pipeline.is_empty() {
            return Err(QueueError::NoRunnableSteps(kinds.to_vec()));
        }
        Ok(pipeline)
    }
}

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod manager;
pub mod persistence;
pub mod scheduler;
pub mod worker;

pub use config::QueueConfig;
pub use dispatch::{Step, StepContext, TaskKind, TaskRegistry};
pub use error::{QueueError, Result};
pub use events::EventBus;
pub use manager::{EnqueueRequest, QueueManager};
pub use scheduler::{Job, JobId, JobStatus};

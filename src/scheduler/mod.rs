pub mod devices;
pub mod job;
pub mod store;

pub use devices::DeviceAllocator;
pub use job::{Job, JobId, JobStatus};
pub use store::{CancelOutcome, DependencyState, QueueStore};

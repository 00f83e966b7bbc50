use std::path::PathBuf;

/// Configuration for the job queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Path of the flat JSON state file used for crash-resume.
    pub state_file: PathBuf,

    /// When enabled, `resume()` replaces the in-memory history with the
    /// loaded one wholesale, so finished jobs stay visible after a restart.
    /// When disabled, only unfinished jobs are rebuilt.
    pub retain_finished_jobs: bool,

    /// Write a snapshot after every mutating queue operation. Individual
    /// updates may still suppress persistence explicitly.
    pub snapshot_on_update: bool,

    /// Capacity of the observer event channel. Slow subscribers that fall
    /// more than this many events behind start losing events.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("queue_state.json"),
            retain_finished_jobs: true,
            snapshot_on_update: true,
            event_capacity: 256,
        }
    }
}

impl QueueConfig {
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        Self {
            state_file: state_file.into(),
            ..Default::default()
        }
    }

    pub fn with_retain_finished_jobs(mut self, retain: bool) -> Self {
        self.retain_finished_jobs = retain;
        self
    }

    pub fn with_snapshot_on_update(mut self, snapshot: bool) -> Self {
        self.snapshot_on_update = snapshot;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

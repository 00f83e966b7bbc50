//! Flat-file persistence for the job history.
//!
//! The state file is a JSON array of job records with the transient fields
//! (resolved pipeline, current step, side-channel output) stripped. It is
//! rewritten wholesale on every persisted mutation and replaced atomically
//! via a temp file rename, so a crash mid-write never corrupts it.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::scheduler::Job;

#[derive(Debug, Clone)]
pub struct Persistence {
    path: PathBuf,
}

impl Persistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the full history to the state file.
    pub async fn snapshot(&self, jobs: &[Job]) -> Result<()> {
        let json = serde_json::to_vec_pretty(jobs)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), jobs = jobs.len(), "queue state written");
        Ok(())
    }

    /// Read the history back. A missing or malformed state file yields an
    /// empty history rather than an error; a corrupt file is logged and
    /// left in place for inspection.
    pub async fn load(&self) -> Vec<Job> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to read state file");
                return Vec::new();
            }
        };
        match serde_json::from_slice::<Vec<Job>>(&raw) {
            Ok(jobs) => {
                tracing::info!(path = %self.path.display(), jobs = jobs.len(), "queue state loaded");
                jobs
            }
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "state file is malformed, starting empty");
                Vec::new()
            }
        }
    }
}

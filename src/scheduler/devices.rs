use std::collections::HashMap;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::scheduler::job::JobId;

/// A job currently bound to a device.
#[derive(Debug)]
pub struct DeviceBinding {
    pub job_id: JobId,
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl DeviceBinding {
    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Tracks, per logical device name, which job is executing on it.
///
/// Enforces at most one active job per device. A binding whose execution
/// context has already terminated (e.g. a panicked step) no longer counts
/// as occupancy and is cleared lazily on the next availability check.
#[derive(Debug, Default)]
pub struct DeviceAllocator {
    bindings: HashMap<String, DeviceBinding>,
}

impl DeviceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a job's execution context to a device. Replaces any stale
    /// binding left behind by a dead context.
    pub fn bind(
        &mut self,
        device: &str,
        job_id: JobId,
        handle: JoinHandle<()>,
        cancel: CancellationToken,
    ) {
        if let Some(previous) = self.bindings.insert(
            device.to_string(),
            DeviceBinding {
                job_id,
                handle,
                cancel,
            },
        ) {
            if previous.is_live() {
                // Callers must check availability first; a live binding
                // being displaced means that invariant was broken.
                tracing::error!(
                    device,
                    job_id = %previous.job_id,
                    "live device binding displaced"
                );
            }
        }
    }

    pub fn release(&mut self, device: &str) -> Option<DeviceBinding> {
        self.bindings.remove(device)
    }

    /// True when the device has no binding, or only a stale one (which is
    /// cleared here).
    pub fn is_available(&mut self, device: &str) -> bool {
        match self.bindings.get(device) {
            None => true,
            Some(binding) if binding.is_live() => false,
            Some(binding) => {
                tracing::warn!(
                    device,
                    job_id = %binding.job_id,
                    "clearing stale device binding from a dead execution context"
                );
                self.bindings.remove(device);
                true
            }
        }
    }

    /// True when the job is bound to any device with a live context.
    pub fn is_job_bound(&self, job_id: &JobId) -> bool {
        self.bindings
            .values()
            .any(|b| &b.job_id == job_id && b.is_live())
    }

    /// Cancellation token of the binding owning `job_id`, if any.
    pub fn cancel_token(&self, job_id: &JobId) -> Option<CancellationToken> {
        self.bindings
            .values()
            .find(|b| &b.job_id == job_id)
            .map(|b| b.cancel.clone())
    }

    /// Ids of all jobs currently bound to a live context.
    pub fn bound_jobs(&self) -> Vec<JobId> {
        self.bindings
            .values()
            .filter(|b| b.is_live())
            .map(|b| b.job_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unbound_device_is_available() {
        let mut devices = DeviceAllocator::new();
        assert!(devices.is_available("cpu"));
        assert!(!devices.is_job_bound(&"j1".to_string()));
    }

    #[tokio::test]
    async fn bound_device_is_busy_until_released() {
        let mut devices = DeviceAllocator::new();
        let gate = CancellationToken::new();
        let task_gate = gate.clone();
        let handle = tokio::spawn(async move { task_gate.cancelled().await });

        devices.bind("cpu", "j1".to_string(), handle, CancellationToken::new());
        assert!(!devices.is_available("cpu"));
        assert!(devices.is_job_bound(&"j1".to_string()));
        assert!(devices.is_available("gpu"));

        devices.release("cpu");
        assert!(devices.is_available("cpu"));
        gate.cancel();
    }

    #[tokio::test]
    async fn stale_binding_is_cleared_lazily() {
        let mut devices = DeviceAllocator::new();
        let handle = tokio::spawn(async {});
        handle_finished(&handle).await;
        devices.bind("cpu", "j1".to_string(), handle, CancellationToken::new());
        assert!(devices.is_available("cpu"));
        // and the stale entry is gone now
        assert!(!devices.is_job_bound(&"j1".to_string()));
    }

    async fn handle_finished(handle: &JoinHandle<()>) {
        while !handle.is_finished() {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }
}

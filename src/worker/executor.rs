use std::future::Future;
use std::pin::Pin;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::dispatch::StepContext;
use crate::events;
use crate::manager::QueueManager;
use crate::scheduler::{JobId, JobStatus};

/// How a locked between-steps checkpoint ended.
enum Checkpoint {
    /// Keep going; carries the field mapping for the next step.
    Run(serde_json::Map<String, serde_json::Value>),
    /// Stop the pipeline; carries the stop event to publish, if any.
    Stop(Option<String>),
}

/// Run a job's resolved pipeline to completion, failure or cancellation.
///
/// Returned boxed so the scheduler can spawn it and the tail can re-ping
/// the scheduler without creating a recursive future type.
pub(crate) fn run_job(
    manager: QueueManager,
    job_id: JobId,
    cancel: CancellationToken,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let pipeline = {
            let mut store = manager.store().write().await;
            if store.cancel_if_requested(&job_id) {
                // Cancellation won the race before the first step; the
                // cancel path already published the stop event.
                drop(store);
                finish(&manager, &job_id, None).await;
                return;
            }
            let Some(job) = store.job(&job_id) else {
                tracing::error!(job_id = %job_id, "job vanished before execution");
                drop(store);
                finish(&manager, &job_id, None).await;
                return;
            };
            let dependencies = job.dependencies.clone();
            let tasks = job.tasks.clone();

            // Inherit the outputs of finished predecessors before any step
            // sees the record.
            for dep_id in &dependencies {
                if let Err(err) = store.propagate_dependency_fields(&job_id, dep_id, true, false) {
                    tracing::warn!(
                        job_id = %job_id,
                        dependency = %dep_id,
                        error = %err,
                        "dependency fields not propagated"
                    );
                }
            }

            match manager.registry().resolve(&tasks) {
                Ok(pipeline) => pipeline,
                Err(err) => {
                    tracing::error!(job_id = %job_id, error = %err, "pipeline no longer resolvable");
                    let on_stop = store.fail(&job_id);
                    drop(store);
                    manager.notify(events::QUEUE_ITEM_UPDATED);
                    finish(&manager, &job_id, on_stop).await;
                    return;
                }
            }
        };

        let mut stopped: Option<Option<String>> = None;
        for step in &pipeline {
            let checkpoint = {
                let mut store = manager.store().write().await;
                if store.cancel_if_requested(&job_id) {
                    Checkpoint::Stop(None)
                } else {
                    match store.job_mut(&job_id) {
                        None => Checkpoint::Stop(None),
                        Some(job) if job.status == JobStatus::Failed => {
                            // Failed by a concurrent signal; leave as is.
                            Checkpoint::Stop(job.on_stop_event.clone())
                        }
                        Some(job) => {
                            job.last_task = Some(step.label().to_string());
                            job.set_status(JobStatus::Processing);
                            Checkpoint::Run(job.to_context())
                        }
                    }
                }
            };
            let fields = match checkpoint {
                Checkpoint::Run(fields) => fields,
                Checkpoint::Stop(on_stop) => {
                    stopped = Some(on_stop);
                    break;
                }
            };
            manager.notify(events::QUEUE_ITEM_UPDATED);

            tracing::debug!(job_id = %job_id, step = step.label(), "step starting");
            let outcome = step
                .invoke(StepContext {
                    fields,
                    cancel: cancel.clone(),
                })
                .await;

            let item_type = {
                let mut store = manager.store().write().await;
                match outcome {
                    Ok(returned) => match store.job_mut(&job_id) {
                        Some(job) => {
                            job.merge_context(returned);
                            job.last_update = Utc::now();
                            job.item_type.clone()
                        }
                        None => {
                            stopped = Some(None);
                            break;
                        }
                    },
                    Err(err) => {
                        tracing::warn!(job_id = %job_id, step = step.label(), error = %err, "step failed");
                        stopped = Some(store.fail(&job_id));
                        break;
                    }
                }
            };

            manager.notify(events::QUEUE_ITEM_UPDATED);
            if !item_type.is_empty() {
                manager.notify(events::item_type_done(&item_type));
            }
            manager.notify(events::job_done(&job_id));
            manager.persist().await;
        }

        let on_stop = match stopped {
            Some(event) => event,
            None => {
                // Every step ran; settle the final status.
                let mut store = manager.store().write().await;
                if store.cancel_if_requested(&job_id) {
                    None
                } else {
                    match store.job_mut(&job_id) {
                        Some(job) if !job.status.is_terminal() => {
                            job.last_task = None;
                            job.set_status(JobStatus::Done);
                            job.on_stop_event.clone()
                        }
                        Some(job) => job.on_stop_event.clone(),
                        None => None,
                    }
                }
            }
        };

        finish(&manager, &job_id, on_stop).await;
    })
}

/// Common tail for every way a job can stop: release the device binding,
/// publish the stop and completion events, persist, and hand control back
/// to the scheduler.
async fn finish(manager: &QueueManager, job_id: &JobId, on_stop: Option<String>) {
    let summary = {
        let store = manager.store().read().await;
        store
            .job(job_id)
            .map(|job| (job.device.clone(), job.item_type.clone(), job.status.clone()))
    };

    if let Some((device, _, _)) = &summary {
        if !device.is_empty() {
            manager.devices().write().await.release(device);
        }
    }

    if let Some(event) = on_stop {
        manager.notify(event);
    }
    if let Some((_, item_type, status)) = &summary {
        if !item_type.is_empty() {
            manager.notify(events::item_type_done(item_type));
        }
        manager.notify(events::job_done(job_id));
        tracing::info!(job_id = %job_id, status = %status, "job finished");
    }
    manager.notify(events::QUEUE_UPDATED);
    manager.persist().await;

    manager.ping().await;
}

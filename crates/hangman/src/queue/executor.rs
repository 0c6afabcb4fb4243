//! Starts admitted jobs and reports their completion back to the queue.

use std::sync::Arc;

use super::{Admissions, ExecutionQueue, QueueError};
use crate::job::{Job, JobStatus};

/// Drive admissions until the queue is dropped.
///
/// A job that fails to start is logged and marked complete so its slot frees
/// up. An entry killed or removed before it starts is never started, and a
/// detached (killed) entry is no longer watched.
pub async fn run_admitted<T: Job>(queue: Arc<ExecutionQueue<T>>, mut admissions: Admissions<T>) {
    while let Some(entry) = admissions.recv().await {
        let id = entry.id();

        if entry.is_detached() || entry.state() == JobStatus::Complete {
            tracing::debug!(id = %id, "Skipping job removed before start");
            continue;
        }

        if let Err(e) = entry.payload().begin_execute() {
            tracing::error!(id = %id, job = %entry.payload(), error = %e, "Job failed to start");
            if let Err(e) = queue.mark_complete(id) {
                tracing::debug!(id = %id, error = %e, "Failed job already removed");
            }
            continue;
        }

        // A kill that landed while starting found nothing to signal.
        if entry.is_detached() {
            tracing::debug!(id = %id, "Job killed while starting");
            if let Err(e) = entry.payload().kill() {
                tracing::debug!(id = %id, error = %e, "Job already gone");
            }
            continue;
        }

        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::select! {
                exit = entry.payload().completed() => {
                    tracing::info!(id = %id, exit = %exit, "Job exited");
                    match queue.mark_complete(id) {
                        Ok(_) => {}
                        Err(QueueError::NotFound(_)) => {
                            tracing::debug!(id = %id, "Job was already removed");
                        }
                        Err(e) => tracing::warn!(id = %id, error = %e, "Failed to complete job"),
                    }
                }
                _ = entry.detached() => {
                    tracing::debug!(id = %id, "Stopped watching detached job");
                }
            }
        });
    }
    tracing::debug!("Admission channel closed");
}

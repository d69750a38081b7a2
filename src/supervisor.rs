//! Owns capacity accounting and every in-flight job task.

use std::any::Any;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::capacity::CapacityTracker;
use crate::models::{FinishReport, Job};
use crate::runner::JobRunner;

pub struct Supervisor {
    capacity: CapacityTracker,
    runner: JobRunner,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(capacity: CapacityTracker, runner: JobRunner) -> Self {
        Self {
            capacity,
            runner,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn capacity(&self) -> &CapacityTracker {
        &self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Reserve the job's capacity and start it in the background.
    /// Returns as soon as the task is spawned.
    pub fn dispatch(&self, job: Job) {
        let reservation = self.capacity.acquire(job.cpu_required, job.ram_required);
        let after = self.capacity.snapshot();
        info!(
            job_id = %job.id,
            cpu = reservation.cpu(),
            ram = reservation.ram(),
            cpu_left = after.cpu,
            ram_left = after.ram,
            "Dispatching job"
        );

        let runner = self.runner.clone();
        let dispatch = runner.dispatch_api();
        let cancel = self.cancel.child_token();
        let job_id = job.id.clone();

        self.tasks.spawn(async move {
            // Inner task so a panic is observed here as a JoinError. The
            // reservation moves with the job and is released on unwind.
            let job_task = tokio::spawn(async move { runner.run(job, reservation, cancel).await });

            match job_task.await {
                Ok(report) => {
                    info!(job_id = %job_id, ok = report.ok, exit_code = report.exit_code, "Job finished");
                }
                Err(e) => {
                    let message = describe_join_error(e);
                    error!(job_id = %job_id, "Job task aborted: {}", message);
                    if let Err(e) = dispatch.finish(&job_id, &FinishReport::failure(message)).await {
                        warn!(job_id = %job_id, "Failed to send finish report: {}", e);
                    }
                }
            }
        });
    }

    /// Wait for every dispatched job to finish. No new jobs may be
    /// dispatched afterwards.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Stop every running container, report the jobs as failed, then drain.
    pub async fn shutdown(&self) {
        info!(in_flight = self.in_flight(), "Cancelling in-flight jobs");
        self.cancel.cancel();
        self.drain().await;
    }
}

fn describe_join_error(e: JoinError) -> String {
    if e.is_panic() {
        panic_message(e.into_panic())
    } else {
        "Job task was cancelled".to_string()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "Job panicked".to_string()
    }
}

#[cfg(test)]
#[path = "./supervisor_tests.rs"]
mod tests;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatch::DispatchApi;
use crate::supervisor::Supervisor;

/// Asks the dispatch service for work on a fixed interval and hands every
/// returned job to the supervisor without waiting for it.
pub struct JobPoller {
    dispatch: Arc<dyn DispatchApi>,
    supervisor: Arc<Supervisor>,
    interval: Duration,
}

impl JobPoller {
    pub fn new(dispatch: Arc<dyn DispatchApi>, supervisor: Arc<Supervisor>, interval: Duration) -> Self {
        Self {
            dispatch,
            supervisor,
            interval,
        }
    }

    /// Poll once immediately, then every interval, until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        info!(poll_interval_secs = self.interval.as_secs(), "Job poller started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Job poller shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }

    /// One cycle. Returns how many jobs were dispatched.
    pub async fn poll_once(&self) -> usize {
        let available = self.supervisor.capacity().snapshot();
        info!(cpu = available.cpu, ram = available.ram, "Getting jobs");

        if available.is_exhausted() {
            info!("No resources available");
            return 0;
        }

        let jobs = match self.dispatch.fetch_jobs(available.cpu, available.ram).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Failed getting jobs: {}", e);
                return 0;
            }
        };

        if jobs.is_empty() {
            info!("No job found");
            return 0;
        }

        // The service sized this batch; it is not re-checked against capacity.
        let count = jobs.len();
        for job in jobs {
            info!(job_id = %job.id, "Found job");
            self.supervisor.dispatch(job);
        }
        count
    }
}

#[cfg(test)]
#[path = "./poller_tests.rs"]
mod tests;

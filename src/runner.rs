//! Drives a single job from image build to finish report.
//!
//! Whatever happens, [`JobRunner::run`] sends exactly one finish report
//! and releases the job's reservation exactly once.

use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use crate::capacity::Reservation;
use crate::config::Timings;
use crate::dispatch::DispatchApi;
use crate::engine::{ContainerEngine, ContainerSpec, OutputStream};
use crate::image::ImageBuilder;
use crate::models::{FinishReport, Job};
use crate::relay::LogRelay;
use crate::staging::StagedFiles;

pub const INVALID_ID: &str = "Invalid job ID";
pub const BUILD_FAILED: &str = "Failed to build image";
pub const STAGE_FAILED: &str = "Failed writing command";
pub const CREATE_FAILED: &str = "Failed to create container";
pub const ATTACH_FAILED: &str = "Failed to attach to container";
pub const SHUTDOWN: &str = "Agent shutting down";

/// How long to keep reading output after the container has exited.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

pub fn timeout_message(limit_secs: u64) -> String {
    format!("Container exceeded time limit of {} seconds", limit_secs)
}

/// Lifecycle states of one job, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Reserved,
    Building,
    Staged,
    Created,
    Running,
    Completed,
    TimedOut,
    Failed,
    Reported,
    CleanedUp,
}

#[derive(Clone)]
pub struct JobRunner {
    engine: Arc<dyn ContainerEngine>,
    dispatch: Arc<dyn DispatchApi>,
    builder: Arc<ImageBuilder>,
    cache_dir: PathBuf,
    prefix: String,
    timings: Timings,
}

impl JobRunner {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        dispatch: Arc<dyn DispatchApi>,
        builder: Arc<ImageBuilder>,
        cache_dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        timings: Timings,
    ) -> Self {
        Self {
            engine,
            dispatch,
            builder,
            cache_dir: cache_dir.into(),
            prefix: prefix.into(),
            timings,
        }
    }

    pub fn dispatch_api(&self) -> Arc<dyn DispatchApi> {
        self.dispatch.clone()
    }

    /// Run the job to a terminal state, report it, and give its capacity back.
    pub async fn run(&self, job: Job, mut reservation: Reservation, cancel: CancellationToken) -> FinishReport {
        transition(&job, JobState::Reserved);
        let (terminal, report) = self.execute(&job, &cancel).await;
        transition(&job, terminal);

        self.report(&job.id, &report).await;
        transition(&job, JobState::Reported);

        reservation.release();
        transition(&job, JobState::CleanedUp);
        report
    }

    async fn report(&self, job_id: &str, report: &FinishReport) {
        if !report.ok {
            error!(job_id, exit_code = report.exit_code, "Job failed: {}", report.error);
        }
        if let Err(e) = self.dispatch.finish(job_id, report).await {
            warn!(job_id, "Failed to send finish report: {}", e);
        }
    }

    async fn execute(&self, job: &Job, cancel: &CancellationToken) -> (JobState, FinishReport) {
        if let Err(e) = job.check_id() {
            error!(job_id = %job.id, "Refusing job: {}", e);
            return (JobState::Failed, FinishReport::failure(INVALID_ID));
        }

        transition(job, JobState::Building);
        let build_started = Instant::now();
        let image = match self.builder.build(job).await {
            Ok(tag) => tag,
            Err(e) => {
                error!(job_id = %job.id, "Image build failed: {}", e);
                return (JobState::Failed, FinishReport::failure(BUILD_FAILED));
            }
        };

        let relay = LogRelay::new(job.id.clone(), self.dispatch.clone());
        let preamble = format!(
            "[System] Building image...\n> Built in {} seconds\n\nOUTPUT:\n",
            build_started.elapsed().as_secs_f64().ceil() as u64
        );
        relay.push(preamble.as_bytes());

        let staged = match StagedFiles::write(&self.cache_dir, job).await {
            Ok(staged) => staged,
            Err(e) => {
                error!(job_id = %job.id, "Staging failed: {}", e);
                return (JobState::Failed, FinishReport::failure(STAGE_FAILED));
            }
        };
        transition(job, JobState::Staged);

        let outcome = self.run_container(job, &image, &staged, &relay, cancel).await;
        staged.remove().await;
        outcome
    }

    async fn run_container(
        &self,
        job: &Job,
        image: &str,
        staged: &StagedFiles,
        relay: &LogRelay,
        cancel: &CancellationToken,
    ) -> (JobState, FinishReport) {
        if cancel.is_cancelled() {
            return (JobState::Failed, FinishReport::failure(SHUTDOWN));
        }

        let mut labels = HashMap::new();
        labels.insert("managed_by".to_string(), self.prefix.clone());
        labels.insert("job_id".to_string(), job.id.clone());

        let spec = ContainerSpec {
            name: format!("{}-{}", self.prefix, job.id),
            image: image.to_string(),
            binds: staged.binds(),
            limits: job.limits(),
            labels,
        };

        let container = match self.engine.create_container(spec).await {
            Ok(id) => id,
            Err(e) => {
                error!(job_id = %job.id, "Create failed: {}", e);
                return (JobState::Failed, FinishReport::failure(CREATE_FAILED));
            }
        };
        transition(job, JobState::Created);

        let watchdog = tokio::time::sleep(Duration::from_secs(job.time_limit));
        tokio::pin!(watchdog);

        // Registered before start so a container that exits and is
        // auto-removed immediately still reports its status.
        let mut exit = AbortOnDropHandle::new(tokio::spawn({
            let engine = self.engine.clone();
            let container = container.clone();
            async move { engine.wait_container(&container).await }
        }));

        // Attached before start: an auto-removed container that exits
        // immediately is gone before a later attach could land.
        let output = match self.engine.attach_container(&container).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(job_id = %job.id, "Attach failed: {}", e);
                self.discard(job, &container).await;
                return (JobState::Failed, FinishReport::failure(ATTACH_FAILED));
            }
        };
        let mut pump = AbortOnDropHandle::new(tokio::spawn(pump_output(output, relay.clone())));

        if let Err(e) = self.engine.start_container(&container).await {
            error!(job_id = %job.id, "Start failed: {}", e);
            self.discard(job, &container).await;
            return (JobState::Failed, FinishReport::failure(e.to_string()));
        }
        transition(job, JobState::Running);

        let mut ticker = relay.spawn_ticker(self.timings.log_flush_interval);

        let outcome = tokio::select! {
            waited = &mut exit => match waited {
                Ok(Ok(code)) => {
                    info!(job_id = %job.id, exit_code = code, "Container exited");
                    if tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut pump).await.is_err() {
                        warn!(job_id = %job.id, "Output stream still open after exit");
                    }
                    let state = if code == 0 { JobState::Completed } else { JobState::Failed };
                    (state, FinishReport::exited(code))
                }
                Ok(Err(e)) => {
                    error!(job_id = %job.id, "Wait failed: {}", e);
                    (JobState::Failed, FinishReport::failure(e.to_string()))
                }
                Err(e) => (JobState::Failed, FinishReport::failure(e.to_string())),
            },
            _ = &mut watchdog => {
                warn!(job_id = %job.id, "Time limit of {} seconds reached, stopping container", job.time_limit);
                self.stop(job, &container).await;
                (JobState::TimedOut, FinishReport::failure(timeout_message(job.time_limit)))
            }
            _ = cancel.cancelled() => {
                warn!(job_id = %job.id, "Cancelled, stopping container");
                self.stop(job, &container).await;
                (JobState::Failed, FinishReport::failure(SHUTDOWN))
            }
        };

        ticker.stop().await;
        debug!(job_id = %job.id, bytes = relay.pending(), "Final log flush");
        relay.finish().await;
        outcome
    }

    async fn stop(&self, job: &Job, container: &str) {
        if let Err(e) = self.engine.stop_container(container, self.timings.stop_grace).await {
            warn!(job_id = %job.id, "Failed to stop container {}: {}", container, e);
        }
    }

    /// Auto-removal only follows an exit, so a container that never
    /// started has to be removed by hand.
    async fn discard(&self, job: &Job, container: &str) {
        if let Err(e) = self.engine.remove_container(container).await {
            warn!(job_id = %job.id, "Failed to remove container {}: {}", container, e);
        }
    }
}

async fn pump_output(mut output: OutputStream, relay: LogRelay) {
    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(bytes) => relay.push(&bytes),
            Err(e) => {
                warn!("Output stream error: {}", e);
                break;
            }
        }
    }
}

fn transition(job: &Job, state: JobState) {
    info!(job_id = %job.id, state = ?state, "Job state");
}

#[cfg(test)]
#[path = "./runner_tests.rs"]
mod tests;

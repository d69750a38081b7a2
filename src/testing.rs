//! In-memory stand-ins for the container engine and the dispatch service.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Timings;
use crate::dispatch::DispatchApi;
use crate::engine::{BuildRequest, ContainerEngine, ContainerSpec, OutputStream};
use crate::error::{AgentError, Result};
use crate::host::HostInfo;
use crate::image::ImageBuilder;
use crate::models::{BaseImage, FinishReport, Grant, Job};
use crate::runner::JobRunner;

pub const TEMPLATE: &str = "FROM {{ IMG }}\nCOPY install.sh /install.sh\nRUN {{ ENTRY }} /install.sh\nCMD [\"{{ ENTRY }}\", \"/run.sh\"]\n";

/// Exit code the fake reports for a container killed by `stop`.
pub const STOPPED_EXIT_CODE: i64 = 137;

pub fn job(id: &str) -> Job {
    Job {
        id: id.to_string(),
        function_id: format!("fn-{}", id),
        base_image: BaseImage::Alpine320,
        base_command: "apk add curl".to_string(),
        command: "echo hello".to_string(),
        data: "{}".to_string(),
        cpu_required: 1,
        ram_required: 256,
        time_limit: 10,
    }
}

pub fn fast_timings() -> Timings {
    Timings {
        poll_interval: Duration::from_secs(60),
        heartbeat_interval: Duration::from_secs(60),
        log_flush_interval: Duration::from_secs(3),
        stop_grace: Duration::from_secs(1),
    }
}

/// Engine whose containers "run" for a configurable time and print a
/// fixed list of chunks.
pub struct FakeEngine {
    calls: Mutex<Vec<String>>,
    builds: Mutex<Vec<BuildRequest>>,
    specs: Mutex<Vec<ContainerSpec>>,
    pub fail_build: AtomicBool,
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_attach: AtomicBool,
    /// Attach fails once a container has exited, as it does for an
    /// auto-removed container.
    pub fail_attach_after_exit: AtomicBool,
    pub panic_on_create: AtomicBool,
    output: Mutex<Vec<Vec<u8>>>,
    chunk_delay: Mutex<Duration>,
    run_for: Mutex<Duration>,
    exit_code: Mutex<i64>,
    started: CancellationToken,
    exited: AtomicBool,
    stopped: CancellationToken,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            builds: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
            fail_build: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_attach: AtomicBool::new(false),
            fail_attach_after_exit: AtomicBool::new(false),
            panic_on_create: AtomicBool::new(false),
            output: Mutex::new(vec![b"hello\n".to_vec()]),
            chunk_delay: Mutex::new(Duration::ZERO),
            run_for: Mutex::new(Duration::from_secs(1)),
            exit_code: Mutex::new(0),
            started: CancellationToken::new(),
            exited: AtomicBool::new(false),
            stopped: CancellationToken::new(),
        }
    }
}

impl FakeEngine {
    pub fn set_output(&self, chunks: &[&str], delay: Duration) {
        self.set_raw_output(chunks.iter().map(|c| c.as_bytes().to_vec()).collect(), delay);
    }

    pub fn set_raw_output(&self, chunks: Vec<Vec<u8>>, delay: Duration) {
        *self.output.lock().unwrap() = chunks;
        *self.chunk_delay.lock().unwrap() = delay;
    }

    pub fn set_run(&self, run_for: Duration, exit_code: i64) {
        *self.run_for.lock().unwrap() = run_for;
        *self.exit_code.lock().unwrap() = exit_code;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn builds(&self) -> Vec<BuildRequest> {
        self.builds.lock().unwrap().clone()
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.specs.lock().unwrap().clone()
    }

    /// A started container with no run time has already exited, even if
    /// nobody has polled its wait yet.
    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
            || (self.started.is_cancelled() && self.run_for.lock().unwrap().is_zero())
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn build_image(&self, request: BuildRequest) -> Result<()> {
        self.record("build");
        self.builds.lock().unwrap().push(request);
        if self.fail_build.load(Ordering::SeqCst) {
            return Err(AgentError::Build("The command '/bin/sh -c ash /install.sh' returned a non-zero code: 1".into()));
        }
        Ok(())
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String> {
        self.record("create");
        if self.panic_on_create.load(Ordering::SeqCst) {
            panic!("engine exploded");
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(AgentError::Internal("no such image".into()));
        }
        let id = format!("ctr-{}", spec.name);
        self.specs.lock().unwrap().push(spec);
        Ok(id)
    }

    async fn start_container(&self, _id: &str) -> Result<()> {
        self.record("start");
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(AgentError::Internal("cannot start".into()));
        }
        self.started.cancel();
        Ok(())
    }

    async fn attach_container(&self, _id: &str) -> Result<OutputStream> {
        self.record("attach");
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(AgentError::Internal("attach refused".into()));
        }
        if self.fail_attach_after_exit.load(Ordering::SeqCst) && self.has_exited() {
            return Err(AgentError::Internal("no such container".into()));
        }
        let chunks = self.output.lock().unwrap().clone();
        let delay = *self.chunk_delay.lock().unwrap();
        let started = self.started.clone();
        let stream = stream::iter(chunks).then(move |chunk| {
            let started = started.clone();
            async move {
                started.cancelled().await;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, AgentError>(chunk)
            }
        });
        Ok(stream.boxed())
    }

    async fn wait_container(&self, _id: &str) -> Result<i64> {
        self.record("wait");
        let run_for = *self.run_for.lock().unwrap();
        let code = *self.exit_code.lock().unwrap();
        let status = tokio::select! {
            _ = async {
                self.started.cancelled().await;
                tokio::time::sleep(run_for).await;
            } => code,
            _ = self.stopped.cancelled() => STOPPED_EXIT_CODE,
        };
        self.exited.store(true, Ordering::SeqCst);
        Ok(status)
    }

    async fn stop_container(&self, _id: &str, _grace: Duration) -> Result<()> {
        self.record("stop");
        self.stopped.cancel();
        Ok(())
    }

    async fn remove_container(&self, _id: &str) -> Result<()> {
        self.record("remove");
        Ok(())
    }
}

/// Dispatch service that records everything sent to it.
#[derive(Default)]
pub struct FakeDispatch {
    jobs: Mutex<Vec<Vec<Job>>>,
    fetches: Mutex<Vec<(i64, i64)>>,
    logs: Mutex<Vec<(String, String)>>,
    finishes: Mutex<Vec<(String, FinishReport)>>,
    pings: AtomicUsize,
    fail_ping: AtomicBool,
    fail_fetch: AtomicBool,
    fail_logs: AtomicBool,
}

impl FakeDispatch {
    /// Queue a response for the next `fetch_jobs` call.
    pub fn push_jobs(&self, jobs: Vec<Job>) {
        self.jobs.lock().unwrap().push(jobs);
    }

    pub fn set_fail_ping(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_logs(&self, fail: bool) {
        self.fail_logs.store(fail, Ordering::SeqCst);
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> Vec<(i64, i64)> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn logs(&self) -> Vec<(String, String)> {
        self.logs.lock().unwrap().clone()
    }

    /// Every relayed message for `job_id`, concatenated in send order.
    pub fn log_text(&self, job_id: &str) -> String {
        self.logs()
            .into_iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, msg)| msg)
            .collect()
    }

    pub fn finishes(&self) -> Vec<(String, FinishReport)> {
        self.finishes.lock().unwrap().clone()
    }

    pub fn finishes_for(&self, job_id: &str) -> Vec<FinishReport> {
        self.finishes()
            .into_iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, report)| report)
            .collect()
    }
}

#[async_trait]
impl DispatchApi for FakeDispatch {
    async fn connect(&self, _host: &HostInfo) -> Result<Grant> {
        Ok(Grant { cpu: 4, ram: 4096 })
    }

    async fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(AgentError::Rejected("HTTP 503 Service Unavailable".into()));
        }
        Ok(())
    }

    async fn fetch_jobs(&self, cpu: i64, ram: i64) -> Result<Vec<Job>> {
        self.fetches.lock().unwrap().push((cpu, ram));
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(AgentError::Rejected("HTTP 502 Bad Gateway".into()));
        }
        let mut queued = self.jobs.lock().unwrap();
        if queued.is_empty() {
            return Ok(Vec::new());
        }
        Ok(queued.remove(0))
    }

    async fn send_log(&self, job_id: &str, message: &str) -> Result<()> {
        if self.fail_logs.load(Ordering::SeqCst) {
            return Err(AgentError::Rejected("HTTP 500 Internal Server Error".into()));
        }
        self.logs.lock().unwrap().push((job_id.to_string(), message.to_string()));
        Ok(())
    }

    async fn finish(&self, job_id: &str, report: &FinishReport) -> Result<()> {
        self.finishes.lock().unwrap().push((job_id.to_string(), report.clone()));
        Ok(())
    }
}

/// A runner wired to fresh fakes, with scratch space under `dir`.
pub fn runner_with(engine: Arc<FakeEngine>, dispatch: Arc<FakeDispatch>, dir: &std::path::Path) -> JobRunner {
    let build_root = dir.join("build");
    std::fs::create_dir_all(&build_root).unwrap();
    let builder = ImageBuilder::new(engine.clone(), TEMPLATE, build_root, "controvos");
    JobRunner::new(engine, dispatch, Arc::new(builder), dir, "controvos", fast_timings())
}

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::BuildImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{AgentError, Result};
use crate::models::ResourceLimits;

/// Request timeout for the engine socket. Builds and waits hold a request
/// open for as long as the job runs.
const ENGINE_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Combined stdout/stderr of a container as raw frames. Frame boundaries
/// may fall inside a multi-byte character.
pub type OutputStream = BoxStream<'static, Result<Vec<u8>>>;

/// Everything the engine needs to build one job image.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub tag: String,
    /// Tar archive of the build context.
    pub context: Vec<u8>,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `host:container` bind mounts.
    pub binds: Vec<String>,
    pub limits: ResourceLimits,
    pub labels: HashMap<String, String>,
}

/// The operations the agent needs from a local container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Build and tag an image, always pulling the base layer. Fails on the
    /// first error reported in the build progress.
    async fn build_image(&self, request: BuildRequest) -> Result<()>;

    /// Create a container that is removed by the engine once it exits.
    /// Returns the container id.
    async fn create_container(&self, spec: ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Attach to combined output. Works on a created container that has not
    /// been started yet; replays anything already written.
    async fn attach_container(&self, id: &str) -> Result<OutputStream>;

    /// Block until the container exits and return its status code.
    async fn wait_container(&self, id: &str) -> Result<i64>;

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()>;

    /// Force-remove a container that never ran to exit.
    async fn remove_container(&self, id: &str) -> Result<()>;
}

pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect(socket: &Path) -> Result<Self> {
        if !socket.exists() {
            return Err(AgentError::EngineNotFound(socket.display().to_string()));
        }
        let path = socket
            .to_str()
            .ok_or_else(|| AgentError::Config(format!("Socket path is not UTF-8: {:?}", socket)))?;
        let docker = Docker::connect_with_unix(path, ENGINE_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?;
        Ok(Self { docker })
    }

    /// Round trip to the daemon so a dead socket fails at startup.
    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn build_image(&self, request: BuildRequest) -> Result<()> {
        let limits = request.limits;
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: request.tag.clone(),
            pull: true,
            rm: true,
            memory: u64::try_from(limits.memory_bytes).ok(),
            cpuperiod: u64::try_from(limits.cpu_period).ok(),
            cpuquota: u64::try_from(limits.cpu_quota).ok(),
            cpushares: u64::try_from(limits.cpu_shares).ok(),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(request.context.into()));

        while let Some(progress) = stream.try_next().await? {
            if let Some(err) = progress.error {
                return Err(AgentError::Build(err));
            }
            if let Some(line) = progress.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(tag = %request.tag, "{}", line);
                }
            }
            match (progress.status, progress.progress) {
                (Some(status), Some(bar)) => debug!(tag = %request.tag, "{} {}", status, bar),
                (Some(status), None) => debug!(tag = %request.tag, "{}", status),
                _ => {}
            }
        }

        info!(tag = %request.tag, "Image built");
        Ok(())
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String> {
        let limits = spec.limits;
        let config = Config {
            image: Some(spec.image.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                auto_remove: Some(true),
                memory: Some(limits.memory_bytes),
                cpu_period: Some(limits.cpu_period),
                cpu_quota: Some(limits.cpu_quota),
                cpu_shares: Some(limits.cpu_shares),
                binds: Some(spec.binds.clone()),
                ..Default::default()
            }),
            tty: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions { name: spec.name.as_str(), platform: None }),
                config,
            )
            .await?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn attach_container(&self, id: &str) -> Result<OutputStream> {
        let options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { output, .. } =
            self.docker.attach_container(id, Some(options)).await?;

        let stream = output.filter_map(|chunk| async move {
            match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => Some(Ok(message.to_vec())),
                Ok(LogOutput::StdIn { .. }) => None,
                Err(e) => Some(Err(AgentError::from(e))),
            }
        });
        Ok(stream.boxed())
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        // Auto-removed containers vanish right after exit; "removed" is the
        // condition that still reports the status code in that case.
        let options = WaitContainerOptions { condition: "removed" };
        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard surfaces non-zero exits as an error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(AgentError::Internal(format!(
                "Wait stream for container {} closed without a status",
                id
            ))),
        }
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions { t: grace.as_secs() as i64 };
        self.docker.stop_container(id, Some(options)).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }
}

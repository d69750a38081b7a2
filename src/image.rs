//! Per-job image builds.
//!
//! Each job gets a fresh build request tagged `<prefix>-<functionID>:latest`.
//! Reuse only comes from the engine's own layer cache; images are never
//! deleted by the agent.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

use crate::engine::{BuildRequest, ContainerEngine};
use crate::error::{AgentError, Result};
use crate::models::{BaseImage, Job};

pub const IMAGE_PLACEHOLDER: &str = "{{ IMG }}";
pub const ENTRY_PLACEHOLDER: &str = "{{ ENTRY }}";
pub const DOCKERFILE_NAME: &str = "Dockerfile";
pub const INSTALL_SCRIPT_NAME: &str = "install.sh";

pub struct ImageBuilder {
    engine: Arc<dyn ContainerEngine>,
    template: String,
    /// Build contexts live in `<build_root>/<jobID>/`.
    build_root: PathBuf,
    prefix: String,
}

impl ImageBuilder {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        template: impl Into<String>,
        build_root: impl Into<PathBuf>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            template: template.into(),
            build_root: build_root.into(),
            prefix: prefix.into(),
        }
    }

    /// Read the build template from disk. A missing template is a startup
    /// failure, not a per-job one.
    pub async fn load(
        engine: Arc<dyn ContainerEngine>,
        template_path: &Path,
        build_root: impl Into<PathBuf>,
        prefix: impl Into<String>,
    ) -> Result<Self> {
        let template = fs::read_to_string(template_path).await.map_err(|e| {
            AgentError::Config(format!("Cannot read build template {:?}: {}", template_path, e))
        })?;
        if !template.contains(IMAGE_PLACEHOLDER) || !template.contains(ENTRY_PLACEHOLDER) {
            warn!(path = ?template_path, "Build template is missing a placeholder");
        }
        Ok(Self::new(engine, template, build_root, prefix))
    }

    pub fn tag_for(&self, job: &Job) -> String {
        format!("{}-{}:latest", self.prefix, job.function_id)
    }

    pub fn render(&self, base: &BaseImage) -> String {
        render_template(&self.template, base)
    }

    /// Build the job's image and return its tag.
    pub async fn build(&self, job: &Job) -> Result<String> {
        job.check_id()?;
        let tag = self.tag_for(job);
        let context_dir = self.build_root.join(&job.id);

        if let BaseImage::Unknown(name) = &job.base_image {
            info!(job_id = %job.id, base_image = %name, "Unknown base image, using debian-12");
        }

        let result = self.build_in(job, &tag, &context_dir).await;

        // The context is transient whatever the outcome.
        if let Err(e) = fs::remove_dir_all(&context_dir).await {
            warn!(job_id = %job.id, "Failed to remove build context {:?}: {}", context_dir, e);
        }

        result.map(|_| tag)
    }

    async fn build_in(&self, job: &Job, tag: &str, context_dir: &Path) -> Result<()> {
        fs::create_dir_all(context_dir).await?;
        fs::write(context_dir.join(DOCKERFILE_NAME), self.render(&job.base_image)).await?;
        fs::write(context_dir.join(INSTALL_SCRIPT_NAME), &job.base_command).await?;

        let context = pack_context(context_dir.to_path_buf()).await?;

        info!(job_id = %job.id, tag, base = job.base_image.image_ref(), "Building image");
        self.engine
            .build_image(BuildRequest {
                tag: tag.to_string(),
                context,
                limits: job.limits(),
            })
            .await
    }
}

pub fn render_template(template: &str, base: &BaseImage) -> String {
    template
        .replace(IMAGE_PLACEHOLDER, base.image_ref())
        .replace(ENTRY_PLACEHOLDER, base.entrypoint())
}

/// Tar the build context in memory. The tar crate is synchronous, so this
/// runs on the blocking pool.
async fn pack_context(dir: PathBuf) -> Result<Vec<u8>> {
    let packed = tokio::task::spawn_blocking(move || {
        let mut tar = tar::Builder::new(Vec::new());
        tar.append_dir_all(".", &dir)?;
        tar.into_inner()
    })
    .await
    .map_err(|e| AgentError::Internal(format!("Context packing task failed: {}", e)))?;

    Ok(packed?)
}

#[cfg(test)]
#[path = "./image_tests.rs"]
mod tests;

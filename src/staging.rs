use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

use crate::error::Result;
use crate::models::Job;

/// Where the staged files appear inside the container.
pub const SCRIPT_MOUNT: &str = "/run.sh";
pub const DATA_MOUNT: &str = "/request.txt";

/// A job's command script and data payload, written to the scratch
/// directory and bind-mounted into its container.
#[derive(Debug)]
pub struct StagedFiles {
    pub script: PathBuf,
    pub data: PathBuf,
}

impl StagedFiles {
    pub fn paths(cache_dir: &Path, job_id: &str) -> Self {
        Self {
            script: cache_dir.join(format!("{}.sh", job_id)),
            data: cache_dir.join(format!("{}.txt", job_id)),
        }
    }

    /// Write both files, readable by any container user and the script
    /// executable. Anything half-written is removed on failure.
    pub async fn write(cache_dir: &Path, job: &Job) -> Result<Self> {
        job.check_id()?;
        let staged = Self::paths(cache_dir, &job.id);
        if let Err(e) = staged.write_contents(job).await {
            staged.remove().await;
            return Err(e);
        }
        Ok(staged)
    }

    async fn write_contents(&self, job: &Job) -> Result<()> {
        fs::write(&self.script, &job.command).await?;
        fs::set_permissions(&self.script, std::fs::Permissions::from_mode(0o755)).await?;

        fs::write(&self.data, &job.data).await?;
        fs::set_permissions(&self.data, std::fs::Permissions::from_mode(0o644)).await?;
        Ok(())
    }

    pub fn binds(&self) -> Vec<String> {
        vec![
            format!("{}:{}", self.script.display(), SCRIPT_MOUNT),
            format!("{}:{}", self.data.display(), DATA_MOUNT),
        ]
    }

    pub async fn remove(&self) {
        for path in [&self.script, &self.data] {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove staged file {:?}: {}", path, e),
            }
        }
    }
}

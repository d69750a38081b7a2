use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

use crate::error::{AgentError, Result};

// --- DATA STRUCTURES ---

/// Exit code reported when the agent itself fails a job (build, staging,
/// timeout, ...) rather than the job's command exiting non-zero.
pub const AGENT_FAILURE_EXIT_CODE: i64 = -500;

const BYTES_PER_MB: i64 = 1_048_576;
/// CFS accounting period shared by the build and the run path (100ms).
pub const CPU_PERIOD_MICROS: i64 = 100_000;
const CPU_SHARES: i64 = 1024;

/// Base image family requested by a job.
///
/// Anything outside the known set falls back to the debian-12 / bash
/// pairing, as does a missing or null `baseImage`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "Option<String>", into = "String")]
pub enum BaseImage {
    Debian12,
    Ubuntu24,
    Alpine320,
    Unknown(String),
}

impl BaseImage {
    /// Image reference used in the `FROM` line.
    pub fn image_ref(&self) -> &'static str {
        match self {
            BaseImage::Debian12 | BaseImage::Unknown(_) => "debian:12",
            BaseImage::Ubuntu24 => "ubuntu:24.04",
            BaseImage::Alpine320 => "alpine:3.20",
        }
    }

    /// Shell used to run both the install script and the job command.
    pub fn entrypoint(&self) -> &'static str {
        match self {
            BaseImage::Alpine320 => "ash",
            _ => "bash",
        }
    }
}

impl From<String> for BaseImage {
    fn from(value: String) -> Self {
        match value.as_str() {
            "debian-12" => BaseImage::Debian12,
            "ubuntu-24" => BaseImage::Ubuntu24,
            "alpine-3.20" => BaseImage::Alpine320,
            _ => BaseImage::Unknown(value),
        }
    }
}

impl From<Option<String>> for BaseImage {
    fn from(value: Option<String>) -> Self {
        BaseImage::from(value.unwrap_or_default())
    }
}

impl Default for BaseImage {
    fn default() -> Self {
        BaseImage::Unknown(String::new())
    }
}

impl From<&str> for BaseImage {
    fn from(value: &str) -> Self {
        BaseImage::from(value.to_string())
    }
}

impl From<BaseImage> for String {
    fn from(value: BaseImage) -> Self {
        match value {
            BaseImage::Debian12 => "debian-12".to_string(),
            BaseImage::Ubuntu24 => "ubuntu-24".to_string(),
            BaseImage::Alpine320 => "alpine-3.20".to_string(),
            BaseImage::Unknown(other) => other,
        }
    }
}

/// One unit of work as handed out by the dispatch service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Job {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "functionID")]
    pub function_id: String,
    #[serde(rename = "baseImage", default)]
    pub base_image: BaseImage,
    #[serde(rename = "baseCommand", default)]
    pub base_command: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub data: String,
    /// vCPU units.
    #[serde(rename = "cpuRequired")]
    pub cpu_required: i64,
    /// Megabytes.
    #[serde(rename = "ramRequired")]
    pub ram_required: i64,
    /// Seconds.
    #[serde(rename = "timeLimit")]
    pub time_limit: u64,
}

impl Job {
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits::for_job(self.cpu_required, self.ram_required)
    }

    /// The ID names files and directories under the scratch space, so it
    /// must be exactly one plain path component.
    pub fn check_id(&self) -> Result<()> {
        check_job_id(&self.id)
    }
}

pub fn check_job_id(id: &str) -> Result<()> {
    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name == id => Ok(()),
        _ => Err(AgentError::InvalidJobId(id.to_string())),
    }
}

/// Engine resource limits derived from a job's requirements. Used for
/// both the build hints and the running container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub cpu_shares: i64,
}

impl ResourceLimits {
    pub fn for_job(cpu: i64, ram_mb: i64) -> Self {
        Self {
            memory_bytes: ram_mb * BYTES_PER_MB,
            cpu_period: CPU_PERIOD_MICROS,
            cpu_quota: cpu * CPU_PERIOD_MICROS,
            cpu_shares: CPU_SHARES,
        }
    }
}

/// Capacity granted by the dispatch service on connect.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Grant {
    pub cpu: i64,
    pub ram: i64,
}

#[derive(Debug, Deserialize)]
pub struct JobsResponse {
    pub found: bool,
    #[serde(default)]
    pub jobs: Vec<Job>,
}

#[derive(Debug, Serialize)]
pub struct LogMessage<'a> {
    pub message: &'a str,
}

/// Terminal report for a job. Sent exactly once per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinishReport {
    pub ok: bool,
    #[serde(rename = "exitCode")]
    pub exit_code: i64,
    pub error: String,
}

impl FinishReport {
    /// Outcome of a container that ran to completion. Details live in the
    /// relayed log stream, not in the report.
    pub fn exited(exit_code: i64) -> Self {
        Self {
            ok: exit_code == 0,
            exit_code,
            error: "Check logs ^".to_string(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            exit_code: AGENT_FAILURE_EXIT_CODE,
            error: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_image_table() {
        assert_eq!(BaseImage::from("alpine-3.20").image_ref(), "alpine:3.20");
        assert_eq!(BaseImage::from("alpine-3.20").entrypoint(), "ash");
        assert_eq!(BaseImage::from("ubuntu-24").image_ref(), "ubuntu:24.04");
        assert_eq!(BaseImage::from("ubuntu-24").entrypoint(), "bash");
        assert_eq!(BaseImage::from("debian-12").image_ref(), "debian:12");
    }

    #[test]
    fn test_unknown_base_image_falls_back_to_debian() {
        let image = BaseImage::from("bogus-distro");
        assert_eq!(image, BaseImage::Unknown("bogus-distro".to_string()));
        assert_eq!(image.image_ref(), "debian:12");
        assert_eq!(image.entrypoint(), "bash");
    }

    #[test]
    fn test_job_deserializes_from_dispatch_payload() {
        let payload = r#"{
            "ID": "job-1",
            "functionID": "fn-9",
            "baseImage": "bogus-distro",
            "baseCommand": "apt-get update",
            "command": "echo hello",
            "data": "{}",
            "cpuRequired": 2,
            "ramRequired": 512,
            "timeLimit": 30
        }"#;
        let job: Job = serde_json::from_str(payload).unwrap();
        assert_eq!(job.id, "job-1");
        assert_eq!(job.function_id, "fn-9");
        assert_eq!(job.base_image.image_ref(), "debian:12");
        assert_eq!(job.time_limit, 30);

        let limits = job.limits();
        assert_eq!(limits.memory_bytes, 512 * 1_048_576);
        assert_eq!(limits.cpu_period, 100_000);
        assert_eq!(limits.cpu_quota, 200_000);
    }

    #[test]
    fn test_job_id_must_be_a_single_plain_component() {
        assert!(check_job_id("job-1").is_ok());
        assert!(check_job_id("6650f1c2e4b0a1").is_ok());
        for bad in ["", ".", "..", "../victim", "a/b", "/etc", "job-1/", "./job-1"] {
            assert!(
                matches!(check_job_id(bad), Err(AgentError::InvalidJobId(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_null_or_missing_base_image_does_not_poison_the_batch() {
        let body = r#"{
            "found": true,
            "jobs": [
                {"ID": "a", "functionID": "f", "baseImage": "alpine-3.20",
                 "cpuRequired": 1, "ramRequired": 128, "timeLimit": 5},
                {"ID": "b", "functionID": "f", "baseImage": null,
                 "cpuRequired": 1, "ramRequired": 128, "timeLimit": 5},
                {"ID": "c", "functionID": "f",
                 "cpuRequired": 1, "ramRequired": 128, "timeLimit": 5}
            ]
        }"#;
        let resp: JobsResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.jobs.len(), 3);
        assert_eq!(resp.jobs[0].base_image, BaseImage::Alpine320);
        assert_eq!(resp.jobs[1].base_image.image_ref(), "debian:12");
        assert_eq!(resp.jobs[2].base_image.entrypoint(), "bash");
    }

    #[test]
    fn test_jobs_response_without_jobs_field() {
        let resp: JobsResponse = serde_json::from_str(r#"{"found": false}"#).unwrap();
        assert!(!resp.found);
        assert!(resp.jobs.is_empty());
    }

    #[test]
    fn test_finish_report_wire_format() {
        let report = FinishReport::exited(0);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json, serde_json::json!({"ok": true, "exitCode": 0, "error": "Check logs ^"}));

        let failed = FinishReport::failure("Failed to build image");
        assert!(!failed.ok);
        assert_eq!(failed.exit_code, AGENT_FAILURE_EXIT_CODE);
    }
}

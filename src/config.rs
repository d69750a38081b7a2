use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AgentError, Result};

pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";
pub const DEFAULT_IMAGE_PREFIX: &str = "controvos";

/// Cadences for the periodic tasks of the agent.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// How often the poller asks for new work.
    pub poll_interval: Duration,
    /// How often a liveness ping is sent.
    pub heartbeat_interval: Duration,
    /// How often buffered job output is relayed.
    pub log_flush_interval: Duration,
    /// Grace period handed to the engine when stopping a container.
    pub stop_grace: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(60),
            log_flush_interval: Duration::from_secs(3),
            stop_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Connect code sent with every dispatch request.
    pub code: String,
    /// Base URL of the dispatch service, without trailing slash.
    pub api_url: String,
    pub docker_socket: PathBuf,
    /// Scratch space for staged job inputs and build contexts.
    pub cache_dir: PathBuf,
    /// Build template with `{{ IMG }}` and `{{ ENTRY }}` placeholders.
    pub template_path: PathBuf,
    /// Images are tagged `<prefix>-<functionID>:latest`.
    pub image_prefix: String,
    pub timings: Timings,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Timings::default();

        let code = required("CODE")?;
        let api_url = required("API")?.trim_end_matches('/').to_string();

        let timings = Timings {
            poll_interval: secs_or("POLL_INTERVAL_SECS", defaults.poll_interval)?,
            heartbeat_interval: secs_or("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?,
            log_flush_interval: secs_or("LOG_FLUSH_INTERVAL_SECS", defaults.log_flush_interval)?,
            stop_grace: secs_or("STOP_GRACE_SECS", defaults.stop_grace)?,
        };

        Ok(Self {
            code,
            api_url,
            docker_socket: path_or("DOCKER_SOCKET", DEFAULT_DOCKER_SOCKET),
            cache_dir: path_or("CACHE_DIR", "./cache"),
            template_path: path_or("TEMPLATE_PATH", "./DockerTemplate.txt"),
            image_prefix: env::var("IMAGE_PREFIX")
                .unwrap_or_else(|_| DEFAULT_IMAGE_PREFIX.to_string()),
            timings,
        })
    }
}

fn required(key: &str) -> Result<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AgentError::Config(format!("{} environment variable not set", key))),
    }
}

fn path_or(key: &str, default: &str) -> PathBuf {
    PathBuf::from(env::var(key).unwrap_or_else(|_| default.to_string()))
}

fn secs_or(key: &str, default: Duration) -> Result<Duration> {
    match env::var(key) {
        Ok(raw) => parse_secs(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_secs(key: &str, raw: &str) -> Result<Duration> {
    let secs = u64::from_str(raw.trim())
        .map_err(|_| AgentError::Config(format!("{} must be a whole number of seconds, got {:?}", key, raw)))?;
    if secs == 0 {
        return Err(AgentError::Config(format!("{} must be greater than zero", key)));
    }
    Ok(Duration::from_secs(secs))
}

use std::env::consts::ARCH;
use std::thread;

use crate::error::{AgentError, Result};

const MEMINFO_PATH: &str = "/proc/meminfo";

/// What this node reports about itself on connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    /// Architecture family as the dispatch service names it: `x86` or `arm`.
    pub arch: String,
    pub cpu_count: usize,
    pub ram_mb: u64,
}

impl HostInfo {
    pub fn probe() -> Result<Self> {
        let arch = arch_family(ARCH)?.to_string();
        let cpu_count = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let meminfo = std::fs::read_to_string(MEMINFO_PATH)?;
        let ram_mb = parse_mem_total_mb(&meminfo)
            .ok_or_else(|| AgentError::Internal(format!("MemTotal missing from {}", MEMINFO_PATH)))?;

        Ok(Self { arch, cpu_count, ram_mb })
    }
}

pub fn arch_family(arch: &str) -> Result<&'static str> {
    match arch {
        "x86_64" => Ok("x86"),
        "arm" | "aarch64" => Ok("arm"),
        other => Err(AgentError::UnsupportedArch(other.to_string())),
    }
}

/// `MemTotal` from `/proc/meminfo`, floored to whole megabytes.
fn parse_mem_total_mb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

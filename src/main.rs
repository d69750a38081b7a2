// Controvos Agent v0.1.0 - Worker Node Edition
// Copyright (c) 2025 Controvos.

mod capacity;
mod config;
mod dispatch;
mod engine;
mod error;
mod heartbeat;
mod host;
mod image;
mod models;
mod poller;
mod relay;
mod runner;
mod shutdown;
mod staging;
mod supervisor;
#[cfg(test)]
mod testing;

use dotenvy::dotenv;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::capacity::CapacityTracker;
use crate::config::AgentConfig;
use crate::dispatch::{DispatchApi, DispatchClient};
use crate::engine::{ContainerEngine, DockerEngine};
use crate::error::Result;
use crate::heartbeat::HeartbeatEmitter;
use crate::host::HostInfo;
use crate::image::ImageBuilder;
use crate::poller::JobPoller;
use crate::runner::JobRunner;
use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    info!("Starting Controvos agent");

    let config = AgentConfig::from_env()?;

    // 1. Probe the host
    let host = HostInfo::probe()?;
    info!(arch = %host.arch, cpus = host.cpu_count, ram_mb = host.ram_mb, "Host resources");

    // 2. Container engine
    let docker = DockerEngine::connect(&config.docker_socket)?;
    docker.ping().await?;
    info!(socket = ?config.docker_socket, "Connected to Docker");
    let engine: Arc<dyn ContainerEngine> = Arc::new(docker);

    // 3. Scratch space
    tokio::fs::create_dir_all(config.cache_dir.join("build")).await?;
    let cache_dir = tokio::fs::canonicalize(&config.cache_dir).await?;

    // 4. Register with the dispatch service
    let dispatch: Arc<dyn DispatchApi> = Arc::new(DispatchClient::new(&config.api_url, &config.code)?);
    let grant = dispatch.connect(&host).await?;
    info!(cpu = grant.cpu, ram = grant.ram, "Connected to dispatch service");

    // 5. Job engine
    let builder = ImageBuilder::load(
        engine.clone(),
        &config.template_path,
        cache_dir.join("build"),
        &config.image_prefix,
    )
    .await?;
    let runner = JobRunner::new(
        engine,
        dispatch.clone(),
        Arc::new(builder),
        cache_dir,
        &config.image_prefix,
        config.timings,
    );
    let supervisor = Arc::new(Supervisor::new(CapacityTracker::new(grant.cpu, grant.ram), runner));

    // 6. Background loops
    let shutdown = shutdown::install_shutdown_handler();

    let heartbeat = HeartbeatEmitter::new(dispatch.clone(), config.timings.heartbeat_interval);
    let heartbeat_task = tokio::spawn({
        let cancel = shutdown.clone();
        async move { heartbeat.run(cancel).await }
    });

    let poller = JobPoller::new(dispatch, supervisor.clone(), config.timings.poll_interval);
    poller.run(shutdown.clone()).await;

    // 7. Drain
    let _ = heartbeat_task.await;
    supervisor.shutdown().await;
    info!("Agent stopped");
    Ok(())
}

//! Client side of the dispatch service protocol.
//!
//! Every request carries the connect code as a `code` query parameter.

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::error::{AgentError, Result};
use crate::host::HostInfo;
use crate::models::{FinishReport, Grant, Job, JobsResponse, LogMessage};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait DispatchApi: Send + Sync {
    /// Register this node and learn how much capacity it may use.
    async fn connect(&self, host: &HostInfo) -> Result<Grant>;

    async fn ping(&self) -> Result<()>;

    /// Ask for work that fits in `cpu`/`ram`. An empty list means none.
    async fn fetch_jobs(&self, cpu: i64, ram: i64) -> Result<Vec<Job>>;

    async fn send_log(&self, job_id: &str, message: &str) -> Result<()>;

    async fn finish(&self, job_id: &str, report: &FinishReport) -> Result<()>;
}

pub struct DispatchClient {
    http: reqwest::Client,
    base_url: String,
    code: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

impl DispatchClient {
    pub fn new(base_url: impl Into<String>, code: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            code: code.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Turn a non-success status into `Rejected`, keeping the server's
    /// `error` message when it sent one.
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = match response.json::<ErrorBody>().await {
            Ok(ErrorBody { error: Some(msg) }) => msg,
            _ => status_text(status),
        };
        Err(AgentError::Rejected(message))
    }
}

fn status_text(status: StatusCode) -> String {
    format!("HTTP {}", status)
}

#[async_trait]
impl DispatchApi for DispatchClient {
    async fn connect(&self, host: &HostInfo) -> Result<Grant> {
        let cpu_count = host.cpu_count.to_string();
        let ram = host.ram_mb.to_string();
        let response = self
            .http
            .get(self.url("/connect"))
            .query(&[
                ("code", self.code.as_str()),
                ("cpu", host.arch.as_str()),
                ("cpucount", cpu_count.as_str()),
                ("ram", ram.as_str()),
            ])
            .send()
            .await?;
        let grant = Self::check(response).await?.json::<Grant>().await?;
        Ok(grant)
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .http
            .get(self.url("/ping"))
            .query(&[("code", self.code.as_str())])
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn fetch_jobs(&self, cpu: i64, ram: i64) -> Result<Vec<Job>> {
        let cpu = cpu.to_string();
        let ram = ram.to_string();
        let response = self
            .http
            .get(self.url("/jobs/get"))
            .query(&[
                ("code", self.code.as_str()),
                ("cpu", cpu.as_str()),
                ("ram", ram.as_str()),
            ])
            .send()
            .await?;
        let body = Self::check(response).await?.json::<JobsResponse>().await?;
        if !body.found {
            return Ok(Vec::new());
        }
        Ok(body.jobs)
    }

    async fn send_log(&self, job_id: &str, message: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url("/jobs/log"))
            .query(&[("code", self.code.as_str()), ("id", job_id)])
            .json(&LogMessage { message })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn finish(&self, job_id: &str, report: &FinishReport) -> Result<()> {
        let response = self
            .http
            .post(self.url("/jobs/finish"))
            .query(&[("code", self.code.as_str()), ("id", job_id)])
            .json(report)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

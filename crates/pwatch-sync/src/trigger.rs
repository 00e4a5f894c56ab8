//! Scrape-trigger boundary. Triggers report success as a flag and never error.

use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pwatch_core::ScrapeProfile;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeRequest {
    pub reference_url: String,
    pub competitor_urls: Vec<String>,
    pub categories: Vec<String>,
    pub owner_id: String,
}

impl From<ScrapeProfile> for ScrapeRequest {
    fn from(profile: ScrapeProfile) -> Self {
        Self {
            reference_url: profile.reference_url,
            competitor_urls: profile.competitor_urls,
            categories: profile.categories,
            owner_id: profile.owner_id,
        }
    }
}

#[async_trait]
pub trait ScrapeTrigger: Send + Sync {
    async fn trigger(&self, request: &ScrapeRequest) -> bool;
}

/// Used when scraping is driven elsewhere; comparisons run on existing data.
#[derive(Debug, Default)]
pub struct NoopScrapeTrigger;

#[async_trait]
impl ScrapeTrigger for NoopScrapeTrigger {
    async fn trigger(&self, request: &ScrapeRequest) -> bool {
        debug!(owner_id = %request.owner_id, "scrape trigger disabled");
        true
    }
}

/// POSTs the request as JSON and expects a 2xx answer.
#[derive(Debug)]
pub struct HttpScrapeTrigger {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpScrapeTrigger {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent.to_string())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl ScrapeTrigger for HttpScrapeTrigger {
    async fn trigger(&self, request: &ScrapeRequest) -> bool {
        match self.client.post(&self.endpoint).json(request).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(owner_id = %request.owner_id, status = resp.status().as_u16(), "scrape completed");
                true
            }
            Ok(resp) => {
                warn!(
                    owner_id = %request.owner_id,
                    status = resp.status().as_u16(),
                    endpoint = %self.endpoint,
                    "scrape endpoint rejected request"
                );
                false
            }
            Err(err) => {
                warn!(
                    owner_id = %request.owner_id,
                    timeout = err.is_timeout(),
                    error = %err,
                    "scrape request failed"
                );
                false
            }
        }
    }
}

/// Runs an out-of-process worker with the request JSON as its last argument.
/// The child is killed when the timeout elapses or the future is dropped.
#[derive(Debug, Clone)]
pub struct ProcessScrapeTrigger {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessScrapeTrigger {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Split a shell-like command line on whitespace: `"node worker.js --fast"`.
    pub fn from_command_line(command: &str, timeout: Duration) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect(), timeout))
    }
}

#[async_trait]
impl ScrapeTrigger for ProcessScrapeTrigger {
    async fn trigger(&self, request: &ScrapeRequest) -> bool {
        let payload = match serde_json::to_string(request) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(owner_id = %request.owner_id, error = %err, "could not encode scrape request");
                return false;
            }
        };

        let spawned = Command::new(&self.program)
            .args(&self.args)
            .arg(payload)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                warn!(program = %self.program, error = %err, "could not spawn scrape worker");
                return false;
            }
        };

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => true,
            Ok(Ok(status)) => {
                warn!(owner_id = %request.owner_id, code = ?status.code(), "scrape worker exited with failure");
                false
            }
            Ok(Err(err)) => {
                warn!(owner_id = %request.owner_id, error = %err, "waiting on scrape worker failed");
                false
            }
            Err(_) => {
                warn!(
                    owner_id = %request.owner_id,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "scrape worker timed out; killing"
                );
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "killing scrape worker failed");
                }
                false
            }
        }
    }
}

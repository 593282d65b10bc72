//! Backend health probing and readiness polling.

use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::ProbeError;

/// Result of one probe. Never stored; recomputed on every check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(self) -> bool {
        self == HealthStatus::Healthy
    }
}

/// Health check response from the backend
#[derive(Debug, Clone, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Issues bounded-time GET requests against the health endpoint.
#[derive(Debug, Clone)]
pub struct HealthProber {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HealthProber {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// `Healthy` iff the endpoint answers 200 with `"status": "healthy"`.
    pub async fn probe(&self) -> HealthStatus {
        match self.diagnose().await {
            Ok(_) => HealthStatus::Healthy,
            Err(e) => {
                log::debug!("health probe {} failed: {}", self.url, e);
                HealthStatus::Unhealthy
            }
        }
    }

    /// Same check as [`probe`](Self::probe) but keeps the reason for failure.
    pub async fn diagnose(&self) -> Result<HealthReport, ProbeError> {
        tokio::time::timeout(self.timeout, self.fetch())
            .await
            .unwrap_or(Err(ProbeError::Deadline))
    }

    async fn fetch(&self) -> Result<HealthReport, ProbeError> {
        let response = self
            .http
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(ProbeError::Request)?;

        if response.status() != StatusCode::OK {
            return Err(ProbeError::Status(response.status()));
        }

        let report = response
            .json::<HealthReport>()
            .await
            .map_err(ProbeError::Body)?;
        if report.status == "healthy" {
            Ok(report)
        } else {
            Err(ProbeError::NotHealthy(report.status))
        }
    }
}

/// Poll `prober` until healthy, the process goes away, or `budget` runs out.
///
/// `is_alive` is checked before every probe; once it returns `false` the wait
/// ends with failure without probing again. Probes and sleeps are cut short at
/// the end of the budget.
pub async fn wait_until_ready<F>(
    prober: &HealthProber,
    is_alive: F,
    budget: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();

    let remaining = || budget.saturating_sub(start.elapsed());

    while !remaining().is_zero() {
        if !is_alive() {
            return false;
        }

        match tokio::time::timeout(remaining(), prober.probe()).await {
            Ok(status) if status.is_healthy() => return true,
            Ok(_) => {}
            Err(_) => break,
        }

        tokio::time::sleep(poll_interval.min(remaining())).await;
    }

    false
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::config::join_url;
use crate::supervisor::Supervisor;

/// HTTP client for backend task endpoints.
///
/// Every request first makes sure the backend is up via
/// [`Supervisor::ensure_running`].
pub struct BackendClient {
    supervisor: Arc<Supervisor>,
    client: Client,
    base: String,
}

impl BackendClient {
    pub fn new(supervisor: Arc<Supervisor>, timeout: Duration) -> Result<Self> {
        let base = supervisor.settings().server_url.clone();
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            supervisor,
            client,
            base,
        })
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub async fn get_json(&self, path: &str) -> Result<Value> {
        self.ensure_backend().await?;
        let url = join_url(&self.base, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        read_json(resp).await
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        self.ensure_backend().await?;
        let url = join_url(&self.base, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;
        read_json(resp).await
    }

    async fn ensure_backend(&self) -> Result<()> {
        self.supervisor
            .ensure_running()
            .await
            .map_err(|e| {
                let msg = e.user_message();
                anyhow::Error::new(e).context(msg)
            })
    }
}

async fn read_json(resp: reqwest::Response) -> Result<Value> {
    match resp.status() {
        StatusCode::OK => Ok(resp.json::<Value>().await?),
        status => {
            let text = resp.text().await.unwrap_or_default();
            bail!("backend request failed: {} - {}", status, text)
        }
    }
}

//! Blocking client for the BigBoat dashboard v2 API.

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::json;

/// Compose file pair forming a container application's deployment manifest:
/// repository filename and its dashboard file identifier.
pub const COMPOSE_FILES: [(&str, &str); 2] = [
    ("docker-compose.yml", "dockerCompose"),
    ("bigboat-compose.yml", "bigboatCompose"),
];

/// A BigBoat dashboard client bound to one instance and API key.
#[derive(Debug, Clone)]
pub struct BigBoat {
    base: String,
    key: String,
    http: Client,
}

/// An application registered on the dashboard.
#[derive(Debug, Clone, Deserialize)]
pub struct App {
    pub name: String,
    pub version: String,
}

impl BigBoat {
    pub fn new(url: &str, key: &str) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("deployd/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build BigBoat HTTP client")?;

        Ok(Self {
            base: url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v2/{path}", self.base)
    }

    /// The application with this name and version, or `None` when the
    /// dashboard does not know it.
    pub fn app(&self, name: &str, version: &str) -> Result<Option<App>> {
        let url = self.url(&format!("apps/{name}/{version}"));
        let resp = self
            .http
            .get(&url)
            .header("api-key", &self.key)
            .send()
            .context("BigBoat request failed")?;
        match resp.status() {
            StatusCode::OK => Ok(Some(resp.json().context("failed to parse BigBoat app JSON")?)),
            StatusCode::NOT_FOUND => Ok(None),
            s => bail!("unexpected status from BigBoat for {url}: {s}"),
        }
    }

    /// Register the application; `None` when the dashboard refuses.
    pub fn update_app(&self, name: &str, version: &str) -> Result<Option<App>> {
        let url = self.url(&format!("apps/{name}/{version}"));
        let resp = self
            .http
            .put(&url)
            .header("api-key", &self.key)
            .send()
            .context("BigBoat request failed")?;
        if resp.status().is_success() {
            Ok(Some(resp.json().context("failed to parse BigBoat app JSON")?))
        } else {
            Ok(None)
        }
    }

    /// Upload one compose file for the application.
    pub fn update_compose(
        &self,
        name: &str,
        version: &str,
        file_id: &str,
        contents: &[u8],
    ) -> Result<bool> {
        let url = self.url(&format!("apps/{name}/{version}/files/{file_id}"));
        let resp = self
            .http
            .put(&url)
            .header("api-key", &self.key)
            .header("Content-Type", "text/plain")
            .body(contents.to_vec())
            .send()
            .context("BigBoat request failed")?;
        Ok(resp.status().is_success())
    }

    /// Request an instance update of the application.
    pub fn update_instance(&self, name: &str, instance: &str, version: &str) -> Result<bool> {
        let url = self.url(&format!("instances/{instance}"));
        let resp = self
            .http
            .put(&url)
            .header("api-key", &self.key)
            .json(&json!({"app": name, "version": version}))
            .send()
            .context("BigBoat request failed")?;
        Ok(resp.status().is_success())
    }
}

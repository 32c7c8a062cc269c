use serde_json::Value;
use tracing::info;

use crate::error::DriverError;

/// Client for the external cluster control plane.
///
/// The protocol is two calls: `POST {base}/clusters/` registers a cluster
/// and returns `{"self": url}`, and `PATCH {url}` with a form field `json`
/// replaces the cluster's stored topology document.
#[derive(Debug, Clone)]
pub struct ClusterClient {
    client: reqwest::Client,
    url: String,
}

impl ClusterClient {
    /// Register a new cluster under `base` and return a client bound to it.
    pub async fn create(base: &str) -> Result<Self, DriverError> {
        let client = reqwest::Client::new();
        let url = format!("{}/clusters/", base.trim_end_matches('/'));
        let body: Value = client
            .post(&url)
            .send()
            .await
            .map_err(|e| DriverError::Cluster(format!("POST {}: {}", url, e)))?
            .json()
            .await
            .map_err(|e| DriverError::Cluster(format!("decode {}: {}", url, e)))?;

        let self_url = body["self"]
            .as_str()
            .ok_or_else(|| DriverError::Cluster(format!("{}: no 'self' in response", url)))?
            .to_string();
        info!(cluster = %self_url, "registered new cluster");
        Ok(Self { client, url: self_url })
    }

    /// Bind to an already-registered cluster URL.
    pub fn at(url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Replace the cluster's topology document.
    pub async fn update(&self, data: &Value) -> Result<(), DriverError> {
        let serialized = data.to_string();
        self.client
            .patch(&self.url)
            .form(&[("json", serialized.as_str())])
            .send()
            .await
            .map_err(|e| DriverError::Cluster(format!("PATCH {}: {}", self.url, e)))?
            .error_for_status()
            .map_err(|e| DriverError::Cluster(format!("PATCH {}: {}", self.url, e)))?;
        Ok(())
    }
}

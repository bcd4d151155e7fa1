//! Control-plane API client.
//!
//! Thin typed wrapper over the cloud inventory HTTP API. Only the fields and
//! operations the proxy consumes are modelled; everything else in the API
//! surface is ignored.

use crate::instance::{InstanceRecord, InstancesResponse};
use serde_json::json;
use std::time::Duration;

const DEFAULT_API_BASE: &str = "https://console.vast.ai/api/v0";

/// Errors from control-plane calls.
#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("control plane returned HTTP {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Client for the control-plane HTTP API.
///
/// Cheap to clone; the underlying connection pool is shared.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl ControlPlaneClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_API_BASE.to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
        }
    }

    /// Override the API base URL (used in tests against a mock control plane).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Fetch all instance records visible to this account.
    pub async fn list_instances(&self) -> Result<Vec<InstanceRecord>, ControlPlaneError> {
        let resp = self
            .http
            .get(format!("{}/instances/", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let resp = error_for_status(resp).await?;
        let result: InstancesResponse = resp.json().await?;
        Ok(result.instances)
    }

    /// Set the operator-visible label on an instance. An empty string clears it.
    pub async fn set_label(&self, instance_id: u64, label: &str) -> Result<(), ControlPlaneError> {
        let resp = self
            .http
            .put(format!("{}/instances/{}/", self.base_url, instance_id))
            .bearer_auth(&self.api_key)
            .json(&json!({ "label": label }))
            .send()
            .await?;
        error_for_status(resp).await?;
        Ok(())
    }

    /// Destroy an instance permanently. Irreversible; all data on the
    /// instance is lost.
    pub async fn destroy_instance(&self, instance_id: u64) -> Result<(), ControlPlaneError> {
        let resp = self
            .http
            .delete(format!("{}/instances/{}/", self.base_url, instance_id))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        error_for_status(resp).await?;
        Ok(())
    }

    /// Attach a public SSH key to an instance.
    pub async fn attach_ssh_key(
        &self,
        instance_id: u64,
        public_key: &str,
    ) -> Result<(), ControlPlaneError> {
        let resp = self
            .http
            .post(format!("{}/instances/{}/ssh/", self.base_url, instance_id))
            .bearer_auth(&self.api_key)
            .json(&json!({ "ssh_key": public_key }))
            .send()
            .await?;
        error_for_status(resp).await?;
        Ok(())
    }
}

async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response, ControlPlaneError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    // Keep a short body excerpt for diagnostics.
    let body = resp.text().await.unwrap_or_default();
    let body = body.chars().take(512).collect();
    Err(ControlPlaneError::Status { status, body })
}

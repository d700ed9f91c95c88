//! Minimal Alertmanager API v2 client.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Alert, AlertBackend};
use crate::config::AlertmanagerConfig;
use crate::error::AlertError;

/// `GET /api/v2/status` response, reduced to what readiness needs.
#[derive(Debug, Deserialize)]
struct Status {
    #[serde(rename = "versionInfo")]
    version_info: Option<serde_json::Value>,
    cluster: Option<ClusterStatus>,
}

#[derive(Debug, Deserialize)]
struct ClusterStatus {
    status: Option<String>,
}

impl Status {
    fn is_ready(&self) -> bool {
        self.version_info.is_some()
            && self
                .cluster
                .as_ref()
                .and_then(|c| c.status.as_deref())
                .is_some_and(|s| s.eq_ignore_ascii_case("ready"))
    }
}

/// [`AlertBackend`] over `reqwest`.
pub struct AlertmanagerClient {
    http: reqwest::Client,
    base_url: String,
}

impl AlertmanagerClient {
    pub fn new(config: &AlertmanagerConfig) -> Result<Self, AlertError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|source| AlertError::Request {
                url: config.base_url.clone(),
                source,
            })?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn api_url(&self, resource: &str) -> String {
        format!("{}/api/v2/{resource}", self.base_url)
    }
}

#[async_trait]
impl AlertBackend for AlertmanagerClient {
    async fn is_ready(&self) -> Result<bool, AlertError> {
        let url = self.api_url("status");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| AlertError::Request {
                url: url.clone(),
                source,
            })?;
        if response.status() != StatusCode::OK {
            return Err(AlertError::Status {
                url,
                status: response.status().as_u16(),
            });
        }

        let status: Status = response
            .json()
            .await
            .map_err(|e| AlertError::InvalidResponse {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        if !status.is_ready() {
            warn!(url = %url, "Alertmanager answered but is not ready");
        }
        Ok(status.is_ready())
    }

    async fn post_alert(&self, alert: &Alert) -> Result<(), AlertError> {
        let url = self.api_url("alerts");
        let response = self
            .http
            .post(&url)
            .json(&[alert])
            .send()
            .await
            .map_err(|source| AlertError::Request {
                url: url.clone(),
                source,
            })?;
        if response.status() != StatusCode::OK {
            return Err(AlertError::Status {
                url,
                status: response.status().as_u16(),
            });
        }
        debug!(alertname = alert.name().unwrap_or_default(), "Alert posted");
        Ok(())
    }
}

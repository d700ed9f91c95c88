//! Diversion of messages to Prometheus Alertmanager.
//!
//! Many devices can only report problems by email. Messages matching the
//! configured rules are turned into Alertmanager alerts instead of being
//! relayed, so they get deduplicated, silenced and routed like any other
//! alert.

mod client;
mod diversion;
mod rules;

pub use client::AlertmanagerClient;
pub use diversion::AlertDiversion;
pub use rules::{AlertDraft, AlertRules};

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AlertError;

/// Label stamped on every alert the relay produces.
pub const FORWARDED_BY_LABEL: &str = "forwarded-by";
pub const FORWARDED_BY_VALUE: &str = "localsmtprelay";

const ENDS_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// An alert as posted to `POST /api/v2/alerts`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Alert {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    #[serde(rename = "generatorURL", skip_serializing_if = "Option::is_none")]
    pub generator_url: Option<String>,
    #[serde(rename = "endsAt", skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<String>,
}

impl Alert {
    pub fn name(&self) -> Option<&str> {
        self.labels.get("alertname").map(String::as_str)
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.labels.insert("alertname".to_string(), name.into());
    }

    pub fn set_ends_at(&mut self, at: DateTime<Utc>) {
        self.ends_at = Some(at.format(ENDS_AT_FORMAT).to_string());
    }
}

/// An Alertmanager instance.
#[async_trait]
pub trait AlertBackend: Send + Sync {
    /// `Ok(true)` when the instance reports a ready cluster.
    async fn is_ready(&self) -> Result<bool, AlertError>;

    async fn post_alert(&self, alert: &Alert) -> Result<(), AlertError>;
}

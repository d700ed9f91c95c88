//! Configuration types.
//!
//! The relay reads a single JSON document. Secrets may also come from the
//! environment (`RELAY_SMTP_PASSWORD`, `RELAY_LLM_API_KEY`) so they stay out
//! of the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::pipeline::rules::MessageFields;

/// Default capacity of the forwarding queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 5;

/// Default idle delay before the upstream connection is closed.
pub const DEFAULT_IDLE_DELAY: Duration = Duration::from_secs(60);

const DEFAULT_SMTP_PORT: u16 = 25;
const DEFAULT_TRANSPORT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 120;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 100;

/// Relay configuration, one section per component.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub store: StoreConfig,
    pub forwarder: ForwarderConfig,
    #[serde(default)]
    pub alertmanager: Option<AlertmanagerConfig>,
    #[serde(default)]
    pub llm: Option<LlmConfig>,
    #[serde(default)]
    pub startup_notification: Option<StartupNotificationConfig>,
}

impl RelayConfig {
    /// Load, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_json(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    fn apply_env(&mut self) {
        if let Ok(password) = std::env::var("RELAY_SMTP_PASSWORD")
            && let Some(auth) = self.forwarder.authentication.as_mut()
        {
            auth.password = Some(SecretString::from(password));
        }
        if let Ok(api_key) = std::env::var("RELAY_LLM_API_KEY")
            && let Some(llm) = self.llm.as_mut()
        {
            llm.api_key = Some(SecretString::from(api_key));
        }
    }

    /// Check values that serde cannot. Regexes are compiled later, when
    /// the pipeline is built, and report through the same error type.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.directory.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "store.directory".into(),
                hint: "Set the directory where accepted messages are stored.".into(),
            });
        }
        for address in &self.store.destination_whitelist {
            validate_address("store.destination_whitelist", address)?;
        }

        if self.forwarder.hostname.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "forwarder.hostname".into(),
                hint: "Set the upstream SMTP relay host.".into(),
            });
        }
        if let Some(recipient) = &self.forwarder.default_recipient {
            validate_address("forwarder.default_recipient", recipient)?;
        }
        if let Some(auth) = &self.forwarder.authentication {
            if auth.username.is_empty() {
                return Err(ConfigError::invalid(
                    "forwarder.authentication.username",
                    "must not be empty",
                ));
            }
            if auth.password.is_none() && auth.password_file.is_none() {
                return Err(ConfigError::MissingRequired {
                    key: "forwarder.authentication.password".into(),
                    hint: "Set password, password_file or RELAY_SMTP_PASSWORD.".into(),
                });
            }
        }

        if let Some(notification) = &self.startup_notification {
            validate_address("startup_notification.to", &notification.to)?;
            if let Some(from) = &notification.from {
                validate_address("startup_notification.from", from)?;
            }
        }
        Ok(())
    }
}

fn validate_address(key: &str, address: &str) -> Result<(), ConfigError> {
    address
        .parse::<lettre::Address>()
        .map(|_| ())
        .map_err(|e| ConfigError::invalid(key, format!("{address}: {e}")))
}

/// Where and how accepted messages are stored.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub directory: PathBuf,
    /// Re-queue messages left over from a previous run before accepting mail.
    #[serde(default)]
    pub catch_up_on_startup: bool,
    /// When non-empty, every recipient must be listed here.
    #[serde(default)]
    pub destination_whitelist: Vec<String>,
    /// No limit when absent.
    #[serde(default)]
    pub max_message_size: Option<u64>,
    #[serde(default)]
    pub reject_empty_recipient: bool,
}

/// Upstream relay, queue and pipeline settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwarderConfig {
    pub hostname: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// Implicit TLS when set, opportunistic STARTTLS otherwise.
    #[serde(default)]
    pub enable_ssl: bool,
    #[serde(default = "default_hello_name")]
    pub hello_name: String,
    #[serde(default)]
    pub authentication: Option<AuthenticationConfig>,
    #[serde(default)]
    pub max_queue_length: Option<usize>,
    #[serde(default)]
    pub auto_disconnect_after_idle_secs: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub shutdown_timeout_secs: Option<u64>,
    #[serde(default)]
    pub default_recipient: Option<String>,
    /// Process messages but never send them.
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub void: VoidConfig,
    #[serde(default)]
    pub llm_enrichment: LlmEnrichmentConfig,
}

fn default_hello_name() -> String {
    "localhost".to_string()
}

impl ForwarderConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SMTP_PORT)
    }

    pub fn queue_capacity(&self) -> usize {
        self.max_queue_length
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_QUEUE_CAPACITY)
    }

    /// Zero or absent falls back to the one minute default.
    pub fn idle_delay(&self) -> Duration {
        match self.auto_disconnect_after_idle_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => DEFAULT_IDLE_DELAY,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_TRANSPORT_TIMEOUT_SECS))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(
            self.shutdown_timeout_secs
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        )
    }
}

/// Credentials for the upstream relay.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticationConfig {
    pub username: String,
    #[serde(default)]
    pub password: Option<SecretString>,
    /// Read at startup; takes precedence over `password`.
    #[serde(default)]
    pub password_file: Option<PathBuf>,
}

impl AuthenticationConfig {
    /// Resolve the password, reading `password_file` if configured.
    pub fn resolve_password(&self) -> Result<SecretString, ConfigError> {
        if let Some(path) = &self.password_file {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                ConfigError::invalid(
                    "forwarder.authentication.password_file",
                    format!("{}: {e}", path.display()),
                )
            })?;
            let password = raw.trim_end_matches(['\r', '\n']).to_string();
            return Ok(SecretString::from(password));
        }
        self.password
            .clone()
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "forwarder.authentication.password".into(),
                hint: "Set password, password_file or RELAY_SMTP_PASSWORD.".into(),
            })
    }
}

/// Messages matching any of these are silently discarded.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VoidConfig {
    #[serde(default)]
    pub matchers: Vec<MatcherConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatcherConfig {
    pub regex: String,
    #[serde(default)]
    pub regex_on_field: MessageFields,
}

/// Subject rewriting through the LLM.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmEnrichmentConfig {
    /// Overrides the built-in prompt for every rule without its own.
    #[serde(default)]
    pub user_prompt: Option<String>,
    #[serde(default)]
    pub rules: Vec<SubjectRuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubjectRuleConfig {
    pub regex: String,
    #[serde(default)]
    pub regex_on_field: MessageFields,
    #[serde(default)]
    pub subject_prefix: Option<String>,
    #[serde(default)]
    pub user_prompt: Option<String>,
}

/// Alertmanager diversion.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertmanagerConfig {
    pub base_url: String,
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub message_rules: Vec<AlertRuleConfig>,
}

impl AlertmanagerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertRuleConfig {
    #[serde(default)]
    pub alert_name: Option<String>,
    #[serde(default)]
    pub generator_url: Option<String>,
    #[serde(default)]
    pub regex_on_field: MessageFields,
    /// Empty or absent makes the rule a catch-all.
    #[serde(default)]
    pub alert_regex: Option<String>,
    #[serde(default)]
    pub resolution_regex: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub resolution_timeout_secs: Option<u64>,
    #[serde(default)]
    pub evaluate_other_rules: bool,
    #[serde(default)]
    pub run_llm_on_body: bool,
    #[serde(default)]
    pub user_prompt: Option<String>,
}

/// OpenAI-compatible chat completion backend.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<SecretString>,
    /// Needed for servers without a llama.cpp style `/health` endpoint.
    #[serde(default)]
    pub disable_health_check: bool,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub subject_helper: ChatSettings,
    #[serde(default)]
    pub alert_summarizer: ChatSettings,
}

impl LlmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS))
    }
}

/// Per-helper completion parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatSettings {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Message stored once at startup, after catch-up.
#[derive(Debug, Clone, Deserialize)]
pub struct StartupNotificationConfig {
    #[serde(default)]
    pub from: Option<String>,
    pub to: String,
    pub subject: String,
    #[serde(default)]
    pub body: Option<String>,
}

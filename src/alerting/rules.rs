//! Mapping of a message onto an alert.
//!
//! Rules are evaluated in order. A rule without a pattern is a catch-all.
//! A rule whose resolution pattern matches resolves the alert right away;
//! otherwise a match of the main pattern fires it, with an expiry when the
//! rule has both a resolution pattern and a timeout. A matching rule stops
//! evaluation unless it asks for the next rules to be evaluated too.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::info;

use super::Alert;
use crate::config::{AlertRuleConfig, AlertmanagerConfig};
use crate::error::ConfigError;
use crate::pipeline::message::MailMessage;
use crate::pipeline::rules::{MessageFields, compile_pattern};

const DEFAULT_NAME_PREFIX: &str = "localsmtprelay-alert-";

#[derive(Debug, Clone)]
struct AlertRule {
    fields: MessageFields,
    /// `None` for a catch-all rule.
    alert: Option<Regex>,
    resolution: Option<Regex>,
    resolution_timeout: Option<Duration>,
    alert_name: Option<String>,
    generator_url: Option<String>,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    evaluate_other_rules: bool,
    run_llm_on_body: bool,
    user_prompt: Option<String>,
}

impl AlertRule {
    fn from_config(i: usize, config: &AlertRuleConfig) -> Result<Self, ConfigError> {
        let key = |field: &str| format!("alertmanager.message_rules[{i}].{field}");
        let non_empty = |s: &Option<String>| s.clone().filter(|s| !s.is_empty());

        let alert = non_empty(&config.alert_regex)
            .map(|p| compile_pattern(&key("alert_regex"), &p))
            .transpose()?;
        let resolution = non_empty(&config.resolution_regex)
            .map(|p| compile_pattern(&key("resolution_regex"), &p))
            .transpose()?;

        Ok(Self {
            fields: config.regex_on_field,
            alert,
            resolution,
            resolution_timeout: config
                .resolution_timeout_secs
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
            alert_name: non_empty(&config.alert_name),
            generator_url: config.generator_url.clone(),
            labels: config.labels.clone(),
            annotations: config.annotations.clone(),
            evaluate_other_rules: config.evaluate_other_rules,
            run_llm_on_body: config.run_llm_on_body,
            user_prompt: non_empty(&config.user_prompt),
        })
    }
}

/// Result of rule evaluation, before defaults are filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertDraft {
    pub alert: Alert,
    /// A matching rule asked for the body to be summarized.
    pub run_llm: bool,
    /// Prompt template of the last matching rule that set one.
    pub prompt: Option<String>,
}

impl AlertDraft {
    fn apply(&mut self, rule: &AlertRule) {
        self.run_llm |= rule.run_llm_on_body;
        if rule.user_prompt.is_some() {
            self.prompt.clone_from(&rule.user_prompt);
        }
        if let Some(name) = &rule.alert_name {
            self.alert.set_name(name.clone());
        }
        if rule.generator_url.is_some() {
            self.alert.generator_url.clone_from(&rule.generator_url);
        }
        self.alert.labels.extend(rule.labels.clone());
        self.alert.annotations.extend(rule.annotations.clone());
    }

    /// Fill in what no rule set. `description` is the text body, or the
    /// summary when one was produced.
    pub fn finish(self, message: &MailMessage, summary: Option<String>) -> Alert {
        let mut alert = self.alert;
        let subject = message.subject();

        if alert.name().is_none() {
            alert.set_name(default_alert_name(subject));
        }
        alert
            .annotations
            .entry("summary".to_string())
            .or_insert_with(|| subject.to_string());
        if !alert.annotations.contains_key("description") {
            match (summary, message.text_body()) {
                (Some(summary), _) => {
                    alert
                        .annotations
                        .insert("description".to_string(), summary);
                    alert
                        .annotations
                        .insert("llm-enabled".to_string(), "1".to_string());
                }
                (None, Some(body)) => {
                    alert
                        .annotations
                        .insert("description".to_string(), body.to_string());
                }
                (None, None) => {
                    info!(
                        subject = %subject,
                        "Message has no text body, consider a default description annotation"
                    );
                }
            }
        }
        alert.labels.insert(
            super::FORWARDED_BY_LABEL.to_string(),
            super::FORWARDED_BY_VALUE.to_string(),
        );
        alert
    }

    /// Whether a summary would be used by [`finish`](Self::finish).
    pub fn wants_summary(&self) -> bool {
        self.run_llm && !self.alert.annotations.contains_key("description")
    }
}

/// `localsmtprelay-alert-` followed by the first 8 hex digits of the
/// subject's SHA-256, so the same subject always maps to the same alert.
pub fn default_alert_name(subject: &str) -> String {
    let digest = Sha256::digest(subject.as_bytes());
    format!("{DEFAULT_NAME_PREFIX}{}", hex::encode(&digest[..4]))
}

/// Ordered alert rules compiled from configuration.
#[derive(Debug, Clone, Default)]
pub struct AlertRules {
    rules: Vec<AlertRule>,
}

impl AlertRules {
    pub fn from_config(config: &AlertmanagerConfig) -> Result<Self, ConfigError> {
        let rules = config
            .message_rules
            .iter()
            .enumerate()
            .map(|(i, r)| AlertRule::from_config(i, r))
            .collect::<Result<_, _>>()?;
        Ok(Self { rules })
    }

    /// Evaluate the rules. `None` when no rule matched.
    pub fn evaluate(&self, message: &MailMessage) -> Option<AlertDraft> {
        let date = message.date().unwrap_or_else(Utc::now);
        let mut draft: Option<AlertDraft> = None;

        for rule in &self.rules {
            let Some(pattern) = &rule.alert else {
                draft.get_or_insert_with(empty_draft).apply(rule);
                if rule.evaluate_other_rules {
                    continue;
                }
                break;
            };

            let input = rule.fields.input(message);
            if rule.resolution.as_ref().is_some_and(|r| r.is_match(&input)) {
                let d = draft.get_or_insert_with(empty_draft);
                d.apply(rule);
                d.alert.set_ends_at(date);
            } else if pattern.is_match(&input) {
                let d = draft.get_or_insert_with(empty_draft);
                d.apply(rule);
                if rule.resolution.is_some()
                    && let Some(timeout) = rule.resolution_timeout
                {
                    d.alert.set_ends_at(expiry(date, timeout));
                }
            } else {
                continue;
            }

            if !rule.evaluate_other_rules {
                break;
            }
        }
        draft
    }
}

fn empty_draft() -> AlertDraft {
    AlertDraft {
        alert: Alert::default(),
        run_llm: false,
        prompt: None,
    }
}

fn expiry(date: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|t| date.checked_add_signed(t))
        .unwrap_or(date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::FORWARDED_BY_LABEL;

    fn message(subject: &str, body: &str) -> MailMessage {
        MailMessage::parse(
            format!(
                "From: nas@example.com\r\nTo: ops@example.com\r\nSubject: {subject}\r\n\
                 Date: Fri, 01 Mar 2024 08:00:00 +0000\r\n\r\n{body}\r\n"
            )
            .into_bytes(),
        )
    }

    fn rules(json: &str) -> AlertRules {
        let config: AlertmanagerConfig = serde_json::from_str(&format!(
            r#"{{ "base_url": "http://am:9093", "message_rules": {json} }}"#
        ))
        .unwrap();
        AlertRules::from_config(&config).unwrap()
    }

    #[test]
    fn no_matching_rule_means_no_alert() {
        let rules = rules(r#"[{ "alert_regex": "disk" }]"#);
        assert_eq!(rules.evaluate(&message("Backup ok", "fine")), None);
        assert_eq!(AlertRules::default().evaluate(&message("x", "y")), None);
    }

    #[test]
    fn catch_all_applies_and_stops() {
        let rules = rules(
            r#"[
                { "labels": { "severity": "info" } },
                { "alert_regex": ".*", "labels": { "severity": "critical" } }
            ]"#,
        );
        let draft = rules.evaluate(&message("Anything", "body")).unwrap();
        assert_eq!(draft.alert.labels["severity"], "info");
    }

    #[test]
    fn continue_accumulates_following_rules() {
        let rules = rules(
            r#"[
                { "labels": { "team": "infra" }, "evaluate_other_rules": true, "user_prompt": "first {body}" },
                { "alert_regex": "disk", "alert_name": "DiskFull", "run_llm_on_body": true },
                { "alert_regex": "disk", "alert_name": "Unreached" }
            ]"#,
        );
        let draft = rules.evaluate(&message("Disk full on nas", "95%")).unwrap();
        assert_eq!(draft.alert.labels["team"], "infra");
        assert_eq!(draft.alert.name(), Some("DiskFull"));
        assert!(draft.run_llm);
        assert_eq!(draft.prompt.as_deref(), Some("first {body}"));
    }

    #[test]
    fn resolution_pattern_resolves_at_message_date() {
        let rules = rules(
            r#"[{ "alert_regex": "UPS", "resolution_regex": "power restored", "resolution_timeout_secs": 600 }]"#,
        );
        let draft = rules
            .evaluate(&message("UPS event", "Power restored on line 1"))
            .unwrap();
        assert_eq!(draft.alert.ends_at.as_deref(), Some("2024-03-01T08:00:00Z"));
    }

    #[test]
    fn firing_alert_expires_after_resolution_timeout() {
        let rules = rules(
            r#"[{ "alert_regex": "UPS", "resolution_regex": "power restored", "resolution_timeout_secs": 600 }]"#,
        );
        let draft = rules
            .evaluate(&message("UPS event", "On battery"))
            .unwrap();
        assert_eq!(draft.alert.ends_at.as_deref(), Some("2024-03-01T08:10:00Z"));
    }

    #[test]
    fn timeout_without_resolution_pattern_never_expires() {
        let rules = rules(r#"[{ "alert_regex": "UPS", "resolution_timeout_secs": 600 }]"#);
        let draft = rules.evaluate(&message("UPS event", "On battery")).unwrap();
        assert_eq!(draft.alert.ends_at, None);
    }

    #[test]
    fn pattern_respects_selected_fields() {
        let rules = rules(r#"[{ "alert_regex": "critical", "regex_on_field": ["subject"] }]"#);
        assert!(rules.evaluate(&message("Report", "critical inside")).is_none());
        assert!(rules.evaluate(&message("CRITICAL report", "x")).is_some());
    }

    #[test]
    fn finish_fills_defaults() {
        let rules = rules(r#"[{ "alert_regex": "disk" }]"#);
        let message = message("Disk full", "Volume 1 at 95%");
        let alert = rules.evaluate(&message).unwrap().finish(&message, None);

        assert_eq!(alert.name(), Some(default_alert_name("Disk full").as_str()));
        assert_eq!(alert.annotations["summary"], "Disk full");
        assert!(alert.annotations["description"].starts_with("Volume 1 at 95%"));
        assert!(!alert.annotations.contains_key("llm-enabled"));
        assert_eq!(alert.labels[FORWARDED_BY_LABEL], "localsmtprelay");
    }

    #[test]
    fn finish_prefers_summary_and_flags_it() {
        let rules = rules(r#"[{ "alert_regex": "disk", "run_llm_on_body": true }]"#);
        let message = message("Disk full", "Volume 1 at 95%, please clean up");
        let draft = rules.evaluate(&message).unwrap();
        assert!(draft.wants_summary());

        let alert = draft.finish(&message, Some("Volume 1 nearly full".into()));
        assert_eq!(alert.annotations["description"], "Volume 1 nearly full");
        assert_eq!(alert.annotations["llm-enabled"], "1");
    }

    #[test]
    fn configured_annotations_win_over_defaults() {
        let rules = rules(
            r#"[{ "alert_regex": "disk", "run_llm_on_body": true,
                  "annotations": { "summary": "Storage", "description": "See NAS UI" } }]"#,
        );
        let message = message("Disk full", "Volume 1 at 95%");
        let draft = rules.evaluate(&message).unwrap();
        assert!(!draft.wants_summary());

        let alert = draft.finish(&message, None);
        assert_eq!(alert.annotations["summary"], "Storage");
        assert_eq!(alert.annotations["description"], "See NAS UI");
    }

    #[test]
    fn default_name_is_stable_and_short() {
        let name = default_alert_name("Disk full");
        assert_eq!(name, default_alert_name("Disk full"));
        assert_ne!(name, default_alert_name("Disk empty"));
        assert_eq!(name.len(), DEFAULT_NAME_PREFIX.len() + 8);
    }

    #[test]
    fn invalid_pattern_names_the_rule() {
        let config: AlertmanagerConfig = serde_json::from_str(
            r#"{ "base_url": "http://am", "message_rules": [{}, { "resolution_regex": "(" }] }"#,
        )
        .unwrap();
        let err = AlertRules::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("message_rules[1].resolution_regex"));
    }
}

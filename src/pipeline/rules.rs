//! Regex rules evaluated against a message's subject and body.
//!
//! Patterns are compiled once, when the pipeline is built, so an invalid
//! pattern is a configuration error rather than a per-message surprise.
//! Matching is case-insensitive and `.` matches newlines. The regex engine
//! runs in linear time and compiled programs are size-limited, which bounds
//! the cost of every evaluation.

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use tracing::debug;

use crate::config::{LlmEnrichmentConfig, VoidConfig};
use crate::error::ConfigError;
use crate::pipeline::message::MailMessage;

const REGEX_SIZE_LIMIT: usize = 1 << 20;
const REGEX_DFA_SIZE_LIMIT: usize = 2 << 20;

/// A field a rule can look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageField {
    Subject,
    Body,
}

/// Which fields a rule's pattern runs against. Both by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "Vec<MessageField>")]
pub struct MessageFields {
    pub subject: bool,
    pub body: bool,
}

impl Default for MessageFields {
    fn default() -> Self {
        Self {
            subject: true,
            body: true,
        }
    }
}

impl From<Vec<MessageField>> for MessageFields {
    fn from(fields: Vec<MessageField>) -> Self {
        Self {
            subject: fields.contains(&MessageField::Subject),
            body: fields.contains(&MessageField::Body),
        }
    }
}

impl MessageFields {
    /// Text a pattern is matched against: the subject, then `"\r\n"` and
    /// the text body.
    pub fn input(&self, message: &MailMessage) -> String {
        let mut input = String::new();
        if self.subject {
            input.push_str(message.subject());
        }
        if self.body {
            input.push_str("\r\n");
            input.push_str(message.text_body().unwrap_or_default());
        }
        input
    }
}

/// Compile a user-supplied pattern with the relay's matching options.
pub fn compile_pattern(key: &str, pattern: &str) -> Result<Regex, ConfigError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .size_limit(REGEX_SIZE_LIMIT)
        .dfa_size_limit(REGEX_DFA_SIZE_LIMIT)
        .build()
        .map_err(|e| ConfigError::invalid(key, e))
}

/// A compiled pattern bound to the fields it inspects.
#[derive(Debug, Clone)]
pub struct FieldMatcher {
    regex: Regex,
    fields: MessageFields,
}

impl FieldMatcher {
    pub fn new(key: &str, pattern: &str, fields: MessageFields) -> Result<Self, ConfigError> {
        Ok(Self {
            regex: compile_pattern(key, pattern)?,
            fields,
        })
    }

    pub fn is_match(&self, message: &MailMessage) -> bool {
        self.regex.is_match(&self.fields.input(message))
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }
}

/// Discards messages nobody wants to receive.
#[derive(Debug, Clone, Default)]
pub struct VoidFilter {
    matchers: Vec<FieldMatcher>,
}

impl VoidFilter {
    pub fn from_config(config: &VoidConfig) -> Result<Self, ConfigError> {
        let matchers = config
            .matchers
            .iter()
            .enumerate()
            .map(|(i, m)| {
                FieldMatcher::new(
                    &format!("forwarder.void.matchers[{i}].regex"),
                    &m.regex,
                    m.regex_on_field,
                )
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { matchers })
    }

    /// `true` when any matcher hits. Depends only on the message.
    pub fn matches(&self, message: &MailMessage) -> bool {
        match self.matchers.iter().find(|m| m.is_match(message)) {
            Some(matcher) => {
                debug!(pattern = %matcher.pattern(), subject = %message.subject(), "Void matcher hit");
                true
            }
            None => false,
        }
    }
}

/// A subject rewrite rule.
#[derive(Debug, Clone)]
pub struct SubjectRule {
    pub matcher: FieldMatcher,
    pub prefix: Option<String>,
    pub user_prompt: Option<String>,
}

/// Ordered subject rewrite rules; the first match wins.
#[derive(Debug, Clone, Default)]
pub struct SubjectRules {
    rules: Vec<SubjectRule>,
    default_prompt: Option<String>,
}

impl SubjectRules {
    pub fn from_config(config: &LlmEnrichmentConfig) -> Result<Self, ConfigError> {
        let rules = config
            .rules
            .iter()
            .enumerate()
            .map(|(i, r)| {
                Ok(SubjectRule {
                    matcher: FieldMatcher::new(
                        &format!("forwarder.llm_enrichment.rules[{i}].regex"),
                        &r.regex,
                        r.regex_on_field,
                    )?,
                    prefix: r.subject_prefix.clone().filter(|p| !p.is_empty()),
                    user_prompt: r.user_prompt.clone().filter(|p| !p.is_empty()),
                })
            })
            .collect::<Result<_, ConfigError>>()?;
        Ok(Self {
            rules,
            default_prompt: config.user_prompt.clone().filter(|p| !p.is_empty()),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn first_match(&self, message: &MailMessage) -> Option<&SubjectRule> {
        self.rules.iter().find(|r| r.matcher.is_match(message))
    }

    /// Prompt template for a rule: its own, else the shared one.
    pub fn prompt_for<'a>(&'a self, rule: &'a SubjectRule) -> Option<&'a str> {
        rule.user_prompt
            .as_deref()
            .or(self.default_prompt.as_deref())
    }
}

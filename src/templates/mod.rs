//! Message kinds and template rendering.
//!
//! A task's payload names its message kind in a `kind` field. Each kind is a
//! variant of [`MessageKind`] carrying exactly the data its template needs
//! and rendering its own template parameters, so a payload either resolves
//! to a complete message or fails with a [`TemplateError`] before anything is
//! sent.
//!
//! # Payload shape
//!
//! ```json
//! {
//!   "kind": "check_in_reminder",
//!   "check_in_date": "2026-10-19",
//!   "remind_at": "20:00:00",
//!   "deadline": "22:00:00",
//!   "signature": "SafeCheck",
//!   "template_id": "SMS_100001"
//! }
//! ```
//!
//! `signature` and `template_id` are optional overrides. When absent they
//! come from [`TemplateConfig`], keyed by message kind.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::JourneyId;

/// Errors from resolving a payload into a sendable message.
///
/// These are configuration or data defects; retrying cannot fix them.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The payload matches no known message kind.
    #[error("payload is not a valid message: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// No signature in the payload or the configuration.
    #[error("no SMS signature configured for {kind}")]
    MissingSignature { kind: &'static str },

    /// No template id in the payload or the configuration.
    #[error("no template configured for {kind}")]
    MissingTemplate { kind: &'static str },

    /// A required template parameter rendered empty.
    #[error("template parameter {param} is empty for {kind}")]
    EmptyParameter {
        kind: &'static str,
        param: &'static str,
    },
}

/// Result type for template operations.
pub type Result<T> = std::result::Result<T, TemplateError>;

/// The closed set of notifications the pipeline can send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageKind {
    /// The user has not checked in yet today.
    CheckInReminder {
        check_in_date: NaiveDate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remind_at: Option<String>,
        deadline: String,
    },
    /// The user missed today's check-in deadline.
    CheckInTimeout {
        check_in_date: NaiveDate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline: Option<String>,
    },
    /// A journey passed its expected return time.
    JourneyTimeout {
        journey_id: JourneyId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        journey_title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_return: Option<String>,
    },
}

impl MessageKind {
    /// The `kind` tag of this variant.
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::CheckInReminder { .. } => "check_in_reminder",
            MessageKind::CheckInTimeout { .. } => "check_in_timeout",
            MessageKind::JourneyTimeout { .. } => "journey_timeout",
        }
    }

    /// Renders the template parameters for a user called `nickname`.
    pub fn render(&self, nickname: &str) -> Result<BTreeMap<String, String>> {
        let kind = self.name();
        let mut params = Params::new(kind);
        params.required("name", nickname)?;

        match self {
            MessageKind::CheckInReminder {
                check_in_date,
                remind_at,
                deadline,
            } => {
                params.required("date", &check_in_date.to_string())?;
                params.required("deadline", deadline)?;
                params.optional("remind_at", remind_at.as_deref());
            }
            MessageKind::CheckInTimeout {
                check_in_date,
                deadline,
            } => {
                params.required("date", &check_in_date.to_string())?;
                params.optional("deadline", deadline.as_deref());
            }
            MessageKind::JourneyTimeout {
                journey_title,
                expected_return,
                ..
            } => {
                let title = journey_title
                    .as_deref()
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or("your journey");
                params.required("journey", title)?;
                params.optional("expected_return", expected_return.as_deref());
            }
        }

        Ok(params.finish())
    }

    /// Builds the task payload for this message.
    pub fn to_payload(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

struct Params {
    kind: &'static str,
    values: BTreeMap<String, String>,
}

impl Params {
    fn new(kind: &'static str) -> Self {
        Params {
            kind,
            values: BTreeMap::new(),
        }
    }

    fn required(&mut self, param: &'static str, value: &str) -> Result<()> {
        let value = value.trim();
        if value.is_empty() {
            return Err(TemplateError::EmptyParameter {
                kind: self.kind,
                param,
            });
        }
        self.values.insert(param.to_string(), value.to_string());
        Ok(())
    }

    fn optional(&mut self, param: &'static str, value: Option<&str>) {
        if let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) {
            self.values.insert(param.to_string(), value.to_string());
        }
    }

    fn finish(self) -> BTreeMap<String, String> {
        self.values
    }
}

/// Signature and template ids used when a payload does not carry its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateConfig {
    pub signature: Option<String>,
    pub check_in_reminder: Option<String>,
    pub check_in_timeout: Option<String>,
    pub journey_timeout: Option<String>,
}

impl TemplateConfig {
    /// The configured template id for `kind`.
    pub fn template_for(&self, kind: &MessageKind) -> Option<&str> {
        match kind {
            MessageKind::CheckInReminder { .. } => self.check_in_reminder.as_deref(),
            MessageKind::CheckInTimeout { .. } => self.check_in_timeout.as_deref(),
            MessageKind::JourneyTimeout { .. } => self.journey_timeout.as_deref(),
        }
    }
}

/// A payload resolved into everything the dispatcher needs except the
/// recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMessage {
    pub kind: MessageKind,
    pub signature: String,
    pub template_id: String,
    pub params: BTreeMap<String, String>,
}

fn override_field<'a>(payload: &'a Value, field: &str) -> Option<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Resolves a task payload for a user called `nickname`.
pub fn resolve(payload: &Value, nickname: &str, config: &TemplateConfig) -> Result<ResolvedMessage> {
    let kind: MessageKind = serde_json::from_value(payload.clone())?;
    let name = kind.name();

    let signature = override_field(payload, "signature")
        .or(config.signature.as_deref())
        .ok_or(TemplateError::MissingSignature { kind: name })?
        .to_string();
    let template_id = override_field(payload, "template_id")
        .or_else(|| config.template_for(&kind))
        .ok_or(TemplateError::MissingTemplate { kind: name })?
        .to_string();
    let params = kind.render(nickname)?;

    Ok(ResolvedMessage {
        kind,
        signature,
        template_id,
        params,
    })
}

//! Outbound dispatch error types.
//!
//! A provider answers every request with a status code; `OK` is success and
//! anything else is a failure. The distinction that matters to the task
//! engine is whether sending again could succeed:
//!
//! - **Permanent** failures are defects in the request itself (bad number,
//!   rejected signature or template, missing parameters, a blocked account).
//!   The same request will be rejected again.
//! - **Transient** failures are everything else: throttling, provider-side
//!   system errors, and transport errors where no status was returned.

use std::fmt;

use thiserror::Error;

use super::ProviderResponse;

/// Provider status codes that no retry can fix.
const PERMANENT_STATUS_CODES: &[&str] = &[
    "isv.MOBILE_NUMBER_ILLEGAL",
    "isv.SMS_SIGNATURE_ILLEGAL",
    "isv.SMS_SIGN_ILLEGAL",
    "isv.SMS_TEMPLATE_ILLEGAL",
    "isv.INVALID_PARAMETERS",
    "isv.TEMPLATE_MISSING_PARAMETERS",
    "isv.PARAM_LENGTH_LIMIT",
    "isv.INVALID_JSON_PARAM",
    "isv.BLACK_KEY_CONTROL_LIMIT",
    "isv.DENY_IP_RANGE",
    "isv.ACCOUNT_NOT_EXISTS",
    "isv.ACCOUNT_ABNORMAL",
];

/// The kind of dispatch failure, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchErrorKind {
    /// Sending again later may succeed.
    Transient,
    /// The provider will reject this request every time.
    Permanent,
}

impl DispatchErrorKind {
    /// Returns true if this error is retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(self, DispatchErrorKind::Transient)
    }
}

/// Classifies a provider status code.
///
/// Unknown codes are transient: an unrecognized failure is retried rather
/// than silently dropped.
pub fn classify_status_code(code: &str) -> DispatchErrorKind {
    if PERMANENT_STATUS_CODES.contains(&code) {
        DispatchErrorKind::Permanent
    } else {
        DispatchErrorKind::Transient
    }
}

/// The request never produced a provider response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport error: {message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        TransportError {
            message: message.into(),
        }
    }
}

/// A failed dispatch with categorization for retry decisions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct DispatchError {
    pub kind: DispatchErrorKind,
    /// The provider status code, if the provider answered.
    pub status_code: Option<String>,
    pub message: String,
    /// The provider's request id, for support tickets.
    pub request_id: Option<String>,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status_code {
            Some(code) => write!(f, "dispatch failed ({}): {}", code, self.message),
            None => write!(f, "dispatch failed: {}", self.message),
        }
    }
}

impl DispatchError {
    /// Builds an error from a non-`OK` provider response.
    pub fn from_response(response: &ProviderResponse) -> Self {
        DispatchError {
            kind: classify_status_code(&response.status_code),
            status_code: Some(response.status_code.clone()),
            message: response.message.clone(),
            request_id: response.request_id.clone(),
        }
    }

    /// Builds an error from a transport failure.
    pub fn from_transport(err: TransportError) -> Self {
        DispatchError {
            kind: DispatchErrorKind::Transient,
            status_code: None,
            message: err.message,
            request_id: None,
        }
    }

    /// Returns true if this error is retriable.
    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }

    /// The code recorded on the failed task.
    pub fn failure_code(&self) -> &str {
        self.status_code.as_deref().unwrap_or("transport_error")
    }
}

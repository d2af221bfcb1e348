//! Outbound SMS dispatch.
//!
//! The [`Dispatcher`] trait is the seam between the task engine and an SMS
//! provider. Implementations perform the actual send; the task engine owns
//! retry decisions, using [`DispatchError`] to classify failures.
//!
//! Implementations:
//! - [`DryRunDispatcher`]: logs the request and reports success

pub mod dry_run;
pub mod error;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::types::Channel;

pub use dry_run::DryRunDispatcher;
pub use error::{DispatchError, DispatchErrorKind, TransportError, classify_status_code};

/// The provider status code for an accepted request.
pub const STATUS_OK: &str = "OK";

/// One message to send.
#[derive(Clone, PartialEq, Eq)]
pub struct OutboundSms {
    pub channel: Channel,
    /// Plaintext recipient number.
    pub phone: String,
    pub signature: String,
    pub template_id: String,
    pub template_params: BTreeMap<String, String>,
}

impl fmt::Debug for OutboundSms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundSms")
            .field("channel", &self.channel)
            .field("phone", &"<redacted>")
            .field("signature", &self.signature)
            .field("template_id", &self.template_id)
            .field("template_params", &self.template_params)
            .finish()
    }
}

/// What the provider answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResponse {
    /// The provider's id for the sent message (present on success).
    pub message_id: Option<String>,
    pub status_code: String,
    pub message: String,
    pub request_id: Option<String>,
}

impl ProviderResponse {
    /// Returns true if the provider accepted the message.
    pub fn is_success(&self) -> bool {
        self.status_code == STATUS_OK
    }

    /// Converts a non-`OK` response into an error.
    pub fn into_result(self) -> Result<ProviderResponse, DispatchError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(DispatchError::from_response(&self))
        }
    }
}

/// Sends messages through a provider.
///
/// A returned `Ok` only means the provider answered; callers must still
/// check [`ProviderResponse::is_success`].
///
/// # Example
///
/// ```ignore
/// struct FixedDispatcher;
///
/// impl Dispatcher for FixedDispatcher {
///     fn provider(&self) -> &str {
///         "fixed"
///     }
///
///     async fn send(&self, _sms: &OutboundSms) -> Result<ProviderResponse, TransportError> {
///         Ok(ProviderResponse {
///             message_id: Some("m-1".into()),
///             status_code: STATUS_OK.into(),
///             message: "OK".into(),
///             request_id: None,
///         })
///     }
/// }
/// ```
pub trait Dispatcher: Send + Sync {
    /// A short provider name for telemetry.
    fn provider(&self) -> &str;

    /// Sends one message.
    fn send(
        &self,
        sms: &OutboundSms,
    ) -> impl Future<Output = Result<ProviderResponse, TransportError>> + Send;
}

impl<T: Dispatcher> Dispatcher for Arc<T> {
    fn provider(&self) -> &str {
        (**self).provider()
    }

    fn send(
        &self,
        sms: &OutboundSms,
    ) -> impl Future<Output = Result<ProviderResponse, TransportError>> + Send {
        (**self).send(sms)
    }
}

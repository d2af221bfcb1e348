//! A dispatcher that logs instead of sending.

use std::future::Future;

use tracing::info;
use uuid::Uuid;

use super::{Dispatcher, OutboundSms, ProviderResponse, STATUS_OK, TransportError};
use crate::contacts::phone_hash;

/// Logs each message and answers `OK` with a random message id.
///
/// Used when no provider credentials are configured, so the rest of the
/// pipeline (ledger, task states) runs exactly as in production.
#[derive(Debug, Default, Clone)]
pub struct DryRunDispatcher;

impl DryRunDispatcher {
    pub fn new() -> Self {
        DryRunDispatcher
    }
}

impl Dispatcher for DryRunDispatcher {
    fn provider(&self) -> &str {
        "dry-run"
    }

    fn send(
        &self,
        sms: &OutboundSms,
    ) -> impl Future<Output = Result<ProviderResponse, TransportError>> + Send {
        info!(
            channel = %sms.channel,
            phone_hash = %phone_hash(&sms.phone),
            signature = %sms.signature,
            template_id = %sms.template_id,
            params = ?sms.template_params,
            "dry run: message logged (not sent)"
        );
        let response = ProviderResponse {
            message_id: Some(Uuid::new_v4().to_string()),
            status_code: STATUS_OK.to_string(),
            message: "OK".to_string(),
            request_id: None,
        };
        async move { Ok(response) }
    }
}

//! Delivery telemetry and settlement alerts.

use std::time::Duration;

use tracing::{error, info};

use crate::types::{Channel, TaskCode, UserId};

use super::SettlementStage;

/// One successfully delivered and settled notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub task_code: TaskCode,
    pub user_id: UserId,
    pub channel: Channel,
    /// The message kind tag, e.g. `check_in_reminder`.
    pub kind: &'static str,
    pub template_id: String,
    pub provider: String,
    pub provider_message_id: Option<String>,
    pub cost_cents: i64,
    /// Wall time from claim to settlement.
    pub duration: Duration,
}

/// A message was sent but the ledger and task could not be settled.
///
/// Money state and delivery state disagree until an operator intervenes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementAlert {
    pub task_code: TaskCode,
    pub user_id: UserId,
    pub channel: Channel,
    pub stage: SettlementStage,
    pub detail: String,
}

/// Receives delivery telemetry.
pub trait DeliveryObserver: Send + Sync {
    /// Called once per settled delivery.
    fn report(&self, report: &DeliveryReport);

    /// Called when settlement failed after a send. Must reach an operator.
    fn alert(&self, alert: &SettlementAlert);
}

/// Emits telemetry as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl DeliveryObserver for TracingObserver {
    fn report(&self, report: &DeliveryReport) {
        info!(
            task = %report.task_code,
            user = %report.user_id,
            channel = %report.channel,
            kind = report.kind,
            template_id = %report.template_id,
            provider = %report.provider,
            provider_message_id = ?report.provider_message_id,
            cost_cents = report.cost_cents,
            duration_ms = report.duration.as_millis() as u64,
            "notification delivered"
        );
    }

    fn alert(&self, alert: &SettlementAlert) {
        error!(
            task = %alert.task_code,
            user = %alert.user_id,
            channel = %alert.channel,
            stage = ?alert.stage,
            detail = %alert.detail,
            "SETTLEMENT INCONSISTENCY: message sent but settlement failed; manual reconciliation required"
        );
    }
}

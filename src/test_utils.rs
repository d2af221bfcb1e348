//! Shared test fixtures: scripted collaborators, seeded stores and
//! arbitrary generators for property-based testing.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};
use proptest::prelude::*;

use crate::contacts::PhoneCipher;
use crate::delivery::{
    DeliveryObserver, DeliveryReport, EngineConfig, SettlementAlert, TaskEngine,
};
use crate::dispatch::{Dispatcher, OutboundSms, ProviderResponse, STATUS_OK, TransportError};
use crate::ledger::QuotaLedger;
use crate::messages::QueueMessage;
use crate::store::{SqliteStore, users};
use crate::templates::{MessageKind, TemplateConfig};
use crate::types::{
    Channel, GrantReason, NewTask, SettingsSnapshot, TaskCategory, TaskCode, UserContact, UserId,
    UserSettingsCacheEntry,
};
use crate::worker::{PublishError, Publisher};

pub const TEST_KEY: [u8; 32] = [7; 32];

pub fn test_cipher() -> PhoneCipher {
    PhoneCipher::new(&TEST_KEY).unwrap()
}

pub fn test_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
}

pub fn test_templates() -> TemplateConfig {
    TemplateConfig {
        signature: Some("SafeCheck".to_string()),
        check_in_reminder: Some("SMS_REMIND".to_string()),
        check_in_timeout: Some("SMS_TIMEOUT".to_string()),
        journey_timeout: Some("SMS_JOURNEY".to_string()),
    }
}

pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        templates: test_templates(),
        ..EngineConfig::default()
    }
}

/// Inserts a user whose phone number is encrypted with [`TEST_KEY`].
pub fn seed_user(store: &SqliteStore, user_id: UserId, nickname: &str, phone: &str) {
    let contact = UserContact {
        user_id,
        nickname: nickname.to_string(),
        phone_cipher: test_cipher().encrypt(phone).unwrap(),
    };
    store
        .write(|tx| users::upsert(tx, &contact))
        .unwrap();
}

/// Grants `amount` to an account.
pub fn fund(store: &SqliteStore, user_id: UserId, channel: Channel, amount: i64) {
    QuotaLedger::new(store.clone())
        .grant(user_id, channel, amount, GrantReason::Recharge)
        .unwrap();
}

pub fn reminder_kind() -> MessageKind {
    MessageKind::CheckInReminder {
        check_in_date: test_date(),
        remind_at: Some("20:00:00".to_string()),
        deadline: "22:00:00".to_string(),
    }
}

/// A pending SMS check-in reminder task for `user_id`.
pub fn reminder_task(user_id: UserId) -> NewTask {
    NewTask {
        task_code: TaskCode::check_in_reminder(test_date(), user_id),
        user_id,
        category: TaskCategory::CheckInReminder,
        channel: Channel::Sms,
        payload: reminder_kind().to_payload().unwrap(),
        scheduled_at: Utc::now(),
    }
}

pub fn settings_entry(remind_at: &str, updated_at: i64) -> UserSettingsCacheEntry {
    UserSettingsCacheEntry {
        daily_check_in_enabled: true,
        remind_at: remind_at.to_string(),
        deadline: "22:00:00".to_string(),
        grace_until: "23:00:00".to_string(),
        timezone: "+08:00".to_string(),
        updated_at,
    }
}

pub fn snapshot(remind_at: &str) -> SettingsSnapshot {
    SettingsSnapshot {
        remind_at: remind_at.to_string(),
        deadline: "22:00:00".to_string(),
        grace_until: "23:00:00".to_string(),
        timezone: "+08:00".to_string(),
    }
}

pub fn ok_response() -> ProviderResponse {
    ProviderResponse {
        message_id: Some("provider-msg-1".to_string()),
        status_code: STATUS_OK.to_string(),
        message: "OK".to_string(),
        request_id: Some("req-1".to_string()),
    }
}

pub fn error_response(code: &str) -> ProviderResponse {
    ProviderResponse {
        message_id: None,
        status_code: code.to_string(),
        message: format!("provider said {}", code),
        request_id: Some("req-1".to_string()),
    }
}

/// A dispatcher that answers from a script and records every send.
///
/// Once the script is exhausted every send succeeds.
#[derive(Debug, Default)]
pub struct MockDispatcher {
    script: Mutex<VecDeque<Result<ProviderResponse, TransportError>>>,
    sent: Mutex<Vec<OutboundSms>>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: Result<ProviderResponse, TransportError>) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn sent(&self) -> Vec<OutboundSms> {
        self.sent.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Dispatcher for MockDispatcher {
    fn provider(&self) -> &str {
        "mock"
    }

    fn send(
        &self,
        sms: &OutboundSms,
    ) -> impl Future<Output = Result<ProviderResponse, TransportError>> + Send {
        self.sent.lock().unwrap().push(sms.clone());
        let response = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ok_response()));
        async move { response }
    }
}

/// Records reports and alerts.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    reports: Mutex<Vec<DeliveryReport>>,
    alerts: Mutex<Vec<SettlementAlert>>,
}

impl RecordingObserver {
    pub fn reports(&self) -> Vec<DeliveryReport> {
        self.reports.lock().unwrap().clone()
    }

    pub fn alerts(&self) -> Vec<SettlementAlert> {
        self.alerts.lock().unwrap().clone()
    }
}

impl DeliveryObserver for RecordingObserver {
    fn report(&self, report: &DeliveryReport) {
        self.reports.lock().unwrap().push(report.clone());
    }

    fn alert(&self, alert: &SettlementAlert) {
        self.alerts.lock().unwrap().push(alert.clone());
    }
}

/// Records published messages.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<QueueMessage>>,
}

impl RecordingPublisher {
    pub fn published(&self) -> Vec<QueueMessage> {
        self.published.lock().unwrap().clone()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(
        &self,
        message: &QueueMessage,
    ) -> impl Future<Output = Result<(), PublishError>> + Send {
        self.published.lock().unwrap().push(message.clone());
        async { Ok(()) }
    }
}

/// An engine over an in-memory store with scripted collaborators.
pub struct EngineHarness {
    pub store: SqliteStore,
    pub ledger: QuotaLedger,
    pub dispatcher: Arc<MockDispatcher>,
    pub observer: Arc<RecordingObserver>,
    pub engine: TaskEngine<Arc<MockDispatcher>>,
}

impl EngineHarness {
    pub fn new() -> Self {
        Self::with_config(test_engine_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = SqliteStore::open_in_memory().unwrap();
        let dispatcher = Arc::new(MockDispatcher::new());
        let observer = Arc::new(RecordingObserver::default());
        let engine = TaskEngine::new(
            store.clone(),
            Arc::clone(&dispatcher),
            test_cipher(),
            config,
            observer.clone(),
        );
        EngineHarness {
            ledger: QuotaLedger::new(store.clone()),
            store,
            dispatcher,
            observer,
            engine,
        }
    }

    pub fn balance(&self, user_id: UserId) -> i64 {
        self.ledger.balance(user_id, Channel::Sms).unwrap()
    }

    pub fn entry_count(&self, user_id: UserId) -> usize {
        self.ledger.history(user_id, Channel::Sms).unwrap().len()
    }
}

pub fn arb_user_id() -> impl Strategy<Value = UserId> {
    (1i64..50).prop_map(UserId)
}

pub fn arb_clock_time() -> impl Strategy<Value = String> {
    (0u32..24, prop_oneof![Just(0u32), Just(30u32)])
        .prop_map(|(h, m)| format!("{:02}:{:02}:00", h, m))
}

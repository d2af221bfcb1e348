//! End-to-end tests for the worker: queue bodies in, verdicts and side
//! effects out.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::cache::{KvCache, MemoryCache, SettingsCache};
use crate::delivery::{DeliveryObserver, TaskEngine};
use crate::ledger::QuotaLedger;
use crate::messages::QueueMessage;
use crate::store::SqliteStore;
use crate::test_utils::*;
use crate::types::{Channel, TaskCode, TaskStatus, UserId};

use super::*;

const SCHEDULED_AT: &str = "2026-10-19T12:00:00Z";
const SCHEDULED_TS: i64 = 1_792_411_200;

type TestWorker = NotificationWorker<MemoryCache, Arc<MockDispatcher>, Arc<RecordingPublisher>>;

struct Harness {
    store: SqliteStore,
    cache: Arc<MemoryCache>,
    dispatcher: Arc<MockDispatcher>,
    observer: Arc<RecordingObserver>,
    publisher: Arc<RecordingPublisher>,
    worker: TestWorker,
}

impl Harness {
    fn new() -> Self {
        let store = SqliteStore::open_in_memory().unwrap();
        let cache = Arc::new(MemoryCache::new());
        let dispatcher = Arc::new(MockDispatcher::new());
        let observer = Arc::new(RecordingObserver::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let engine = TaskEngine::new(
            store.clone(),
            Arc::clone(&dispatcher),
            test_cipher(),
            test_engine_config(),
            Arc::clone(&observer) as Arc<dyn DeliveryObserver>,
        );
        let worker = NotificationWorker::new(
            engine,
            Arc::clone(&cache),
            Arc::clone(&publisher),
            WorkerConfig::default(),
        );
        Harness {
            store,
            cache,
            dispatcher,
            observer,
            publisher,
            worker,
        }
    }

    /// Seeds a user with an SMS balance.
    fn user(&self, id: i64, balance: i64) -> UserId {
        let user = UserId(id);
        seed_user(&self.store, user, &format!("user{id}"), &format!("+86138000000{id:02}"));
        if balance > 0 {
            fund(&self.store, user, Channel::Sms, balance);
        }
        user
    }

    fn balance(&self, user: UserId) -> i64 {
        QuotaLedger::new(self.store.clone())
            .balance(user, Channel::Sms)
            .unwrap()
    }

    async fn handle(&self, body: &Value) -> Verdict {
        self.worker.handle(body.to_string().as_bytes(), 1).await
    }
}

fn journey_message(message_id: &str, journey: i64, user: i64) -> Value {
    json!({
        "type": "journey_timeout",
        "message_id": message_id,
        "scheduled_at": SCHEDULED_AT,
        "journey_id": journey,
        "user_id": user,
        "journey_title": "Hike"
    })
}

mod admission {
    use super::*;

    #[tokio::test]
    async fn unparseable_message_is_skipped() {
        let h = Harness::new();
        assert_eq!(h.worker.handle(b"{not json", 1).await, Verdict::Skip);
        assert_eq!(h.dispatcher.calls(), 0);
    }

    #[tokio::test]
    async fn completed_duplicate_is_acknowledged() {
        let h = Harness::new();
        let user = h.user(1, 50);

        assert_eq!(h.handle(&journey_message("m-1", 7, user.0)).await, Verdict::Ack);
        // Same message id, different journey: the marker alone stops it.
        assert_eq!(h.handle(&journey_message("m-1", 8, user.0)).await, Verdict::Ack);

        assert_eq!(h.dispatcher.calls(), 1);
        assert_eq!(h.balance(user), 45);
    }

    #[tokio::test]
    async fn in_flight_duplicate_is_retried() {
        let h = Harness::new();
        let user = h.user(1, 50);
        h.cache
            .set("idempotency:m-1", "processing", Duration::from_secs(60))
            .await
            .unwrap();

        let verdict = h.handle(&journey_message("m-1", 7, user.0)).await;

        assert_eq!(
            verdict,
            Verdict::Retry {
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(h.dispatcher.calls(), 0);
    }

    #[tokio::test]
    async fn retry_delay_grows_with_attempt() {
        let h = Harness::new();
        h.cache
            .set("idempotency:m-1", "processing", Duration::from_secs(60))
            .await
            .unwrap();
        let body = journey_message("m-1", 7, 1).to_string();

        let verdict = h.worker.handle(body.as_bytes(), 3).await;

        assert_eq!(
            verdict,
            Verdict::Retry {
                delay: Duration::from_secs(20)
            }
        );
    }
}

mod fan_out {
    use super::*;

    #[tokio::test]
    async fn journey_timeout_creates_and_delivers_task() {
        let h = Harness::new();
        let user = h.user(1, 50);

        let verdict = h.handle(&journey_message("m-1", 7, user.0)).await;

        assert_eq!(verdict, Verdict::Ack);
        let task = h
            .worker
            .engine()
            .task(&TaskCode::new("journey_timeout:7"))
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        let sent = h.dispatcher.sent();
        assert_eq!(sent[0].template_id, "SMS_JOURNEY");
        assert_eq!(sent[0].template_params["journey"], "Hike");
    }

    #[tokio::test]
    async fn transient_failure_releases_marker_for_redelivery() {
        let h = Harness::new();
        let user = h.user(1, 50);
        h.dispatcher.push(Ok(error_response("isp.SYSTEM_ERROR")));
        let body = journey_message("m-1", 7, user.0).to_string();

        let first = h.worker.handle(body.as_bytes(), 1).await;
        let second = h.worker.handle(body.as_bytes(), 2).await;

        assert!(matches!(first, Verdict::Retry { .. }));
        assert_eq!(second, Verdict::Ack);
        assert_eq!(h.dispatcher.calls(), 2);
        assert_eq!(h.balance(user), 45);
    }

    #[tokio::test]
    async fn locked_resource_is_retried() {
        let h = Harness::new();
        let user = h.user(1, 50);
        h.cache
            .set("lock:journey_timeout:7", "someone-else", Duration::from_secs(60))
            .await
            .unwrap();

        let verdict = h.handle(&journey_message("m-1", 7, user.0)).await;

        assert!(matches!(verdict, Verdict::Retry { .. }));
        assert_eq!(h.dispatcher.calls(), 0);
        assert!(
            h.worker
                .engine()
                .task(&TaskCode::new("journey_timeout:7"))
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn lock_is_released_after_delivery() {
        let h = Harness::new();
        let user = h.user(1, 50);

        h.handle(&journey_message("m-1", 7, user.0)).await;

        assert!(h.cache.get("lock:journey_timeout:7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn settlement_failure_is_fatal_and_acknowledged() {
        let h = Harness::new();
        let user = h.user(1, 50);
        h.store
            .execute_batch(
                "CREATE TRIGGER fail_confirm BEFORE INSERT ON quota_transactions
                 WHEN NEW.reason = 'confirm_deduct'
                 BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
            )
            .unwrap();

        let verdict = h.handle(&journey_message("m-1", 7, user.0)).await;
        let redelivery = h.handle(&journey_message("m-1", 7, user.0)).await;

        assert_eq!(verdict, Verdict::Fatal);
        assert!(verdict.acknowledges());
        assert_eq!(redelivery, Verdict::Ack);
        assert_eq!(h.dispatcher.calls(), 1);
        assert_eq!(h.observer.alerts().len(), 1);
    }

    #[tokio::test]
    async fn timeout_batch_acknowledges_business_failures() {
        let h = Harness::new();
        let funded = h.user(1, 50);
        let broke = h.user(2, 0);

        let verdict = h
            .handle(&json!({
                "type": "check_in_timeout",
                "message_id": "m-1",
                "batch_id": "b-1",
                "check_in_date": "2026-10-19",
                "scheduled_at": SCHEDULED_AT,
                "user_ids": [funded.0, broke.0, funded.0]
            }))
            .await;

        assert_eq!(verdict, Verdict::Ack);
        assert_eq!(h.dispatcher.calls(), 1);
        assert_eq!(h.dispatcher.sent()[0].template_id, "SMS_TIMEOUT");
        let failed = h
            .worker
            .engine()
            .task(&TaskCode::check_in_timeout(test_date(), broke))
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn notification_message_delivers_existing_task() {
        let h = Harness::new();
        let user = h.user(1, 50);
        let task = h.worker.engine().enqueue(&reminder_task(user)).unwrap();

        let verdict = h
            .handle(&json!({
                "type": "notification",
                "message_id": "m-1",
                "task_id": task.id,
                "task_code": task.task_code,
                "user_id": user.0,
                "category": "check_in_reminder",
                "channel": "sms",
                "contact_priority": 1
            }))
            .await;

        assert_eq!(verdict, Verdict::Ack);
        assert_eq!(h.dispatcher.sent()[0].template_id, "SMS_REMIND");
        assert_eq!(h.balance(user), 45);
    }

    #[tokio::test]
    async fn notification_for_unknown_task_is_skipped() {
        let h = Harness::new();

        let verdict = h
            .handle(&json!({
                "type": "notification",
                "message_id": "m-1",
                "task_id": 1,
                "task_code": "missing",
                "user_id": 1,
                "category": "check_in_reminder",
                "channel": "sms"
            }))
            .await;

        assert_eq!(verdict, Verdict::Skip);
    }
}

mod reminders {
    use super::*;

    #[tokio::test]
    async fn reconciled_batch_processes_skips_and_republishes() {
        let h = Harness::new();
        let unchanged = h.user(1, 50);
        let updated_later = h.user(2, 50);
        let moved = h.user(3, 50);
        let settings = SettingsCache::new(Arc::clone(&h.cache));
        let ttl = Duration::from_secs(3600);
        settings
            .put(
                updated_later,
                &settings_entry("20:00:00", SCHEDULED_TS + 10),
                ttl,
            )
            .await
            .unwrap();
        settings
            .put(moved, &settings_entry("21:00:00", SCHEDULED_TS - 10), ttl)
            .await
            .unwrap();

        let verdict = h
            .handle(&json!({
                "type": "check_in_reminder",
                "message_id": "m-1",
                "batch_id": "b-1",
                "check_in_date": "2026-10-19",
                "scheduled_at": SCHEDULED_AT,
                "user_ids": [1, 2, 3],
                "user_settings": {
                    "1": snapshot("20:00:00"),
                    "2": snapshot("20:00:00"),
                    "3": snapshot("20:00:00")
                }
            }))
            .await;

        assert_eq!(verdict, Verdict::Ack);

        let sent = h.dispatcher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].template_params["name"], "user1");
        assert_eq!(h.balance(unchanged), 45);
        assert_eq!(h.balance(updated_later), 50);
        assert_eq!(h.balance(moved), 50);

        let published = h.publisher.published();
        assert_eq!(published.len(), 1);
        let QueueMessage::CheckInReminder(fresh) = &published[0] else {
            panic!("expected a reminder batch");
        };
        assert_eq!(fresh.user_ids, vec![moved]);
        assert_eq!(fresh.user_settings[&moved].remind_at, "21:00:00");
        assert_ne!(fresh.message_id.as_str(), "m-1");
    }

    #[tokio::test]
    async fn redelivered_batch_does_not_duplicate_republished_work() {
        let h = Harness::new();
        let locked = h.user(1, 50);
        let moved = h.user(3, 50);
        SettingsCache::new(Arc::clone(&h.cache))
            .put(moved, &settings_entry("21:00:00", 0), Duration::from_secs(3600))
            .await
            .unwrap();
        h.cache
            .set(
                "lock:check_in_reminder:2026-10-19:1",
                "someone-else",
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        let body = json!({
            "type": "check_in_reminder",
            "message_id": "m-1",
            "batch_id": "b-1",
            "check_in_date": "2026-10-19",
            "scheduled_at": SCHEDULED_AT,
            "user_ids": [locked.0, moved.0],
            "user_settings": {
                "1": snapshot("20:00:00"),
                "3": snapshot("20:00:00")
            }
        })
        .to_string();

        let first = h.worker.handle(body.as_bytes(), 1).await;
        h.cache
            .delete("lock:check_in_reminder:2026-10-19:1")
            .await
            .unwrap();
        let second = h.worker.handle(body.as_bytes(), 2).await;

        assert!(matches!(first, Verdict::Retry { .. }));
        assert_eq!(second, Verdict::Ack);
        let published = h.publisher.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].message_id(), published[1].message_id());

        // Both copies reach the queue; only one is handled.
        for copy in &published {
            let body = serde_json::to_vec(copy).unwrap();
            assert_eq!(h.worker.handle(&body, 1).await, Verdict::Ack);
        }
        assert_eq!(h.dispatcher.calls(), 2);
        assert_eq!(h.balance(locked), 45);
        assert_eq!(h.balance(moved), 45);
    }

    #[tokio::test]
    async fn bad_scheduled_at_skips_everyone() {
        let h = Harness::new();
        h.user(1, 50);

        let verdict = h
            .handle(&json!({
                "type": "check_in_reminder",
                "message_id": "m-1",
                "batch_id": "b-1",
                "check_in_date": "2026-10-19",
                "scheduled_at": "garbage",
                "user_ids": [1]
            }))
            .await;

        assert_eq!(verdict, Verdict::Ack);
        assert_eq!(h.dispatcher.calls(), 0);
        assert!(h.publisher.published().is_empty());
    }
}

mod event_loop {
    use super::*;

    #[tokio::test]
    async fn run_replies_with_verdicts_until_shutdown() {
        let Harness {
            store,
            dispatcher,
            worker,
            ..
        } = Harness::new();
        seed_user(&store, UserId(1), "Alice", "+8613800000001");
        fund(&store, UserId(1), Channel::Sms, 50);

        let (tx, rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();

        let driver = async {
            let (reply, verdict) = oneshot::channel();
            tx.send(WorkerMessage::Delivery(Inbound {
                body: journey_message("m-1", 7, 1).to_string().into_bytes(),
                attempt: 1,
                reply: Some(reply),
            }))
            .await
            .unwrap();
            let verdict = verdict.await.unwrap();
            tx.send(WorkerMessage::ReclaimLeases).await.unwrap();
            tx.send(WorkerMessage::Shutdown).await.unwrap();
            verdict
        };

        let ((), verdict) = tokio::join!(worker.run(rx, shutdown), driver);

        assert_eq!(verdict, Verdict::Ack);
        assert_eq!(dispatcher.calls(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let h = Harness::new();
        let (_tx, rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        h.worker.run(rx, shutdown).await;
    }
}

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use notification_settlement::cache::MemoryCache;
use notification_settlement::config::PipelineConfig;
use notification_settlement::delivery::{TaskEngine, TracingObserver};
use notification_settlement::dispatch::DryRunDispatcher;
use notification_settlement::store::SqliteStore;
use notification_settlement::worker::{
    Inbound, LoggingPublisher, NotificationWorker, Verdict, WorkerMessage,
};

/// Deliveries of one message before it is dropped as undeliverable.
const MAX_DELIVERIES: u32 = 10;

const CHANNEL_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notification_settlement=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PipelineConfig::from_env().context("loading configuration")?;
    info!(?config, "configuration loaded");

    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    let engine = TaskEngine::new(
        store,
        DryRunDispatcher::new(),
        config.cipher()?,
        config.engine_config(),
        Arc::new(TracingObserver),
    );
    let worker = NotificationWorker::new(
        engine,
        Arc::new(MemoryCache::new()),
        LoggingPublisher,
        config.worker_config(),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received");
            }
            shutdown.cancel();
        }
    });

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::join!(worker.run(rx, shutdown.clone()), read_stdin(tx, shutdown));

    info!("exiting");
    Ok(())
}

/// Feeds each stdin line to the worker as a queue message until EOF.
async fn read_stdin(tx: mpsc::Sender<WorkerMessage>, shutdown: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    tokio::spawn(deliver(tx.clone(), line.into_bytes()));
                }
                Ok(None) => {
                    info!("stdin closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "cannot read stdin");
                    break;
                }
            },
        }
    }
}

/// Delivers one message, redelivering after each `Retry` verdict.
async fn deliver(tx: mpsc::Sender<WorkerMessage>, body: Vec<u8>) {
    let mut attempt = 1;
    loop {
        let (reply, verdict) = oneshot::channel();
        let inbound = Inbound {
            body: body.clone(),
            attempt,
            reply: Some(reply),
        };
        if tx.send(WorkerMessage::Delivery(inbound)).await.is_err() {
            return;
        }
        match verdict.await {
            Ok(Verdict::Retry { delay }) if attempt < MAX_DELIVERIES => {
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Ok(Verdict::Retry { .. }) => {
                warn!(attempt, "giving up on message after repeated retries");
                return;
            }
            Ok(_) | Err(_) => return,
        }
    }
}

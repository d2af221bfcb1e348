//! Worker message types for async communication.
//!
//! The queue driver (the binary's stdin reader, or a queue client) sends
//! these to a [`super::NotificationWorker`] over a `tokio::sync::mpsc`
//! channel.

use tokio::sync::oneshot;

use super::Verdict;

/// One delivery of a queue message.
#[derive(Debug)]
pub struct Inbound {
    /// The raw message body.
    pub body: Vec<u8>,

    /// Delivery attempt number, starting at 1.
    pub attempt: u32,

    /// Where to send the verdict, if the driver wants it.
    pub reply: Option<oneshot::Sender<Verdict>>,
}

/// Messages that can be sent to a worker.
#[derive(Debug)]
pub enum WorkerMessage {
    /// A queue message to handle.
    Delivery(Inbound),

    /// Run the lease sweep now.
    ReclaimLeases,

    /// Request a graceful shutdown.
    ///
    /// The worker finishes the current message and exits its event loop.
    Shutdown,
}

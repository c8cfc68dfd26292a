//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus distributes [`crate::JobEvent`]s to monitoring consumers after the
//! store has accepted the corresponding state change. It is not a queue:
//!
//! - **Best-effort**: a failed publish never undoes the state transition
//! - **No persistence**: the job table is the source of truth
//! - **Broadcast**: every subscriber receives every event published after it subscribed

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use thiserror::Error;

/// A subscription to an event stream.
///
/// ```ignore
/// let events = bus.subscribe();
/// loop {
///     match events.recv_timeout(Duration::from_secs(1)) {
///         Ok(event) => export(event),
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
///
/// Subscriptions are meant for one consumer thread each.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything published so far that has not been received yet.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Publish failed due to internal lock poisoning.
    #[error("event bus lock poisoned")]
    Poisoned,
    /// Transport-specific failure.
    #[error("event bus transport: {0}")]
    Transport(String),
}

/// Pub/sub abstraction.
///
/// Object safe so the queue can hold an `Arc<dyn EventBus<JobEvent>>`.
pub trait EventBus<M>: Send + Sync {
    fn publish(&self, message: M) -> Result<(), BusError>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    fn publish(&self, message: M) -> Result<(), BusError> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}

//! In-process publish/subscribe used to wake drain workers after a commit.
//!
//! The bus carries **notices**, not events. The outbox is the source of truth:
//!
//! - a lost notice only delays a drain until its next poll tick
//! - a duplicate notice triggers a drain that finds nothing new
//! - consumers never trust the notice contents, they re-read the outbox
//!
//! This keeps the bus free of delivery guarantees. It is not a broker and
//! does not cross process boundaries.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to a bus.
///
/// Each subscription gets a copy of every message published after it was
/// created (broadcast semantics).
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = bus.subscribe();
///
/// loop {
///     match subscription.recv_timeout(Duration::from_millis(500)) {
///         Ok(_notice) => drain()?,
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => drain()?,  // poll tick
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,  // bus dropped
///     }
/// }
/// ```
///
/// Subscriptions are meant for a single consuming thread.
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

    /// Discard everything already queued; returns how many messages were dropped.
    pub fn drain_pending(&self) -> usize {
        let mut dropped = 0;
        while self.receiver.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// Transport-agnostic pub/sub contract.
///
/// `publish` failures are reported to the caller, which treats them as
/// best-effort: the commit they announce has already happened.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}

//! Many-producer, single-consumer envelope queue carrying cross-thread
//! work into a service loop.
//!
//! Built on `std::sync::mpsc` rather than an async channel: the consumer
//! side only ever runs from the owning loop thread and wants a plain
//! bounded, non-blocking drain plus one blocking wait with a timeout —
//! `std::sync::mpsc::Receiver::recv_timeout` already gives exactly that,
//! so there is nothing an async runtime's channel would add here.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use crate::error::CoreError;

/// An opaque unit of cross-thread work: a tag naming its purpose plus an
/// owned payload. The queue does not interpret either field.
pub struct Envelope {
    pub tag: String,
    pub payload: Box<dyn std::any::Any + Send>,
}

impl Envelope {
    pub fn new(tag: impl Into<String>, payload: impl std::any::Any + Send) -> Self {
        Self {
            tag: tag.into(),
            payload: Box::new(payload),
        }
    }

    pub fn downcast<T: 'static>(self) -> Result<T, Self> {
        match self.payload.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(payload) => Err(Self {
                tag: self.tag,
                payload,
            }),
        }
    }
}

/// The producer handle; cheap to clone, `Send + Sync`.
#[derive(Clone)]
pub struct QueueSender {
    inner: Sender<Envelope>,
}

impl QueueSender {
    /// Enqueues an envelope. Fails only once the consumer side has been
    /// dropped (service shutdown complete).
    pub fn push(&self, envelope: Envelope) -> Result<(), CoreError> {
        self.inner
            .send(envelope)
            .map_err(|_| CoreError::closed("message queue consumer has shut down"))
    }
}

/// The single-consumer side, owned by the service loop thread.
pub struct MessageQueue {
    receiver: Receiver<Envelope>,
}

impl MessageQueue {
    pub fn new() -> (QueueSender, MessageQueue) {
        let (tx, rx) = std::sync::mpsc::channel();
        (QueueSender { inner: tx }, MessageQueue { receiver: rx })
    }

    /// Drains up to `max` pending envelopes into `out`, without
    /// blocking. Returns the number drained. Bounding this per tick is
    /// what keeps one producer from starving the rest of the loop.
    pub fn drain_up_to(&self, max: usize, out: &mut Vec<Envelope>) -> usize {
        let mut drained = 0;
        while drained < max {
            match self.receiver.try_recv() {
                Ok(envelope) => {
                    out.push(envelope);
                    drained += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        drained
    }

    /// Blocks the calling (consumer) thread until an envelope arrives or
    /// `timeout` elapses. Returns `None` on timeout or disconnect — both
    /// are "nothing to do right now" from the loop's perspective.
    pub fn blocking_drain(&self, timeout: Duration) -> Option<Envelope> {
        match self.receiver.recv_timeout(timeout) {
            Ok(envelope) => Some(envelope),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

//! FIFO execution context for coordinator state.
//!
//! Every mutation of coordinator state happens while handling a message pulled
//! from a [`SerialReceiver`], so handlers never overlap. Network tasks and
//! timers only ever talk to the state by enqueueing messages.
//!
//! Messages may carry a [`CancellationToken`]. A message whose token is
//! cancelled by the time it reaches the head of the queue is dropped without
//! being handed to the consumer.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::errors::{CacheError, CacheResult};

struct Envelope<M> {
    message: M,
    token: Option<CancellationToken>,
}

/// Sending half; cheap to clone and safe to use from any task
pub struct SerialQueue<M> {
    sender: mpsc::UnboundedSender<Envelope<M>>,
}

impl<M> Clone for SerialQueue<M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<M> std::fmt::Debug for SerialQueue<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

/// Sender that does not keep the queue open on its own
pub struct WeakSerialQueue<M> {
    sender: mpsc::WeakUnboundedSender<Envelope<M>>,
}

impl<M> Clone for WeakSerialQueue<M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<M> WeakSerialQueue<M> {
    pub fn upgrade(&self) -> Option<SerialQueue<M>> {
        self.sender.upgrade().map(|sender| SerialQueue { sender })
    }
}

/// Receiving half, owned by the single task that runs the handlers
pub struct SerialReceiver<M> {
    receiver: mpsc::UnboundedReceiver<Envelope<M>>,
}

pub fn channel<M>() -> (SerialQueue<M>, SerialReceiver<M>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (SerialQueue { sender }, SerialReceiver { receiver })
}

impl<M: Send + 'static> SerialQueue<M> {
    pub fn enqueue(&self, message: M) -> CacheResult<()> {
        self.send(Envelope {
            message,
            token: None,
        })
    }

    /// Enqueue a message that is skipped if `token` is cancelled before it runs
    pub fn enqueue_cancellable(&self, message: M, token: CancellationToken) -> CacheResult<()> {
        self.send(Envelope {
            message,
            token: Some(token),
        })
    }

    /// Enqueue `message` after `delay` unless `token` is cancelled first
    pub fn enqueue_after(
        &self,
        delay: Duration,
        message: M,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!("Delayed message cancelled before its timer fired");
                }
                _ = tokio::time::sleep(delay) => {
                    let _ = queue.enqueue_cancellable(message, token);
                }
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn downgrade(&self) -> WeakSerialQueue<M> {
        WeakSerialQueue {
            sender: self.sender.downgrade(),
        }
    }

    fn send(&self, envelope: Envelope<M>) -> CacheResult<()> {
        self.sender.send(envelope).map_err(|_| CacheError::Closed)
    }
}

impl<M> SerialReceiver<M> {
    /// Next live message in FIFO order; `None` once every sender is gone
    pub async fn next(&mut self) -> Option<M> {
        loop {
            let envelope = self.receiver.recv().await?;
            if envelope
                .token
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
            {
                trace!("Skipping cancelled message at head of queue");
                continue;
            }
            return Some(envelope.message);
        }
    }

    /// Stop accepting new messages; already queued ones can still be drained
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

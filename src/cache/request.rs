//! Consumer-facing request handles.

use bytes::{Bytes, BytesMut};
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

use super::errors::{CacheError, CacheResult};
use super::metadata::ResourceMetadata;

/// Identity of one consumer request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RequestIdGenerator {
    next: Arc<AtomicU64>,
}

impl RequestIdGenerator {
    pub(crate) fn next(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// What a range request yields, ending with exactly one terminal event
#[derive(Debug, Clone)]
pub enum RangeEvent {
    Data(Bytes),
    Finished,
    Failed(CacheError),
}

impl RangeEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Data(_))
    }
}

pub(crate) type MetadataReply = oneshot::Sender<CacheResult<ResourceMetadata>>;
pub(crate) type RangeSink = mpsc::UnboundedSender<RangeEvent>;

/// Pending metadata request
#[derive(Debug)]
pub struct MetadataRequest {
    id: RequestId,
    receiver: oneshot::Receiver<CacheResult<ResourceMetadata>>,
}

impl MetadataRequest {
    pub(crate) fn new(id: RequestId) -> (Self, MetadataReply) {
        let (sender, receiver) = oneshot::channel();
        (Self { id, receiver }, sender)
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the result; a request abandoned without an answer reads as `Closed`
    pub async fn wait(self) -> CacheResult<ResourceMetadata> {
        self.receiver.await.unwrap_or(Err(CacheError::Closed))
    }
}

/// Stream of cached bytes for one `(offset, length)` request.
///
/// The stream ends right after the terminal event. If the coordinator is torn
/// down without finishing the request, the stream ends with no terminal event.
#[derive(Debug)]
pub struct RangeReader {
    id: RequestId,
    receiver: mpsc::UnboundedReceiver<RangeEvent>,
    done: bool,
}

impl RangeReader {
    pub(crate) fn new(id: RequestId) -> (Self, RangeSink) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                id,
                receiver,
                done: false,
            },
            sender,
        )
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Drain the stream into one buffer
    pub async fn collect_bytes(mut self) -> CacheResult<Bytes> {
        let mut out = BytesMut::new();
        while let Some(event) = self.receiver.recv().await {
            match event {
                RangeEvent::Data(chunk) => out.extend_from_slice(&chunk),
                RangeEvent::Finished => return Ok(out.freeze()),
                RangeEvent::Failed(err) => return Err(err),
            }
        }
        Err(CacheError::Closed)
    }
}

impl Stream for RangeReader {
    type Item = RangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    self.done = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

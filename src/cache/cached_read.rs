use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::cache_file::CacheFile;
use super::config::UncachedSeekPolicy;
use super::errors::{CacheError, CacheResult};
use super::request::{RangeEvent, RangeSink, RequestId};

/// Result of a single pull from the cache file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// The request is done and can be removed
    Finished,
    /// More cached bytes are available right now
    ContinueRequesting,
    /// Not enough bytes on disk; resume on the next flush
    WaitForMoreData,
}

/// One consumer range request served purely from the cache file.
///
/// Finishing consumes the sink, so a request is never finished twice.
#[derive(Debug)]
pub struct CachedReadRequest {
    id: RequestId,
    offset: u64,
    length: u64,
    delivered: u64,
    policy: UncachedSeekPolicy,
    chunk_cap: u64,
    admitted: bool,
    waiting_for_data: bool,
    sink: Option<RangeSink>,
    /// Cancelled when the request goes away, stopping its dropped-reader watch
    watch: Option<CancellationToken>,
}

impl CachedReadRequest {
    pub(crate) fn new(
        id: RequestId,
        offset: u64,
        length: u64,
        policy: UncachedSeekPolicy,
        chunk_cap: u64,
        sink: RangeSink,
    ) -> Self {
        Self {
            id,
            offset,
            length,
            delivered: 0,
            policy,
            chunk_cap: chunk_cap.max(1),
            admitted: policy == UncachedSeekPolicy::Relaxed,
            waiting_for_data: false,
            sink: Some(sink),
            watch: None,
        }
    }

    /// Sink clone for watching the reader, paired with a token cancelled when this request is dropped
    pub(crate) fn watch_reader(&mut self, token: CancellationToken) -> Option<RangeSink> {
        let sink = self.sink.clone()?;
        self.watch = Some(token);
        Some(sink)
    }

    /// Whether the consumer dropped its reader
    pub fn is_abandoned(&self) -> bool {
        self.sink.as_ref().is_none_or(|sink| sink.is_closed())
    }

    /// End of the requested range, clamped at `u64::MAX`
    fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn remaining(&self) -> u64 {
        self.length - self.delivered
    }

    pub fn is_finished(&self) -> bool {
        self.sink.is_none()
    }

    pub fn is_waiting_for_data(&self) -> bool {
        self.waiting_for_data
    }

    /// Pull until the request finishes or has to wait.
    ///
    /// With `download_complete` set, a request that runs out of cached bytes
    /// finishes short instead of waiting.
    pub async fn serve(&mut self, file: &dyn CacheFile, download_complete: bool) -> PullOutcome {
        loop {
            match self.pull(file, download_complete).await {
                PullOutcome::ContinueRequesting => continue,
                outcome => {
                    self.waiting_for_data = outcome == PullOutcome::WaitForMoreData;
                    return outcome;
                }
            }
        }
    }

    async fn pull(&mut self, file: &dyn CacheFile, download_complete: bool) -> PullOutcome {
        if self.is_finished() {
            return PullOutcome::Finished;
        }
        if self.remaining() == 0 {
            self.finish(Ok(()));
            return PullOutcome::Finished;
        }

        let cached = file.current_size();
        if !self.admitted {
            if cached < self.end() && !download_complete {
                trace!(
                    "{} waiting for {} bytes before serving (cache holds {})",
                    self.id,
                    self.end(),
                    cached
                );
                return PullOutcome::WaitForMoreData;
            }
            self.admitted = true;
        }

        let position = self.offset.saturating_add(self.delivered);
        let available = cached.saturating_sub(position);
        if available == 0 {
            return self.out_of_data(download_complete);
        }

        let to_read = available.min(self.remaining()).min(self.chunk_cap);
        let data = match file.read(position, to_read as usize).await {
            Ok(data) => data,
            Err(err) => {
                warn!("{} cache read at {} failed: {}", self.id, position, err);
                self.finish(Err(err));
                return PullOutcome::Finished;
            }
        };
        if data.is_empty() {
            return self.out_of_data(download_complete);
        }

        let read = data.len() as u64;
        if !self.emit(RangeEvent::Data(Bytes::from(data))) {
            return PullOutcome::Finished;
        }
        self.delivered += read;

        if self.remaining() == 0 {
            self.finish(Ok(()));
            PullOutcome::Finished
        } else {
            PullOutcome::ContinueRequesting
        }
    }

    fn out_of_data(&mut self, download_complete: bool) -> PullOutcome {
        if download_complete {
            warn!(
                "{} short read: delivered {} of {} bytes at offset {}",
                self.id, self.delivered, self.length, self.offset
            );
            self.finish(Ok(()));
            PullOutcome::Finished
        } else {
            PullOutcome::WaitForMoreData
        }
    }

    /// Deliver a terminal event; returns false if the request was already finished
    pub fn finish(&mut self, result: CacheResult<()>) -> bool {
        let Some(sink) = self.sink.take() else {
            return false;
        };
        let event = match result {
            Ok(()) => RangeEvent::Finished,
            Err(err) => RangeEvent::Failed(err),
        };
        debug!("{} finished: {:?}", self.id, event);
        let _ = sink.send(event);
        true
    }

    /// Send a data event; a closed receiver finishes the request as cancelled
    fn emit(&mut self, event: RangeEvent) -> bool {
        let Some(sink) = self.sink.as_ref() else {
            return false;
        };
        if sink.send(event).is_err() {
            debug!("{} reader dropped, treating as cancelled", self.id);
            self.sink = None;
            return false;
        }
        true
    }

    pub fn cancel(&mut self) -> bool {
        self.finish(Err(CacheError::Cancelled))
    }
}

impl Drop for CachedReadRequest {
    fn drop(&mut self) {
        if let Some(watch) = self.watch.take() {
            watch.cancel();
        }
    }
}

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::buffer::{SharedWriteBuffer, WriteBuffer};
use super::cache_file::CacheFile;
use super::cached_read::{CachedReadRequest, PullOutcome};
use super::config::CoordinatorConfig;
use super::errors::{CacheError, CacheResult};
use super::metadata::{ByteRange, ContentRange, MimeLookup, ProbeResponse, ResourceMetadata, SharedMimeLookup};
use super::negotiation::{NegotiationRequest, NegotiationStep, run_probe};
use super::observer::{DownloadObserver, NoopObserver};
use super::request::{
    MetadataReply, MetadataRequest, RangeReader, RangeSink, RequestId, RequestIdGenerator,
};
use super::serial_queue::{self, SerialQueue, SerialReceiver, WeakSerialQueue};
use super::state_machine::{ActiveTask, DownloadSession, DownloadState};
use super::stats::{CoordinatorStats, StatsSnapshot};
use super::transport::{HttpMethod, HttpTransport, OutboundRequest};

/// Messages handled on the coordinator's serial queue
pub(crate) enum CoordinatorMessage {
    Metadata {
        id: RequestId,
        reply: MetadataReply,
    },
    ReadRange {
        id: RequestId,
        offset: u64,
        length: u64,
        sink: RangeSink,
    },
    Cancel(RequestId),
    /// A waiting range request's reader was dropped
    ReaderDropped(RequestId),
    Snapshot {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },
    Teardown {
        destructive: bool,
        done: oneshot::Sender<()>,
    },
    ProbeFinished {
        task_id: u64,
        result: CacheResult<ProbeResponse>,
    },
    RetryNegotiation {
        task_id: u64,
    },
    DownloadHeaders {
        task_id: u64,
        status: u16,
        headers: HeaderMap,
        decision: oneshot::Sender<HeaderDecision>,
    },
    DataReceived {
        task_id: u64,
    },
    DownloadFinished {
        task_id: u64,
        result: CacheResult<()>,
    },
    RetryDownload {
        task_id: u64,
    },
}

impl CoordinatorMessage {
    fn name(&self) -> &'static str {
        match self {
            Self::Metadata { .. } => "metadata",
            Self::ReadRange { .. } => "read_range",
            Self::Cancel(_) => "cancel",
            Self::ReaderDropped(_) => "reader_dropped",
            Self::Snapshot { .. } => "snapshot",
            Self::Teardown { .. } => "teardown",
            Self::ProbeFinished { .. } => "probe_finished",
            Self::RetryNegotiation { .. } => "retry_negotiation",
            Self::DownloadHeaders { .. } => "download_headers",
            Self::DataReceived { .. } => "data_received",
            Self::DownloadFinished { .. } => "download_finished",
            Self::RetryDownload { .. } => "retry_download",
        }
    }
}

/// What a download task does after its response headers were checked
#[derive(Debug)]
pub(crate) enum HeaderDecision {
    /// Stream the body into the write buffer
    Stream,
    /// Nothing left to transfer
    Finish,
    /// Fail the attempt with this error
    Reject(CacheError),
}

/// Point-in-time view of a coordinator
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: DownloadState,
    pub write_offset: u64,
    pub cached_bytes: u64,
    pub buffered_bytes: usize,
    /// -1 when unknown
    pub expected_total: i64,
    pub retry_count: u32,
    pub download_task_active: bool,
    pub negotiation_active: bool,
    pub negotiation_waiters: usize,
    pub metadata: Option<ResourceMetadata>,
    pub pending_reads: usize,
    pub stats: StatsSnapshot,
}

/// Capability a playback integration needs from the cache
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn resolve_metadata(&self) -> CacheResult<ResourceMetadata>;
    fn read_range(&self, offset: u64, length: u64) -> RangeReader;
    fn cancel(&self, id: RequestId);
}

pub struct DownloadCoordinatorBuilder {
    url: String,
    cache_file: Arc<dyn CacheFile>,
    transport: Arc<dyn HttpTransport>,
    config: Option<CoordinatorConfig>,
    observer: Arc<dyn DownloadObserver>,
    headers: HashMap<String, String>,
    mime_lookup: Option<SharedMimeLookup>,
}

impl DownloadCoordinatorBuilder {
    /// Use `config` instead of the installed default
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn observer(mut self, observer: impl DownloadObserver + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Headers merged into every outbound request
    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn mime_lookup(mut self, lookup: impl MimeLookup + 'static) -> Self {
        self.mime_lookup = Some(Arc::new(lookup));
        self
    }

    /// Start the coordinator on the current tokio runtime
    pub fn spawn(self) -> CoordinatorHandle {
        let config = self
            .config
            .unwrap_or_else(CoordinatorConfig::installed_default);
        let (queue, receiver) = serial_queue::channel();

        let coordinator = DownloadCoordinator {
            session: DownloadSession::new(),
            url: self.url,
            config,
            headers: self.headers,
            transport: self.transport,
            cache_file: self.cache_file,
            observer: self.observer,
            mime_lookup: self.mime_lookup,
            queue: queue.downgrade(),
            buffer: WriteBuffer::shared(),
            negotiation: None,
            metadata: None,
            pending_reads: HashMap::new(),
            next_task_id: 0,
            transport_token: CancellationToken::new(),
            stats: CoordinatorStats::new(),
        };

        tokio::spawn(coordinator.run(receiver));

        CoordinatorHandle {
            queue,
            ids: RequestIdGenerator::default(),
        }
    }
}

/// Owns the full-body download of one resource and serves consumers from its cache file.
///
/// All state lives inside the actor task and is only touched while handling a
/// message from the serial queue. Network tasks report back through the same
/// queue, tagged with their task id and cancellation token, so results from a
/// superseded task never reach the state.
pub struct DownloadCoordinator {
    url: String,
    config: CoordinatorConfig,
    headers: HashMap<String, String>,
    transport: Arc<dyn HttpTransport>,
    cache_file: Arc<dyn CacheFile>,
    observer: Arc<dyn DownloadObserver>,
    mime_lookup: Option<SharedMimeLookup>,
    queue: WeakSerialQueue<CoordinatorMessage>,
    session: DownloadSession,
    buffer: SharedWriteBuffer,
    negotiation: Option<NegotiationRequest>,
    metadata: Option<ResourceMetadata>,
    pending_reads: HashMap<RequestId, CachedReadRequest>,
    next_task_id: u64,
    /// Parent of every network task token; cancelled on teardown
    transport_token: CancellationToken,
    stats: CoordinatorStats,
}

impl DownloadCoordinator {
    pub fn builder(
        url: impl Into<String>,
        cache_file: Arc<dyn CacheFile>,
        transport: Arc<dyn HttpTransport>,
    ) -> DownloadCoordinatorBuilder {
        DownloadCoordinatorBuilder {
            url: url.into(),
            cache_file,
            transport,
            config: None,
            observer: Arc::new(NoopObserver),
            headers: HashMap::new(),
            mime_lookup: None,
        }
    }

    /// Run the event loop until teardown, or until every handle and task is gone
    async fn run(mut self, mut receiver: SerialReceiver<CoordinatorMessage>) {
        info!("🎬 Cache coordinator started for {}", self.url);

        let mut teardown_ack = None;
        while let Some(message) = receiver.next().await {
            trace!("Coordinator handling {}", message.name());
            if let ControlFlow::Break(ack) = self.handle(message).await {
                teardown_ack = Some(ack);
                break;
            }
        }

        receiver.close();
        self.transport_token.cancel();
        info!("{}", self.stats.format_report());
        info!("Cache coordinator for {} stopped", self.url);

        if let Some(ack) = teardown_ack {
            let _ = ack.send(());
        }
    }

    /// Handle one message; `Break` carries the teardown acknowledgement
    async fn handle(&mut self, message: CoordinatorMessage) -> ControlFlow<oneshot::Sender<()>> {
        match message {
            CoordinatorMessage::Metadata { id, reply } => self.handle_metadata(id, reply).await,
            CoordinatorMessage::ReadRange {
                id,
                offset,
                length,
                sink,
            } => self.handle_read_range(id, offset, length, sink).await,
            CoordinatorMessage::Cancel(id) => self.cancel_request(id),
            CoordinatorMessage::ReaderDropped(id) => {
                if self.pending_reads.remove(&id).is_some() {
                    debug!("{} reader dropped while waiting, removed", id);
                }
            }
            CoordinatorMessage::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            CoordinatorMessage::Teardown { destructive, done } => {
                self.teardown(destructive).await;
                return ControlFlow::Break(done);
            }
            CoordinatorMessage::ProbeFinished { task_id, result } => {
                self.on_probe_finished(task_id, result)
            }
            CoordinatorMessage::RetryNegotiation { task_id } => {
                let scheduled = self
                    .negotiation
                    .as_ref()
                    .and_then(|negotiation| negotiation.task.as_ref())
                    .is_some_and(|task| task.id == task_id);
                if scheduled {
                    self.start_probe();
                }
            }
            CoordinatorMessage::DownloadHeaders {
                task_id,
                status,
                headers,
                decision,
            } => {
                self.on_download_headers(task_id, status, &headers, decision)
                    .await
            }
            CoordinatorMessage::DataReceived { task_id } => self.on_data_received(task_id).await,
            CoordinatorMessage::DownloadFinished { task_id, result } => {
                self.on_download_finished(task_id, result).await
            }
            CoordinatorMessage::RetryDownload { task_id } => {
                if self.session.owns_task(task_id) {
                    self.start_download(true).await;
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn next_task_id(&mut self) -> u64 {
        self.next_task_id += 1;
        self.next_task_id
    }

    // Consumer requests

    async fn handle_metadata(&mut self, id: RequestId, reply: MetadataReply) {
        self.ensure_download_started().await;

        if let Some(metadata) = &self.metadata {
            debug!("Answering {} from resolved metadata", id);
            let _ = reply.send(Ok(metadata.clone()));
            return;
        }

        let negotiation = self.negotiation.get_or_insert_with(NegotiationRequest::new);
        negotiation.add_waiter(id, reply);
        debug!(
            "{} waiting on negotiation ({} waiters)",
            id,
            negotiation.waiter_count()
        );
        if negotiation.task.is_none() {
            self.start_probe();
        }
    }

    async fn handle_read_range(&mut self, id: RequestId, offset: u64, length: u64, sink: RangeSink) {
        self.ensure_download_started().await;
        self.stats.increment_range_requests();
        debug!("{} reading {} bytes at offset {}", id, length, offset);

        let mut request = CachedReadRequest::new(
            id,
            offset,
            length,
            self.config.uncached_seek_policy,
            self.config.read_chunk_bytes(),
            sink,
        );
        let complete = self.session.state.is_completed();
        let outcome = request.serve(self.cache_file.as_ref(), complete).await;
        self.stats.add_range_bytes_served(request.delivered());

        if outcome == PullOutcome::WaitForMoreData {
            self.watch_reader(&mut request);
            self.pending_reads.insert(id, request);
        }
    }

    /// Report the reader of a waiting request as dropped as soon as it goes away
    fn watch_reader(&self, request: &mut CachedReadRequest) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        let token = self.transport_token.child_token();
        let Some(sink) = request.watch_reader(token.clone()) else {
            return;
        };
        let id = request.id();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sink.closed() => {
                    let _ = queue.enqueue_cancellable(CoordinatorMessage::ReaderDropped(id), token);
                }
            }
        });
    }

    fn cancel_request(&mut self, id: RequestId) {
        if let Some(negotiation) = self.negotiation.as_mut()
            && negotiation.cancel_waiter(id)
        {
            debug!("Cancelled metadata waiter {}", id);
            return;
        }
        if let Some(mut request) = self.pending_reads.remove(&id) {
            request.cancel();
            debug!("Cancelled range request {}", id);
            return;
        }
        trace!("Cancel for {} ignored, request already finished", id);
    }

    /// Serve every waiting range request from whatever the cache file now holds
    async fn pump_reads(&mut self) {
        self.pending_reads.retain(|id, request| {
            if request.is_abandoned() {
                debug!("{} reader dropped, removing", id);
                return false;
            }
            true
        });
        if self.pending_reads.is_empty() {
            return;
        }

        let complete = self.session.state.is_completed();
        let ids: Vec<RequestId> = self.pending_reads.keys().copied().collect();
        for id in ids {
            let Some(request) = self.pending_reads.get_mut(&id) else {
                continue;
            };
            let before = request.delivered();
            let outcome = request.serve(self.cache_file.as_ref(), complete).await;
            self.stats
                .add_range_bytes_served(request.delivered() - before);
            if outcome == PullOutcome::Finished {
                self.pending_reads.remove(&id);
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.session.state.clone(),
            write_offset: self.session.write_offset,
            cached_bytes: self.cache_file.current_size(),
            buffered_bytes: self.buffer.lock().len(),
            expected_total: self.session.expected_total,
            retry_count: self.session.retry_count,
            download_task_active: self.session.task.is_some() && self.session.state.is_active(),
            negotiation_active: self
                .negotiation
                .as_ref()
                .is_some_and(|negotiation| negotiation.task.is_some()),
            negotiation_waiters: self
                .negotiation
                .as_ref()
                .map_or(0, NegotiationRequest::waiter_count),
            metadata: self.metadata.clone(),
            pending_reads: self.pending_reads.len(),
            stats: self.stats.snapshot(),
        }
    }

    // Negotiation

    fn start_probe(&mut self) {
        let task_id = self.next_task_id();
        let token = self.transport_token.child_token();
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        let Some(negotiation) = self.negotiation.as_mut() else {
            return;
        };

        negotiation.cancel_task();
        let request = negotiation.outbound_request(&self.url, &self.headers);
        debug!(
            "Starting {:?} negotiation probe (task {})",
            negotiation.phase(),
            task_id
        );
        negotiation.task = Some(ActiveTask {
            id: task_id,
            token: token.clone(),
        });
        self.stats.increment_negotiations();

        let transport = self.transport.clone();
        tokio::spawn(async move {
            let result = run_probe(transport, request, token.clone()).await;
            let _ = queue.enqueue_cancellable(
                CoordinatorMessage::ProbeFinished { task_id, result },
                token,
            );
        });
    }

    fn on_probe_finished(&mut self, task_id: u64, result: CacheResult<ProbeResponse>) {
        enum FollowUp {
            Retry { attempt: u32, error: CacheError },
            Reissue,
            Finish(CacheResult<ResourceMetadata>),
        }

        let max_retries = self.config.max_retries;
        let follow_up = {
            let Some(negotiation) = self.negotiation.as_mut() else {
                return;
            };
            if !negotiation.task.as_ref().is_some_and(|task| task.id == task_id) {
                return;
            }
            negotiation.task = None;

            match result {
                Err(CacheError::Cancelled) => return,
                Err(error) if error.is_retryable() && negotiation.retry_count < max_retries => {
                    negotiation.retry_count += 1;
                    FollowUp::Retry {
                        attempt: negotiation.retry_count,
                        error,
                    }
                }
                Err(error) => FollowUp::Finish(Err(error)),
                Ok(probe) => {
                    match negotiation.evaluate(probe, &self.url, self.mime_lookup.as_deref()) {
                        NegotiationStep::Fallback => FollowUp::Reissue,
                        NegotiationStep::Resolved(metadata) => FollowUp::Finish(Ok(metadata)),
                        NegotiationStep::Failed(error) => FollowUp::Finish(Err(error)),
                    }
                }
            }
        };

        match follow_up {
            FollowUp::Retry { attempt, error } => {
                let delay = self.config.retry_delay(attempt);
                warn!(
                    "Negotiation failed ({}), retry {}/{} in {:?}",
                    error, attempt, max_retries, delay
                );
                self.stats.increment_retries();

                let timer_id = self.next_task_id();
                let token = self.transport_token.child_token();
                if let Some(queue) = self.queue.upgrade() {
                    queue.enqueue_after(
                        delay,
                        CoordinatorMessage::RetryNegotiation { task_id: timer_id },
                        token.clone(),
                    );
                }
                if let Some(negotiation) = self.negotiation.as_mut() {
                    negotiation.task = Some(ActiveTask {
                        id: timer_id,
                        token,
                    });
                }
            }
            FollowUp::Reissue => self.start_probe(),
            FollowUp::Finish(result) => self.finish_negotiation(result),
        }
    }

    fn finish_negotiation(&mut self, result: CacheResult<ResourceMetadata>) {
        let Some(mut negotiation) = self.negotiation.take() else {
            return;
        };
        negotiation.cancel_task();

        match &result {
            Ok(metadata) => {
                info!(
                    "Resolved metadata for {}: {} ({} bytes, ranges: {})",
                    self.url, metadata.mime_type, metadata.content_length, metadata.range_supported
                );
                self.metadata = Some(metadata.clone());
            }
            Err(err) => error!(
                "Negotiation for {} failed for {} waiters: {}",
                self.url,
                negotiation.waiter_count(),
                err
            ),
        }
        negotiation.resolve_all(result);
    }

    // Full-body download

    async fn ensure_download_started(&mut self) {
        match self.session.state {
            DownloadState::Idle => {}
            DownloadState::Failed(_) => {
                info!("Starting a fresh download session for {}", self.url);
                self.session.reset();
            }
            _ => return,
        }
        let resume = self.cache_file.current_size() > 0;
        self.start_download(resume).await;
    }

    /// Supersede any current task with a new GET, resuming from the cache size if asked
    async fn start_download(&mut self, resume: bool) {
        let task_id = self.next_task_id();
        let leftover = self.buffer.lock().rebind(task_id);
        if let Err(err) = self.write_flushed(&leftover).await {
            warn!("Could not flush {} buffered bytes: {}", leftover.len(), err);
        }
        self.session.cancel_task();

        let offset = if resume {
            self.cache_file.current_size()
        } else {
            0
        };
        self.session.write_offset = offset;
        self.session.expected_resume_start = offset;
        self.session.response_status = None;

        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        let token = self.transport_token.child_token();
        self.session.task = Some(ActiveTask {
            id: task_id,
            token: token.clone(),
        });
        let reason = if offset > 0 {
            format!("resuming from byte {}", offset)
        } else {
            "downloading from byte 0".to_string()
        };
        self.session.transition(DownloadState::Running, reason);

        let mut request = OutboundRequest::new(HttpMethod::Get, &self.url).with_headers(&self.headers);
        if offset > 0 {
            request = request.with_range(ByteRange::open(offset));
        }
        info!(
            "⬇️ Starting download task {} for {} from byte {}",
            task_id, self.url, offset
        );
        self.stats.increment_downloads();

        let task = DownloadTask {
            transport: self.transport.clone(),
            queue,
            buffer: self.buffer.clone(),
            task_id,
            token,
        };
        tokio::spawn(task.run(request));
    }

    async fn on_download_headers(
        &mut self,
        task_id: u64,
        status: u16,
        headers: &HeaderMap,
        decision: oneshot::Sender<HeaderDecision>,
    ) {
        if !self.session.owns_task(task_id) {
            return;
        }

        let probe = ProbeResponse::from_headers(status, headers);
        let range_start = ContentRange::start_or_unknown(probe.content_range.as_ref());
        let range_total = probe.content_range.and_then(|cr| cr.total);
        let resume_start = self.session.expected_resume_start;

        if status == 416
            && self.session.is_resuming()
            && range_total == Some(self.cache_file.current_size())
        {
            info!(
                "Server reports the {} cached bytes of {} are already complete",
                resume_start, self.url
            );
            self.session.expected_total = resume_start as i64;
            let _ = decision.send(HeaderDecision::Finish);
            return;
        }

        if probe.is_error() {
            let _ = decision.send(HeaderDecision::Reject(CacheError::ServerError { status }));
            return;
        }

        if self.session.is_resuming() {
            if status != 206 || range_start != resume_start as i64 {
                warn!(
                    "Resume from byte {} answered with status {} (range start {}), restarting from 0",
                    resume_start, status, range_start
                );
                self.restart_from_zero().await;
                return;
            }
        } else if status == 206 && range_start != 0 {
            if self.session.retry_count >= self.config.max_retries {
                self.fail_session(CacheError::UnexpectedRangeStart {
                    expected: 0,
                    actual: range_start,
                });
                return;
            }
            self.session.retry_count += 1;
            self.stats.increment_retries();
            warn!(
                "Plain GET answered with partial content starting at {}, restarting (attempt {}/{})",
                range_start, self.session.retry_count, self.config.max_retries
            );
            self.restart_from_zero().await;
            return;
        }

        self.session.expected_total = match range_total {
            Some(total) => total as i64,
            None => probe
                .content_length
                .map_or(-1, |length| (length + resume_start) as i64),
        };
        self.session.response_status = Some(status);

        if self.config.track_free_space
            && let Some(required) = probe.content_length
        {
            match self.cache_file.free_space().await {
                Ok(available) if available < required => {
                    self.fail_session(CacheError::InsufficientDiskSpace {
                        required,
                        available,
                    });
                    return;
                }
                Ok(_) => {}
                Err(err) => warn!("Cannot check free space for {:?}: {}", self.cache_file.path(), err),
            }
        }

        debug!(
            "Download task {} accepted status {} (expected total {})",
            task_id, status, self.session.expected_total
        );
        let _ = decision.send(HeaderDecision::Stream);
    }

    /// Discard everything cached and download again from byte 0
    async fn restart_from_zero(&mut self) {
        self.session.cancel_task();
        self.buffer.lock().take();
        self.stats.increment_restarts();
        if let Err(err) = self.cache_file.truncate(0).await {
            self.fail_session(err);
            return;
        }
        self.start_download(false).await;
    }

    async fn on_data_received(&mut self, task_id: u64) {
        if !self.session.owns_task(task_id) {
            return;
        }

        let buffered = self.buffer.lock().len();
        if buffered >= self.config.flush_threshold_bytes()
            && let Err(err) = self.flush().await
        {
            self.on_download_error(err).await;
            return;
        }

        let buffered = self.buffer.lock().len() as u64;
        self.observer.progress(
            self.cache_file.current_size() + buffered,
            self.session.expected_total,
        );
    }

    async fn on_download_finished(&mut self, task_id: u64, result: CacheResult<()>) {
        if !self.session.owns_task(task_id) {
            return;
        }
        match result {
            Ok(()) => self.on_download_success().await,
            Err(CacheError::Cancelled) => debug!("Download task {} cancelled", task_id),
            Err(err) => self.on_download_error(err).await,
        }
    }

    async fn on_download_error(&mut self, error: CacheError) {
        self.session.cancel_task();
        // Detach the buffer first so the cancelled task cannot append past what gets written
        let detached = self.next_task_id();
        let leftover = self.buffer.lock().rebind(detached);
        if let Err(err) = self.write_flushed(&leftover).await {
            warn!("Could not preserve {} buffered bytes: {}", leftover.len(), err);
        }

        if !error.is_retryable() || self.session.retry_count >= self.config.max_retries {
            self.fail_session(error);
            return;
        }

        self.session.retry_count += 1;
        let attempt = self.session.retry_count;
        let delay = self.config.retry_delay(attempt);
        warn!(
            "Download of {} failed ({}), retry {}/{} in {:?}",
            self.url, error, attempt, self.config.max_retries, delay
        );
        self.stats.increment_retries();
        self.session
            .transition(DownloadState::Retrying, error.to_string());

        let timer_id = self.next_task_id();
        let token = self.transport_token.child_token();
        if let Some(queue) = self.queue.upgrade() {
            queue.enqueue_after(
                delay,
                CoordinatorMessage::RetryDownload { task_id: timer_id },
                token.clone(),
            );
        }
        self.session.task = Some(ActiveTask {
            id: timer_id,
            token,
        });
    }

    async fn on_download_success(&mut self) {
        self.session.task = None;
        if let Err(err) = self.flush().await {
            self.fail_session(err);
            return;
        }
        if let Err(err) = self.verify() {
            self.fail_session(err);
            return;
        }

        self.session
            .transition(DownloadState::Completed, "download verified");
        self.session.retry_count = 0;
        if let Some(negotiation) = self.negotiation.as_mut() {
            negotiation.retry_count = 0;
        }
        info!(
            "✅ Download of {} complete ({} bytes)",
            self.url,
            self.cache_file.current_size()
        );
        info!("{}", self.stats.format_report());
        self.observer.completed(self.cache_file.path());
        self.pump_reads().await;
    }

    fn verify(&self) -> CacheResult<()> {
        let size = self.cache_file.current_size();

        if let Some(status) = self.session.response_status
            && status >= 400
        {
            return Err(CacheError::ServerError { status });
        }

        if self.config.verify_size
            && let Ok(expected) = u64::try_from(self.session.expected_total)
            && expected != size
        {
            return Err(CacheError::SizeMismatch {
                expected,
                actual: size,
            });
        }

        if let Some(minimum) = self.config.minimum_file_size
            && size < minimum
        {
            return Err(CacheError::BelowMinimumSize {
                minimum,
                actual: size,
            });
        }

        Ok(())
    }

    fn fail_session(&mut self, error: CacheError) {
        error!("❌ Download of {} failed: {}", self.url, error);
        self.session.cancel_task();
        self.session
            .transition(DownloadState::Failed(error.clone()), error.to_string());
        self.observer.failed(&error);

        for (_, mut request) in self.pending_reads.drain() {
            request.finish(Err(error.clone()));
        }
    }

    /// Write the buffer out; on failure the bytes go back to the front of the buffer
    async fn flush(&mut self) -> CacheResult<()> {
        let data = self.buffer.lock().take();
        if let Err(err) = self.write_flushed(&data).await {
            self.buffer.lock().restore(data);
            return Err(err);
        }
        Ok(())
    }

    async fn write_flushed(&mut self, data: &[u8]) -> CacheResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.cache_file
            .write(data, self.session.write_offset)
            .await?;
        self.session.write_offset += data.len() as u64;
        self.stats.add_bytes_flushed(data.len() as u64);
        debug!(
            "Flushed {} bytes, write offset now {}",
            data.len(),
            self.session.write_offset
        );
        self.pump_reads().await;
        Ok(())
    }

    async fn teardown(&mut self, destructive: bool) {
        info!(
            "Tearing down coordinator for {} (destructive: {})",
            self.url, destructive
        );
        self.transport_token.cancel();
        self.session.cancel_task();

        let mut negotiation = self.negotiation.take();
        if let Some(negotiation) = negotiation.as_mut() {
            negotiation.cancel_task();
        }

        if !destructive {
            // Readers and waiters are left unfinished; buffered bytes are kept
            self.pending_reads.clear();
            if let Some(negotiation) = negotiation.as_mut() {
                negotiation.abandon();
            }
            if let Err(err) = self.flush().await {
                warn!("Could not flush buffered bytes on shutdown: {}", err);
            }
            return;
        }

        for (_, mut request) in self.pending_reads.drain() {
            request.cancel();
        }
        if let Some(negotiation) = negotiation.as_mut() {
            negotiation.resolve_all(Err(CacheError::Cancelled));
        }

        let completed = self.session.state.is_completed();
        self.buffer.lock().take();
        self.session.reset();
        self.metadata = None;

        if !completed && let Err(err) = self.cache_file.delete().await {
            error!(
                "Failed to delete cache file {:?}: {}",
                self.cache_file.path(),
                err
            );
        }
    }
}

/// One spawned full-body GET
struct DownloadTask {
    transport: Arc<dyn HttpTransport>,
    queue: SerialQueue<CoordinatorMessage>,
    buffer: SharedWriteBuffer,
    task_id: u64,
    token: CancellationToken,
}

impl DownloadTask {
    async fn run(self, request: OutboundRequest) {
        let result = tokio::select! {
            _ = self.token.cancelled() => Err(CacheError::Cancelled),
            result = self.transfer(request) => result,
        };
        let _ = self.queue.enqueue_cancellable(
            CoordinatorMessage::DownloadFinished {
                task_id: self.task_id,
                result,
            },
            self.token.clone(),
        );
    }

    async fn transfer(&self, request: OutboundRequest) -> CacheResult<()> {
        let response = self.transport.execute(request).await?;

        let (decision_tx, decision_rx) = oneshot::channel();
        self.queue.enqueue_cancellable(
            CoordinatorMessage::DownloadHeaders {
                task_id: self.task_id,
                status: response.status,
                headers: response.headers,
                decision: decision_tx,
            },
            self.token.clone(),
        )?;
        match decision_rx.await {
            Ok(HeaderDecision::Stream) => {}
            Ok(HeaderDecision::Finish) => return Ok(()),
            Ok(HeaderDecision::Reject(err)) => return Err(err),
            Err(_) => return Err(CacheError::Cancelled),
        }

        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            let appended = self.buffer.lock().append(self.task_id, &chunk);
            if appended.is_none() {
                return Err(CacheError::Cancelled);
            }
            self.queue.enqueue_cancellable(
                CoordinatorMessage::DataReceived {
                    task_id: self.task_id,
                },
                self.token.clone(),
            )?;
        }
        Ok(())
    }
}

/// Cloneable handle for consumers of one coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    queue: SerialQueue<CoordinatorMessage>,
    ids: RequestIdGenerator,
}

impl CoordinatorHandle {
    pub fn request_metadata(&self) -> MetadataRequest {
        let id = self.ids.next();
        let (request, reply) = MetadataRequest::new(id);
        if self
            .queue
            .enqueue(CoordinatorMessage::Metadata { id, reply })
            .is_err()
        {
            debug!("Coordinator closed, {} will not be answered", id);
        }
        request
    }

    pub fn read_range(&self, offset: u64, length: u64) -> RangeReader {
        let id = self.ids.next();
        let (reader, sink) = RangeReader::new(id);
        if self
            .queue
            .enqueue(CoordinatorMessage::ReadRange {
                id,
                offset,
                length,
                sink,
            })
            .is_err()
        {
            debug!("Coordinator closed, {} will not be served", id);
        }
        reader
    }

    pub fn cancel(&self, id: RequestId) {
        let _ = self.queue.enqueue(CoordinatorMessage::Cancel(id));
    }

    pub async fn snapshot(&self) -> CacheResult<SessionSnapshot> {
        let (respond_to, receiver) = oneshot::channel();
        self.queue
            .enqueue(CoordinatorMessage::Snapshot { respond_to })?;
        receiver.await.map_err(|_| CacheError::Closed)
    }

    /// Stop the coordinator; `destructive` also deletes an incomplete cache file
    pub async fn teardown(&self, destructive: bool) -> CacheResult<()> {
        let (done, receiver) = oneshot::channel();
        self.queue
            .enqueue(CoordinatorMessage::Teardown { destructive, done })?;
        receiver.await.map_err(|_| CacheError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

#[async_trait]
impl ResourceLoader for CoordinatorHandle {
    async fn resolve_metadata(&self) -> CacheResult<ResourceMetadata> {
        self.request_metadata().wait().await
    }

    fn read_range(&self, offset: u64, length: u64) -> RangeReader {
        CoordinatorHandle::read_range(self, offset, length)
    }

    fn cancel(&self, id: RequestId) {
        CoordinatorHandle::cancel(self, id)
    }
}

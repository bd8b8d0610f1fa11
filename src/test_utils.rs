#![cfg(test)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::cache::cache_file::CacheFile;
use crate::cache::errors::{CacheError, CacheResult};
use crate::cache::metadata::ByteRange;
use crate::cache::transport::{BodyStream, HttpMethod, HttpTransport, OutboundRequest, TransportResponse};

/// In-memory cache file with adjustable free space
#[derive(Debug)]
pub struct MemoryCacheFile {
    data: Mutex<Vec<u8>>,
    free_space: AtomicU64,
    deleted: AtomicBool,
    writes: AtomicUsize,
    attempts: AtomicUsize,
    failure_gate: Mutex<Option<oneshot::Receiver<()>>>,
    path: PathBuf,
}

impl Default for MemoryCacheFile {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheFile {
    pub fn new() -> Self {
        Self::with_contents(Vec::new())
    }

    pub fn with_contents(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Mutex::new(data.into()),
            free_space: AtomicU64::new(u64::MAX),
            deleted: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            failure_gate: Mutex::new(None),
            path: PathBuf::from("/memory/cache.bin"),
        }
    }

    pub fn set_free_space(&self, bytes: u64) {
        self.free_space.store(bytes, Ordering::SeqCst);
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Number of successful writes, i.e. flushes that reached the file
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Writes attempted so far, failed ones included
    pub fn write_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Make the next write block until the returned sender fires, then fail without writing
    pub fn fail_next_write(&self) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel();
        *self.failure_gate.lock() = Some(gate);
        release
    }
}

#[async_trait]
impl CacheFile for MemoryCacheFile {
    async fn write(&self, data: &[u8], offset: u64) -> CacheResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let gate = self.failure_gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
            return Err(CacheError::Io(Arc::new(std::io::Error::other(
                "injected write failure",
            ))));
        }

        let mut guard = self.data.lock();
        let offset = offset as usize;
        if guard.len() < offset {
            guard.resize(offset, 0);
        }
        let end = offset + data.len();
        if guard.len() < end {
            guard.resize(end, 0);
        }
        guard[offset..end].copy_from_slice(data);
        self.deleted.store(false, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, offset: u64, length: usize) -> CacheResult<Vec<u8>> {
        let guard = self.data.lock();
        let start = (offset as usize).min(guard.len());
        let end = start.saturating_add(length).min(guard.len());
        Ok(guard[start..end].to_vec())
    }

    async fn truncate(&self, size: u64) -> CacheResult<()> {
        self.data.lock().resize(size as usize, 0);
        Ok(())
    }

    fn current_size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    async fn free_space(&self) -> CacheResult<u64> {
        Ok(self.free_space.load(Ordering::SeqCst))
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn delete(&self) -> CacheResult<()> {
        self.data.lock().clear();
        self.deleted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Which logical task issued a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// HEAD or bounded 2-byte GET
    Probe,
    /// Full-body GET, plain or resuming
    Download,
}

impl RequestKind {
    pub fn of(request: &OutboundRequest) -> Self {
        let bounded = request.range.is_some_and(|range| range.end.is_some());
        if request.method == HttpMethod::Head || bounded {
            Self::Probe
        } else {
            Self::Download
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request: OutboundRequest,
    pub kind: RequestKind,
    pub at: Instant,
}

/// How a scripted body ends after its fixed chunks
#[derive(Debug)]
pub enum BodyEnding {
    Complete,
    Error(CacheError),
    /// Never ends; only cancellation stops the reader
    Hang,
    /// Further items are fed by the test
    Channel(mpsc::UnboundedReceiver<CacheResult<Bytes>>),
}

#[derive(Debug)]
pub struct ScriptedResponse {
    status: u16,
    headers: HeaderMap,
    chunks: Vec<Bytes>,
    ending: BodyEnding,
    delay: Duration,
}

impl ScriptedResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            chunks: Vec::new(),
            ending: BodyEnding::Complete,
            delay: Duration::ZERO,
        }
    }

    /// A response whose body chunks are pushed through the returned sender
    pub fn streamed(status: u16) -> (Self, mpsc::UnboundedSender<CacheResult<Bytes>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut response = Self::new(status);
        response.ending = BodyEnding::Channel(receiver);
        (response, sender)
    }

    pub fn header(mut self, name: &'static str, value: impl AsRef<str>) -> Self {
        if let Ok(value) = HeaderValue::from_str(value.as_ref()) {
            self.headers.insert(HeaderName::from_static(name), value);
        }
        self
    }

    pub fn body(mut self, data: impl Into<Bytes>) -> Self {
        self.chunks.push(data.into());
        self
    }

    /// Split `data` into chunks of `chunk_size` bytes
    pub fn chunked_body(mut self, data: &[u8], chunk_size: usize) -> Self {
        for chunk in data.chunks(chunk_size.max(1)) {
            self.chunks.push(Bytes::copy_from_slice(chunk));
        }
        self
    }

    pub fn then_fail(mut self, error: CacheError) -> Self {
        self.ending = BodyEnding::Error(error);
        self
    }

    pub fn then_hang(mut self) -> Self {
        self.ending = BodyEnding::Hang;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug)]
pub enum ScriptStep {
    Respond(ScriptedResponse),
    Fail(CacheError),
}

type Responder = Arc<dyn Fn(&OutboundRequest) -> ScriptStep + Send + Sync>;

#[derive(Debug, Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Held by a request until its body stream is dropped
struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn enter(counter: Arc<InFlight>) -> Self {
        let now = counter.current.fetch_add(1, Ordering::SeqCst) + 1;
        counter.peak.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Transport answering from scripted steps, recording every request.
///
/// Queued steps are consumed first; once a kind's queue is empty its responder
/// answers, and without one the request fails as transient.
#[derive(Default)]
pub struct ScriptedTransport {
    queues: Mutex<HashMap<RequestKind, VecDeque<ScriptStep>>>,
    responders: Mutex<HashMap<RequestKind, Responder>>,
    recorded: Mutex<Vec<RecordedRequest>>,
    probes: Arc<InFlight>,
    downloads: Arc<InFlight>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A well-behaved range-capable server holding `data`
    pub fn serving(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let transport = Self::new();
        let probe_data = data.clone();
        transport.respond_with(RequestKind::Probe, move |request| {
            serve_probe(&probe_data, request)
        });
        transport.respond_with(RequestKind::Download, move |request| {
            serve_download(&data, request, 64 * 1024)
        });
        transport
    }

    pub fn push(&self, kind: RequestKind, step: ScriptStep) -> &Self {
        self.queues.lock().entry(kind).or_default().push_back(step);
        self
    }

    pub fn respond_with(
        &self,
        kind: RequestKind,
        responder: impl Fn(&OutboundRequest) -> ScriptStep + Send + Sync + 'static,
    ) -> &Self {
        self.responders.lock().insert(kind, Arc::new(responder));
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.recorded.lock().clone()
    }

    pub fn requests_of(&self, kind: RequestKind) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|recorded| recorded.kind == kind)
            .collect()
    }

    pub fn peak_in_flight(&self, kind: RequestKind) -> usize {
        self.counter(kind).peak.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self, kind: RequestKind) -> usize {
        self.counter(kind).current.load(Ordering::SeqCst)
    }

    fn counter(&self, kind: RequestKind) -> &Arc<InFlight> {
        match kind {
            RequestKind::Probe => &self.probes,
            RequestKind::Download => &self.downloads,
        }
    }

    fn next_step(&self, kind: RequestKind, request: &OutboundRequest) -> ScriptStep {
        if let Some(step) = self
            .queues
            .lock()
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
        {
            return step;
        }
        let responder = self.responders.lock().get(&kind).cloned();
        match responder {
            Some(responder) => responder(request),
            None => ScriptStep::Fail(CacheError::Transient(format!(
                "no scripted response for {:?} {}",
                request.method, request.url
            ))),
        }
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: OutboundRequest) -> CacheResult<TransportResponse> {
        let kind = RequestKind::of(&request);
        let guard = InFlightGuard::enter(self.counter(kind).clone());
        self.recorded.lock().push(RecordedRequest {
            request: request.clone(),
            kind,
            at: Instant::now(),
        });

        let response = match self.next_step(kind, &request) {
            ScriptStep::Fail(err) => return Err(err),
            ScriptStep::Respond(response) => response,
        };
        if !response.delay.is_zero() {
            tokio::time::sleep(response.delay).await;
        }

        let head = stream::iter(response.chunks.into_iter().map(Ok));
        let tail: BodyStream = match response.ending {
            BodyEnding::Complete => stream::empty::<CacheResult<Bytes>>().boxed(),
            BodyEnding::Error(err) => stream::once(async move { Err(err) }).boxed(),
            BodyEnding::Hang => stream::pending::<CacheResult<Bytes>>().boxed(),
            BodyEnding::Channel(receiver) => stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|item| (item, receiver))
            })
            .boxed(),
        };
        let body = head
            .chain(tail)
            .map(move |item| {
                let _held = &guard;
                item
            })
            .boxed();

        Ok(TransportResponse {
            status: response.status,
            headers: response.headers,
            body,
        })
    }
}

/// Probe answer from a range-capable server
pub fn serve_probe(data: &Bytes, request: &OutboundRequest) -> ScriptStep {
    let total = data.len() as u64;
    let response = match request.range {
        None => ScriptedResponse::new(200)
            .header("content-length", total.to_string())
            .header("content-type", "video/mp4")
            .header("accept-ranges", "bytes"),
        Some(ByteRange { start, end }) => {
            let last = end.unwrap_or(total.saturating_sub(1)).min(total.saturating_sub(1));
            ScriptedResponse::new(206)
                .header("content-type", "video/mp4")
                .header("content-range", format!("bytes {}-{}/{}", start, last, total))
                .body(data.slice(start as usize..=last as usize))
        }
    };
    ScriptStep::Respond(response)
}

/// Full-body answer honouring an open `Range` like a real server would
pub fn serve_download(data: &Bytes, request: &OutboundRequest, chunk_size: usize) -> ScriptStep {
    let total = data.len() as u64;
    let start = request.range.map(|range| range.start).unwrap_or(0);
    if start >= total && request.range.is_some() {
        return ScriptStep::Respond(
            ScriptedResponse::new(416).header("content-range", format!("bytes */{}", total)),
        );
    }

    let slice = &data[start as usize..];
    let response = if request.range.is_some() {
        ScriptedResponse::new(206).header(
            "content-range",
            format!("bytes {}-{}/{}", start, total - 1, total),
        )
    } else {
        ScriptedResponse::new(200)
    };
    ScriptStep::Respond(
        response
            .header("content-length", slice.len().to_string())
            .header("content-type", "video/mp4")
            .chunked_body(slice, chunk_size),
    )
}

/// Deterministic test payload
pub fn test_payload(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

/// Poll `condition` until it holds, yielding to other tasks in between
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

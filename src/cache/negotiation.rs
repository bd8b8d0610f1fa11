use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::errors::{CacheError, CacheResult};
use super::metadata::{ByteRange, MimeLookup, ProbeResponse, ResourceMetadata};
use super::request::{MetadataReply, RequestId};
use super::state_machine::ActiveTask;
use super::transport::{HttpMethod, HttpTransport, OutboundRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// `HEAD` request
    Head,
    /// `GET` with `Range: bytes=0-1`, read only for its headers
    RangeFallback,
}

/// What to do with a probe response
#[derive(Debug, Clone)]
pub enum NegotiationStep {
    /// Reissue the probe as a ranged GET
    Fallback,
    Resolved(ResourceMetadata),
    Failed(CacheError),
}

/// Metadata negotiation shared by every waiting consumer.
///
/// The phase moves from `Head` to `RangeFallback` at most once.
#[derive(Debug)]
pub struct NegotiationRequest {
    phase: NegotiationPhase,
    did_fallback: bool,
    waiters: Vec<(RequestId, MetadataReply)>,
    pub task: Option<ActiveTask>,
    pub retry_count: u32,
}

impl Default for NegotiationRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl NegotiationRequest {
    pub fn new() -> Self {
        Self {
            phase: NegotiationPhase::Head,
            did_fallback: false,
            waiters: Vec::new(),
            task: None,
            retry_count: 0,
        }
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub(crate) fn add_waiter(&mut self, id: RequestId, reply: MetadataReply) {
        self.waiters.push((id, reply));
    }

    /// Detach one waiter, answering it as cancelled. The negotiation keeps going.
    pub fn cancel_waiter(&mut self, id: RequestId) -> bool {
        match self.waiters.iter().position(|(waiter, _)| *waiter == id) {
            Some(index) => {
                let (_, reply) = self.waiters.swap_remove(index);
                let _ = reply.send(Err(CacheError::Cancelled));
                true
            }
            None => false,
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Request for the current phase with custom headers merged in
    pub fn outbound_request(&self, url: &str, headers: &HashMap<String, String>) -> OutboundRequest {
        let request = match self.phase {
            NegotiationPhase::Head => OutboundRequest::new(HttpMethod::Head, url),
            NegotiationPhase::RangeFallback => {
                OutboundRequest::new(HttpMethod::Get, url).with_range(ByteRange::bounded(0, 1))
            }
        };
        request.with_headers(headers)
    }

    /// Decide the next step for a probe response, switching phase when falling back
    pub fn evaluate(
        &mut self,
        probe: ProbeResponse,
        url: &str,
        mime_lookup: Option<&dyn MimeLookup>,
    ) -> NegotiationStep {
        let needs_fallback = probe.is_error() || probe.resolved_length() == -1;

        if needs_fallback && !self.did_fallback {
            info!(
                "Negotiation {:?} answered {} without usable length, falling back to ranged GET",
                self.phase, probe.status
            );
            self.did_fallback = true;
            self.phase = NegotiationPhase::RangeFallback;
            return NegotiationStep::Fallback;
        }

        if probe.is_error() {
            warn!("Negotiation fallback answered {}, giving up", probe.status);
            return NegotiationStep::Failed(CacheError::ServerError {
                status: probe.status,
            });
        }

        let metadata = probe.into_metadata(url, mime_lookup);
        debug!("Negotiated metadata: {:?}", metadata);
        NegotiationStep::Resolved(metadata)
    }

    /// Answer every waiter with the same result
    pub fn resolve_all(&mut self, result: CacheResult<ResourceMetadata>) {
        for (id, reply) in self.waiters.drain(..) {
            debug!("Resolving metadata waiter {}", id);
            let _ = reply.send(result.clone());
        }
    }

    /// Drop every waiter without answering
    pub fn abandon(&mut self) {
        self.waiters.clear();
    }

    pub fn cancel_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.cancel();
        }
    }
}

/// Issue one probe and read only its headers
pub async fn run_probe(
    transport: Arc<dyn HttpTransport>,
    request: OutboundRequest,
    token: CancellationToken,
) -> CacheResult<ProbeResponse> {
    let response = tokio::select! {
        _ = token.cancelled() => return Err(CacheError::Cancelled),
        response = transport.execute(request) => response?,
    };

    // The body of a 2-byte probe is irrelevant; dropping the stream releases the connection
    Ok(ProbeResponse::from_headers(response.status, &response.headers))
}

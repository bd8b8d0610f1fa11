use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE};
use std::time::Duration;
use tracing::{debug, warn};

use super::errors::{CacheError, CacheResult};
use super::metadata::ByteRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Head,
    Get,
}

/// One outbound network call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: HttpMethod,
    pub url: String,
    pub range: Option<ByteRange>,
    /// Custom headers merged into the request
    pub headers: Vec<(String, String)>,
}

impl OutboundRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            range: None,
            headers: Vec::new(),
        }
    }

    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_headers<'a>(mut self, headers: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

pub type BodyStream = BoxStream<'static, CacheResult<Bytes>>;

/// Response headers plus a lazily consumed body
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Network seam used by the coordinator for every outbound call
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send the request and return once response headers are available
    async fn execute(&self, request: OutboundRequest) -> CacheResult<TransportResponse>;
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(request_timeout: Duration) -> CacheResult<Self> {
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .read_timeout(request_timeout)
            .build()
            .map_err(|e| CacheError::Transient(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn map_reqwest_error(err: reqwest::Error) -> CacheError {
    if let Some(status) = err.status() {
        return CacheError::ServerError {
            status: status.as_u16(),
        };
    }
    CacheError::Transient(err.to_string())
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: OutboundRequest) -> CacheResult<TransportResponse> {
        let mut builder = match request.method {
            HttpMethod::Head => self.client.head(&request.url),
            HttpMethod::Get => self.client.get(&request.url),
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!("Skipping invalid custom header {:?}", name),
            }
        }
        if let Some(range) = request.range {
            let value = HeaderValue::from_str(&range.to_string())
                .map_err(|e| CacheError::Transient(format!("Invalid range header: {}", e)))?;
            headers.insert(RANGE, value);
        }
        builder = builder.headers(headers);

        debug!(
            "Sending {:?} {} (range: {:?})",
            request.method, request.url, request.range
        );
        let response = builder.send().await.map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(map_reqwest_error))
            .boxed();

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

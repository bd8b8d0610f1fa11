use reqwest::header::{self, HeaderMap};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Resource metadata resolved by negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub mime_type: String,
    /// Total resource length in bytes, -1 when unknown
    pub content_length: i64,
    pub range_supported: bool,
}

/// MIME type lookup for when the server sends no Content-Type
pub trait MimeLookup: Send + Sync {
    fn mime_type_for(&self, url: &str) -> Option<String>;
}

impl<F> MimeLookup for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn mime_type_for(&self, url: &str) -> Option<String> {
        self(url)
    }
}

pub type SharedMimeLookup = Arc<dyn MimeLookup>;

/// Value of an outbound `Range` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// `bytes=<start>-`
    pub fn open(start: u64) -> Self {
        Self { start, end: None }
    }

    /// `bytes=<start>-<end>`, end inclusive
    pub fn bounded(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "bytes={}-{}", self.start, end),
            None => write!(f, "bytes={}-", self.start),
        }
    }
}

/// Parsed `Content-Range` response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// (start, end) inclusive; `None` for `bytes */<total>`
    pub range: Option<(u64, u64)>,
    /// `None` for `bytes <s>-<e>/*`
    pub total: Option<u64>,
}

impl ContentRange {
    /// Parse `bytes <start>-<end>/<total>` or `bytes */<total>`
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (range_part, total_part) = rest.split_once('/')?;

        let total = match total_part.trim() {
            "*" => None,
            t => Some(t.parse::<u64>().ok()?),
        };

        let range = match range_part.trim() {
            "*" => None,
            r => {
                let (start, end) = r.split_once('-')?;
                let start = start.trim().parse::<u64>().ok()?;
                let end = end.trim().parse::<u64>().ok()?;
                if start > end {
                    return None;
                }
                Some((start, end))
            }
        };

        if range.is_none() && total.is_none() {
            return None;
        }

        Some(Self { range, total })
    }

    /// Range start, -1 when the header carries no range
    pub fn start_or_unknown(this: Option<&Self>) -> i64 {
        this.and_then(|cr| cr.range)
            .map(|(start, _)| start as i64)
            .unwrap_or(-1)
    }
}

/// The response headers negotiation and download care about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub content_range: Option<ContentRange>,
    pub accepts_byte_ranges: bool,
}

impl ProbeResponse {
    pub fn from_headers(status: u16, headers: &HeaderMap) -> Self {
        let text = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let content_type = text(header::CONTENT_TYPE)
            .map(|ct| ct.split(';').next().unwrap_or_default().trim().to_string())
            .filter(|ct| !ct.is_empty());
        let content_length = text(header::CONTENT_LENGTH).and_then(|v| v.trim().parse().ok());
        let content_range = text(header::CONTENT_RANGE).and_then(|v| ContentRange::parse(&v));
        let accepts_byte_ranges = text(header::ACCEPT_RANGES)
            .map(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")))
            .unwrap_or(false);

        Self {
            status,
            content_type,
            content_length,
            content_range,
            accepts_byte_ranges,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status >= 400
    }

    /// Total resource length, -1 when it cannot be determined.
    ///
    /// A 206 body length is only the probed slice, so it never counts as the total.
    pub fn resolved_length(&self) -> i64 {
        if let Some(total) = self.content_range.and_then(|cr| cr.total) {
            return total as i64;
        }
        if self.status != 206
            && let Some(length) = self.content_length
        {
            return length as i64;
        }
        -1
    }

    pub fn range_supported(&self) -> bool {
        self.accepts_byte_ranges || self.status == 206 || self.content_range.is_some()
    }

    pub fn into_metadata(self, url: &str, mime_lookup: Option<&dyn MimeLookup>) -> ResourceMetadata {
        let content_length = self.resolved_length();
        let range_supported = self.range_supported();
        let mime_type = self
            .content_type
            .or_else(|| mime_lookup.and_then(|lookup| lookup.mime_type_for(url)))
            .unwrap_or_else(|| OCTET_STREAM.to_string());

        ResourceMetadata {
            mime_type,
            content_length,
            range_supported,
        }
    }
}

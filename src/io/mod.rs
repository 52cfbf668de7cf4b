mod http;
mod local;
mod memory;

pub use http::HttpRangeSource;
pub use local::LocalFileSource;
pub use memory::MemorySource;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{Error, Result};

/// Byte range of a remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// The last `n` bytes of the resource.
    Suffix(u64),
    /// Bytes `start..end` (end exclusive).
    Span { start: u64, end: u64 },
}

impl ByteRange {
    pub fn span(start: u64, end: u64) -> Self {
        ByteRange::Span { start, end }
    }

    /// Value for an HTTP `Range` header (inclusive end).
    pub fn header_value(&self) -> String {
        match *self {
            ByteRange::Suffix(n) => format!("bytes=-{n}"),
            ByteRange::Span { start, end } => format!("bytes={}-{}", start, end.saturating_sub(1)),
        }
    }
}

/// Answer to a range request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeResponse {
    /// `206 Partial Content`. `total` is the resource length from
    /// `Content-Range`, when the server reports it.
    Partial {
        start: u64,
        total: Option<u64>,
        body: Vec<u8>,
    },
    /// The server ignored the range and sent the whole resource.
    Full { body: Vec<u8> },
}

impl RangeResponse {
    pub fn body(&self) -> &[u8] {
        match self {
            RangeResponse::Partial { body, .. } | RangeResponse::Full { body } => body,
        }
    }
}

/// Random access to a single archive, one request at a time.
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Request a byte range.
    async fn fetch(&self, range: ByteRange) -> Result<RangeResponse>;

    /// Download the whole resource.
    async fn fetch_all(&self) -> Result<Vec<u8>>;

    /// Payload bytes received so far.
    fn transferred_bytes(&self) -> u64 {
        0
    }

    /// Human readable location, used in log lines.
    fn describe(&self) -> String;
}

/// Issue `range`, turning an expired `timeout` into a network error.
pub(crate) async fn fetch_with_timeout(
    source: &dyn RangeSource,
    range: ByteRange,
    timeout: Option<Duration>,
) -> Result<RangeResponse> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, source.fetch(range))
            .await
            .map_err(|_| {
                Error::network(format!(
                    "{} timed out after {limit:?} for {}",
                    source.describe(),
                    range.header_value()
                ))
            })?,
        None => source.fetch(range).await,
    }
}

/// Issue a span request and insist on receiving exactly that span.
///
/// A server that ignores ranges is tolerated by slicing the full body; any
/// other length or offset disagreement is a network error rather than a
/// silently truncated result.
pub(crate) async fn fetch_exact(
    source: &dyn RangeSource,
    start: u64,
    end: u64,
    timeout: Option<Duration>,
) -> Result<Vec<u8>> {
    let expected = end.saturating_sub(start);
    match fetch_with_timeout(source, ByteRange::span(start, end), timeout).await? {
        RangeResponse::Partial {
            start: got_start,
            body,
            ..
        } => {
            if got_start != start || body.len() as u64 != expected {
                return Err(Error::network(format!(
                    "asked for {expected} bytes at {start}, got {} bytes at {got_start}",
                    body.len()
                )));
            }
            Ok(body)
        }
        RangeResponse::Full { body } => {
            if (body.len() as u64) < end {
                return Err(Error::network(format!(
                    "full response of {} bytes does not cover {start}..{end}",
                    body.len()
                )));
            }
            Ok(body[start as usize..end as usize].to_vec())
        }
    }
}

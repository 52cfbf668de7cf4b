use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{ByteRange, RangeResponse, RangeSource};
use crate::error::{Error, Result};

/// HTTP Range reader for remote ZIP files
pub struct HttpRangeSource {
    client: Client,
    url: String,
    transferred_bytes: AtomicU64,
}

impl HttpRangeSource {
    /// Create a source for `url`.
    ///
    /// No request is sent here; the archive length is learned from the
    /// first range response.
    pub fn new(url: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            url: url.into(),
            transferred_bytes: AtomicU64::new(0),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RangeSource for HttpRangeSource {
    async fn fetch(&self, range: ByteRange) -> Result<RangeResponse> {
        let value = range.header_value();
        debug!(url = %self.url, range = %value, "range request");

        let resp = self
            .client
            .get(&self.url)
            .header(header::RANGE, &value)
            .send()
            .await?;

        let status = resp.status();
        let content_range = resp
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        match status {
            StatusCode::PARTIAL_CONTENT => {
                let content_range = content_range.ok_or_else(|| {
                    Error::network("206 response without a Content-Range header")
                })?;
                let (start, total) = parse_content_range(&content_range).ok_or_else(|| {
                    Error::network(format!("malformed Content-Range: {content_range}"))
                })?;
                let body = resp.bytes().await?.to_vec();
                self.transferred_bytes
                    .fetch_add(body.len() as u64, Ordering::Relaxed);
                Ok(RangeResponse::Partial { start, total, body })
            }
            StatusCode::OK => {
                debug!(url = %self.url, "server ignored Range header");
                let body = resp.bytes().await?.to_vec();
                self.transferred_bytes
                    .fetch_add(body.len() as u64, Ordering::Relaxed);
                Ok(RangeResponse::Full { body })
            }
            other => Err(Error::network(format!(
                "HTTP request failed with status: {other}"
            ))),
        }
    }

    async fn fetch_all(&self) -> Result<Vec<u8>> {
        debug!(url = %self.url, "full download");
        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::network(format!(
                "HTTP request failed with status: {}",
                resp.status()
            )));
        }
        let body = resp.bytes().await?.to_vec();
        self.transferred_bytes
            .fetch_add(body.len() as u64, Ordering::Relaxed);
        Ok(body)
    }

    fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Parse `bytes start-end/total` into `(start, total)`. A total of `*`
/// yields `None`.
fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, total))
}

#[cfg(test)]
mod tests {
    use super::parse_content_range;

    #[test]
    fn parses_content_range() {
        assert_eq!(
            parse_content_range("bytes 9934464-9999999/10000000"),
            Some((9_934_464, Some(10_000_000)))
        );
        assert_eq!(parse_content_range("bytes 0-99/*"), Some((0, None)));
    }

    #[test]
    fn rejects_garbage_content_range() {
        assert_eq!(parse_content_range("items 0-1/2"), None);
        assert_eq!(parse_content_range("bytes 5-1/10"), None);
        assert_eq!(parse_content_range("bytes */10"), None);
    }
}

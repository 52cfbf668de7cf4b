use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{ByteRange, RangeResponse, RangeSource};
use crate::error::Result;

/// Archive held in memory.
///
/// The session switches to one of these after a server without range
/// support forced a full download, so the archive crosses the network once.
/// It can also imitate such a server (`ignoring_ranges`), and it keeps a log
/// of every request it answered.
pub struct MemorySource {
    data: Arc<[u8]>,
    honor_ranges: bool,
    label: String,
    requests: Mutex<Vec<ByteRange>>,
    full_downloads: AtomicU64,
    transferred_bytes: AtomicU64,
}

impl MemorySource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            data: data.into(),
            honor_ranges: true,
            label: "memory".to_string(),
            requests: Mutex::new(Vec::new()),
            full_downloads: AtomicU64::new(0),
            transferred_bytes: AtomicU64::new(0),
        }
    }

    /// Answer every range request with the full body, like a server that
    /// does not implement partial content.
    pub fn ignoring_ranges(mut self) -> Self {
        self.honor_ranges = false;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Range requests answered so far, oldest first.
    pub fn requests(&self) -> Vec<ByteRange> {
        self.requests
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Number of whole-archive downloads served.
    pub fn full_downloads(&self) -> u64 {
        self.full_downloads.load(Ordering::Relaxed)
    }

    fn record(&self, range: ByteRange) {
        if let Ok(mut log) = self.requests.lock() {
            log.push(range);
        }
    }
}

#[async_trait]
impl RangeSource for MemorySource {
    async fn fetch(&self, range: ByteRange) -> Result<RangeResponse> {
        self.record(range);

        let size = self.len();
        if !self.honor_ranges {
            self.full_downloads.fetch_add(1, Ordering::Relaxed);
            self.transferred_bytes.fetch_add(size, Ordering::Relaxed);
            return Ok(RangeResponse::Full {
                body: self.data.to_vec(),
            });
        }

        let (start, end) = match range {
            ByteRange::Suffix(n) => (size.saturating_sub(n), size),
            ByteRange::Span { start, end } => {
                let start = start.min(size);
                (start, end.clamp(start, size))
            }
        };
        let body = self.data[start as usize..end as usize].to_vec();
        self.transferred_bytes
            .fetch_add(body.len() as u64, Ordering::Relaxed);
        Ok(RangeResponse::Partial {
            start,
            total: Some(size),
            body,
        })
    }

    async fn fetch_all(&self) -> Result<Vec<u8>> {
        self.full_downloads.fetch_add(1, Ordering::Relaxed);
        self.transferred_bytes.fetch_add(self.len(), Ordering::Relaxed);
        Ok(self.data.to_vec())
    }

    fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

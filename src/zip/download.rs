//! Range fetch, decompression and verification of single entries.
//!
//! A download runs as a spawned task that fetches the entry's compressed
//! payload in segments of at most `segment_size` bytes. The first segment
//! also carries the local header, which is validated against the central
//! directory before any payload byte is trusted. Once the payload is
//! complete it is inflated in one pass, checked against the recorded size
//! and CRC-32, written to the cache and returned.
//!
//! Completed segments survive a pause or a dropped connection: the entry's
//! resume offset is the length of the completed segments, and a later
//! [`EntryDownloader::fetch_entry`] with that offset requests only the rest.
//! Cancellation throws the partial payload away.

use flate2::read::DeflateDecoder;
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheStore, Tier};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::io::{RangeSource, fetch_exact};

use super::parser::parse_local_header;
use super::structures::*;

/// Lifecycle of a [`DownloadTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    InFlight,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Cancel,
}

/// Payload retrieved by an interrupted download.
struct Partial {
    data_offset: u64,
    compressed: Vec<u8>,
}

struct Inner {
    archive_url: String,
    source: Arc<dyn RangeSource>,
    cache: Arc<CacheStore>,
    segment_size: u64,
    timeout: Option<Duration>,
    tier: Tier,
    partials: Mutex<HashMap<String, Partial>>,
}

impl Inner {
    fn partials(&self) -> MutexGuard<'_, HashMap<String, Partial>> {
        self.partials.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the stored partial payload for `path`, cut to `resume_offset`.
    fn take_partial(&self, path: &str, resume_offset: u64) -> Option<Partial> {
        let mut partial = self.partials().remove(path)?;
        if resume_offset == 0 {
            return None;
        }
        if (partial.compressed.len() as u64) < resume_offset {
            debug!(
                path,
                resume_offset,
                stored = partial.compressed.len(),
                "partial payload shorter than resume offset, starting over"
            );
            return None;
        }
        partial.compressed.truncate(resume_offset as usize);
        Some(partial)
    }
}

/// Starts entry downloads for one archive.
#[derive(Clone)]
pub struct EntryDownloader {
    inner: Arc<Inner>,
}

impl EntryDownloader {
    pub fn new(
        archive_url: impl Into<String>,
        source: Arc<dyn RangeSource>,
        cache: Arc<CacheStore>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                archive_url: archive_url.into(),
                source,
                cache,
                segment_size: config.segment_size.max(1),
                timeout: config.request_timeout,
                tier: config.entry_tier,
                partials: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start downloading `entry`, skipping the first `resume_offset`
    /// compressed bytes if an earlier attempt retrieved them.
    ///
    /// Must be called from within a Tokio runtime. Identical concurrent
    /// requests are not merged; each call starts its own task.
    pub fn fetch_entry(&self, entry: &ZipEntry, resume_offset: u64) -> DownloadTask {
        let (control_tx, control_rx) = watch::channel(Control::Run);
        let (state_tx, state_rx) = watch::channel(TaskState::Pending);
        let received = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            inner: Arc::clone(&self.inner),
            entry: entry.clone(),
            resume_offset: resume_offset.min(entry.compressed_size),
            control: control_rx,
            state: state_tx,
            received: Arc::clone(&received),
        };
        let join = tokio::spawn(worker.run());

        DownloadTask {
            handle: TaskHandle {
                path: entry.path.clone(),
                control: Arc::new(control_tx),
                state: state_rx,
                received,
            },
            join,
        }
    }

    /// Compressed bytes retained from an interrupted download of `path`.
    pub fn resume_offset(&self, path: &str) -> u64 {
        self.inner
            .partials()
            .get(path)
            .map(|p| p.compressed.len() as u64)
            .unwrap_or(0)
    }

    /// Forget the payload of an interrupted download. Returns whether there
    /// was one.
    pub fn discard_partial(&self, path: &str) -> bool {
        self.inner.partials().remove(path).is_some()
    }
}

/// Cloneable control surface of a running download.
#[derive(Clone)]
pub struct TaskHandle {
    path: String,
    control: Arc<watch::Sender<Control>>,
    state: watch::Receiver<TaskState>,
    received: Arc<AtomicU64>,
}

impl TaskHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Compressed payload bytes held by the task.
    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Suspend after dropping the segment in flight, if any.
    pub fn pause(&self) {
        self.control.send_if_modified(|c| {
            if *c == Control::Run {
                *c = Control::Pause;
                true
            } else {
                false
            }
        });
    }

    pub fn resume(&self) {
        self.control.send_if_modified(|c| {
            if *c == Control::Pause {
                *c = Control::Run;
                true
            } else {
                false
            }
        });
    }

    /// Stop the task for good and discard its partial payload.
    pub fn cancel(&self) {
        self.control.send_replace(Control::Cancel);
    }

    /// Wait until the state satisfies `pred`, or the task has ended.
    pub async fn wait_for_state(&mut self, pred: impl Fn(TaskState) -> bool) -> TaskState {
        let waited = self.state.wait_for(|s| pred(*s)).await.map(|state| *state);
        match waited {
            Ok(state) => state,
            Err(_) => *self.state.borrow(),
        }
    }
}

/// A spawned entry download. Resolves exactly once.
pub struct DownloadTask {
    handle: TaskHandle,
    join: JoinHandle<Result<Arc<[u8]>>>,
}

impl DownloadTask {
    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    pub fn path(&self) -> &str {
        self.handle.path()
    }

    pub fn state(&self) -> TaskState {
        self.handle.state()
    }

    pub fn bytes_received(&self) -> u64 {
        self.handle.bytes_received()
    }

    pub fn pause(&self) {
        self.handle.pause();
    }

    pub fn resume(&self) {
        self.handle.resume();
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub async fn wait_for_state(&mut self, pred: impl Fn(TaskState) -> bool) -> TaskState {
        self.handle.wait_for_state(pred).await
    }

    /// Decompressed, verified contents, or the reason there are none.
    pub async fn wait(self) -> Result<Arc<[u8]>> {
        match self.join.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(Error::Cancelled(self.handle.path)),
        }
    }
}

struct Worker {
    inner: Arc<Inner>,
    entry: ZipEntry,
    resume_offset: u64,
    control: watch::Receiver<Control>,
    state: watch::Sender<TaskState>,
    received: Arc<AtomicU64>,
}

impl Worker {
    async fn run(mut self) -> Result<Arc<[u8]>> {
        let result = self.download().await;
        let path = &self.entry.path;
        let state = match &result {
            Ok(data) => {
                info!(path = %path, bytes = data.len(), "entry downloaded");
                TaskState::Completed
            }
            Err(Error::Cancelled(_)) => {
                debug!(path = %path, "entry download cancelled");
                TaskState::Cancelled
            }
            Err(err) => {
                warn!(path = %path, "entry download failed: {err}");
                TaskState::Failed
            }
        };
        self.state.send_replace(state);
        result
    }

    async fn download(&mut self) -> Result<Arc<[u8]>> {
        let entry = self.entry.clone();
        let entry = &entry;
        if entry.is_encrypted() {
            return Err(Error::Encrypted(entry.path.clone()));
        }
        if let CompressionMethod::Unsupported(method) = entry.compression_method {
            return Err(Error::UnsupportedCompression {
                path: entry.path.clone(),
                method,
            });
        }

        let (mut data_offset, mut compressed) =
            match self.inner.take_partial(&entry.path, self.resume_offset) {
                Some(partial) => {
                    debug!(
                        path = %entry.path,
                        offset = partial.compressed.len(),
                        "resuming entry download"
                    );
                    (Some(partial.data_offset), partial.compressed)
                }
                None => (None, Vec::new()),
            };
        self.received
            .store(compressed.len() as u64, Ordering::Relaxed);

        let mut control_open = true;
        while data_offset.is_none() || (compressed.len() as u64) < entry.compressed_size {
            if !self
                .await_run(&mut control_open, data_offset, &compressed)
                .await
            {
                self.inner.partials().remove(&entry.path);
                return Err(Error::Cancelled(entry.path.clone()));
            }
            self.state.send_replace(TaskState::InFlight);

            let segment = fetch_segment(&self.inner, entry, data_offset, compressed.len() as u64);
            let outcome = tokio::select! {
                res = segment => Some(res),
                changed = self.control.changed(), if control_open => {
                    if changed.is_err() {
                        control_open = false;
                    }
                    None
                }
            };

            match outcome {
                // Control changed mid-request; the segment is dropped and
                // the loop re-reads the control state.
                None => continue,
                Some(Ok((offset, payload))) => {
                    data_offset = Some(offset);
                    compressed.extend_from_slice(&payload);
                    self.received
                        .store(compressed.len() as u64, Ordering::Relaxed);
                }
                Some(Err(err)) => {
                    self.keep_partial(data_offset, &compressed);
                    return Err(err);
                }
            }
        }

        self.inner.partials().remove(&entry.path);
        let data: Arc<[u8]> = Arc::from(decompress(entry, compressed)?);

        let key = CacheKey::entry(self.inner.archive_url.as_str(), entry.path.as_str());
        self.inner
            .cache
            .put(&key, Arc::clone(&data), self.inner.tier)
            .await;
        Ok(data)
    }

    /// Record the payload retrieved so far for a later resume. A cancelled
    /// task records nothing. The control state is read under the partials
    /// lock so a concurrent cancel-and-discard cannot be undone.
    fn keep_partial(&self, data_offset: Option<u64>, compressed: &[u8]) {
        let mut partials = self.inner.partials();
        let cancelled = *self.control.borrow() == Control::Cancel;
        match data_offset {
            Some(data_offset) if !cancelled && !compressed.is_empty() => {
                partials.insert(
                    self.entry.path.clone(),
                    Partial {
                        data_offset,
                        compressed: compressed.to_vec(),
                    },
                );
            }
            _ => {
                partials.remove(&self.entry.path);
            }
        }
    }

    /// Block while paused. Returns `false` once the task is cancelled.
    async fn await_run(
        &mut self,
        control_open: &mut bool,
        data_offset: Option<u64>,
        compressed: &[u8],
    ) -> bool {
        loop {
            let current = *self.control.borrow_and_update();
            match current {
                Control::Run => return true,
                Control::Cancel => return false,
                Control::Pause => {
                    self.keep_partial(data_offset, compressed);
                    self.state.send_replace(TaskState::Paused);
                    debug!(
                        path = %self.entry.path,
                        offset = compressed.len(),
                        "entry download paused"
                    );
                    if !*control_open || self.control.changed().await.is_err() {
                        // Nobody is left to resume us.
                        return false;
                    }
                }
            }
        }
    }
}

/// Fetch the next segment. Returns the payload's start offset in the
/// archive together with the new payload bytes.
async fn fetch_segment(
    inner: &Inner,
    entry: &ZipEntry,
    data_offset: Option<u64>,
    have: u64,
) -> Result<(u64, Vec<u8>)> {
    let source = inner.source.as_ref();
    let remaining = entry.compressed_size.saturating_sub(have);
    let want = remaining.min(inner.segment_size);

    let past_end = || Error::inconsistent(&entry.path, "entry extends past the addressable range");

    if let Some(data_start) = data_offset {
        let start = data_start.checked_add(have).ok_or_else(past_end)?;
        let end = start.checked_add(want).ok_or_else(past_end)?;
        let payload = fetch_exact(source, start, end, inner.timeout).await?;
        return Ok((data_start, payload));
    }

    // No validated header yet: request it together with the first segment.
    let lho = entry.local_header_offset;
    let head_end = lho
        .checked_add(entry.header_estimate())
        .and_then(|v| v.checked_add(want))
        .ok_or_else(past_end)?;
    let mut head = fetch_exact(source, lho, head_end, inner.timeout).await?;

    let fixed = LocalFileHeader::from_bytes(&head)
        .ok_or_else(|| Error::inconsistent(&entry.path, "no local header signature"))?;
    let header_len = fixed.header_len();
    let needed = header_len.checked_add(want).ok_or_else(past_end)?;
    if (head.len() as u64) < needed {
        // The local extra field is longer than the central one.
        let have_len = head.len() as u64;
        let more_end = lho.checked_add(needed).ok_or_else(past_end)?;
        let more = fetch_exact(source, lho + have_len, more_end, inner.timeout).await?;
        head.extend_from_slice(&more);
    }

    let header = parse_local_header(entry, &head)?
        .ok_or_else(|| Error::inconsistent(&entry.path, "truncated local header"))?;
    if header.flags & FLAG_DATA_DESCRIPTOR == 0 && header.crc32 != entry.crc32 {
        return Err(Error::inconsistent(
            &entry.path,
            format!(
                "local CRC-32 {:#010x} differs from central {:#010x}",
                header.crc32, entry.crc32
            ),
        ));
    }

    let mut payload = head.split_off(header_len as usize);
    // A shorter header than estimated leaves extra payload bytes; keep them.
    payload.truncate(remaining as usize);
    Ok((lho + header_len, payload))
}

/// Inflate (or copy) the payload and verify size and CRC-32.
fn decompress(entry: &ZipEntry, compressed: Vec<u8>) -> Result<Vec<u8>> {
    let data = match entry.compression_method {
        CompressionMethod::Stored => compressed,
        CompressionMethod::Deflated => {
            let capacity = entry.uncompressed_size.min(64 * 1024 * 1024) as usize;
            let mut out = Vec::with_capacity(capacity);
            DeflateDecoder::new(&compressed[..])
                .read_to_end(&mut out)
                .map_err(|e| Error::Inflate {
                    path: entry.path.clone(),
                    reason: e.to_string(),
                })?;
            out
        }
        CompressionMethod::Unsupported(method) => {
            return Err(Error::UnsupportedCompression {
                path: entry.path.clone(),
                method,
            });
        }
    };

    if data.len() as u64 != entry.uncompressed_size {
        return Err(Error::SizeMismatch {
            path: entry.path.clone(),
            expected: entry.uncompressed_size,
            actual: data.len() as u64,
        });
    }

    let actual = crc32fast::hash(&data);
    if actual != entry.crc32 {
        return Err(Error::ChecksumMismatch {
            path: entry.path.clone(),
            expected: entry.crc32,
            actual,
        });
    }

    Ok(data)
}

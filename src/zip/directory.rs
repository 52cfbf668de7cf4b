//! Locating and fetching the central directory of a remote archive.
//!
//! The fetch costs one request in the common case: the archive's last
//! 64 KiB normally holds the EOCD record and the whole central directory.
//! A second request is issued only when the directory is larger than that
//! window, and a third only if the EOCD was not in the first window at all.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::io::{ByteRange, RangeResponse, RangeSource, fetch_exact, fetch_with_timeout};

use super::parser::{locate_eocd, parse_central_directory};
use super::structures::*;

/// Result of a directory fetch.
pub struct FetchedDirectory {
    pub directory: ArchiveDirectory,
    /// The whole archive, when the server ignored the range request and sent
    /// it in full. Entries can then be served without further requests.
    pub archive: Option<Arc<[u8]>>,
}

/// Bytes at the end of the archive.
struct Tail {
    start: u64,
    bytes: Vec<u8>,
    archive_length: u64,
    full: bool,
}

impl Tail {
    fn end(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }

    fn slice(&self, start: u64, end: u64) -> Option<&[u8]> {
        if start < self.start || end > self.end() || start > end {
            return None;
        }
        Some(&self.bytes[(start - self.start) as usize..(end - self.start) as usize])
    }
}

/// Central directory location as described by the EOCD (or ZIP64 EOCD).
struct Layout {
    cd_offset: u64,
    cd_size: u64,
    total_entries: u64,
    /// Actual position of the record that follows the central directory.
    cd_end: u64,
}

pub struct DirectoryFetcher {
    source: Arc<dyn RangeSource>,
    tail_window: u64,
    max_tail_window: u64,
    timeout: Option<Duration>,
}

impl DirectoryFetcher {
    pub fn new(source: Arc<dyn RangeSource>, config: &SessionConfig) -> Self {
        Self {
            source,
            tail_window: config.tail_window.max(EndOfCentralDirectory::SIZE as u64),
            max_tail_window: config.max_tail_window,
            timeout: config.request_timeout,
        }
    }

    /// Fetch and parse the central directory.
    ///
    /// Either every record parses or the whole fetch fails; no partial
    /// directory is ever returned.
    pub async fn fetch_directory(&self) -> Result<FetchedDirectory> {
        let mut tail = self.fetch_tail(self.tail_window).await?;
        let mut found = locate_eocd(&tail.bytes);

        if found.is_none() && tail.start > 0 && self.max_tail_window > self.tail_window {
            debug!(
                window = self.max_tail_window,
                "EOCD not in first window, retrying with a larger one"
            );
            tail = self.fetch_tail(self.max_tail_window).await?;
            found = locate_eocd(&tail.bytes);
        }

        let pos = found.ok_or(Error::DirectoryNotFound)?;
        let eocd = EndOfCentralDirectory::from_bytes(&tail.bytes[pos..])?;
        let eocd_offset = tail.start + pos as u64;

        let layout = if eocd.is_zip64() {
            self.zip64_layout(&tail, eocd_offset).await?
        } else {
            Layout {
                cd_offset: eocd.cd_offset as u64,
                cd_size: eocd.cd_size as u64,
                total_entries: eocd.total_entries as u64,
                cd_end: eocd_offset,
            }
        };

        if layout.total_entries == 0 {
            return Err(Error::CorruptDirectory("archive has no entries".into()));
        }

        // Bytes prepended to the archive (self-extractor stubs and the like)
        // shift everything relative to the offsets the EOCD records.
        let recorded_end = layout
            .cd_offset
            .checked_add(layout.cd_size)
            .ok_or_else(|| Error::CorruptDirectory("central directory overflows".into()))?;
        let bias = layout.cd_end.checked_sub(recorded_end).ok_or_else(|| {
            Error::CorruptDirectory(format!(
                "central directory ends at {recorded_end}, past its trailer at {}",
                layout.cd_end
            ))
        })?;
        if bias > 0 {
            debug!(bias, "archive has prepended data");
        }

        let cd_start = layout.cd_offset + bias;
        let cd_bytes = self
            .central_directory(&tail, cd_start, layout.cd_size)
            .await?;
        let entries = parse_central_directory(&cd_bytes, layout.total_entries, bias)?;
        check_entry_bounds(&entries, cd_start)?;

        info!(
            source = %self.source.describe(),
            entries = entries.len(),
            archive_length = tail.archive_length,
            "central directory loaded"
        );

        let directory = ArchiveDirectory {
            entries,
            archive_length: tail.archive_length,
            supports_ranges: !tail.full,
        };
        let archive = tail.full.then(|| Arc::from(tail.bytes));
        Ok(FetchedDirectory { directory, archive })
    }

    async fn fetch_tail(&self, window: u64) -> Result<Tail> {
        let response =
            fetch_with_timeout(self.source.as_ref(), ByteRange::Suffix(window), self.timeout)
                .await?;

        match response {
            RangeResponse::Partial { start, total, body } => {
                let end = start + body.len() as u64;
                let archive_length = total.unwrap_or(end);
                if end != archive_length || body.len() as u64 != window.min(archive_length) {
                    return Err(Error::network(format!(
                        "tail request for {window} bytes returned {} bytes at {start} of {archive_length}",
                        body.len()
                    )));
                }
                Ok(Tail {
                    start,
                    bytes: body,
                    archive_length,
                    full: false,
                })
            }
            RangeResponse::Full { body } => {
                warn!(
                    source = %self.source.describe(),
                    bytes = body.len(),
                    "server does not support range requests, using the full archive"
                );
                Ok(Tail {
                    start: 0,
                    archive_length: body.len() as u64,
                    bytes: body,
                    full: true,
                })
            }
        }
    }

    /// Bytes `start..end` of the archive, from the tail when it covers them.
    async fn read(&self, tail: &Tail, start: u64, end: u64) -> Result<Vec<u8>> {
        if let Some(bytes) = tail.slice(start, end) {
            return Ok(bytes.to_vec());
        }
        fetch_exact(self.source.as_ref(), start, end, self.timeout).await
    }

    async fn zip64_layout(&self, tail: &Tail, eocd_offset: u64) -> Result<Layout> {
        let locator_offset = eocd_offset
            .checked_sub(Zip64EOCDLocator::SIZE as u64)
            .ok_or_else(|| Error::CorruptDirectory("no room for ZIP64 locator".into()))?;
        let locator_bytes = self.read(tail, locator_offset, eocd_offset).await?;
        let locator = Zip64EOCDLocator::from_bytes(&locator_bytes)?;

        let recorded = locator.eocd64_offset;
        let adjacent = locator_offset
            .checked_sub(Zip64EOCD::MIN_SIZE as u64)
            .ok_or_else(|| Error::CorruptDirectory("no room for ZIP64 record".into()))?;
        if recorded > adjacent {
            return Err(Error::CorruptDirectory(
                "ZIP64 record overlaps its locator".into(),
            ));
        }

        // With prepended data the recorded offset is short by the prefix
        // length; the record then sits right before its locator.
        let mut record_offset = recorded;
        let mut record = Zip64EOCD::from_bytes(
            &self
                .read(tail, recorded, recorded + Zip64EOCD::MIN_SIZE as u64)
                .await?,
        );
        if record.is_err() && recorded != adjacent {
            record_offset = adjacent;
            record = Zip64EOCD::from_bytes(&self.read(tail, adjacent, locator_offset).await?);
        }
        let record = record?;

        Ok(Layout {
            cd_offset: record.cd_offset,
            cd_size: record.cd_size,
            total_entries: record.total_entries,
            cd_end: record_offset,
        })
    }

    async fn central_directory(&self, tail: &Tail, cd_start: u64, cd_size: u64) -> Result<Vec<u8>> {
        let cd_end = cd_start + cd_size;
        if let Some(bytes) = tail.slice(cd_start, cd_end) {
            return Ok(bytes.to_vec());
        }

        debug!(
            cd_start,
            cd_size, "central directory exceeds the tail window, fetching it"
        );
        let mut bytes = fetch_exact(
            self.source.as_ref(),
            cd_start,
            tail.archive_length,
            self.timeout,
        )
        .await?;
        bytes.truncate(cd_size as usize);
        Ok(bytes)
    }
}

/// Every entry's local header and payload must lie before the central
/// directory.
fn check_entry_bounds(entries: &[ZipEntry], cd_start: u64) -> Result<()> {
    for entry in entries {
        let data_end = entry
            .local_header_offset
            .checked_add(LFH_SIZE as u64)
            .and_then(|v| v.checked_add(entry.compressed_size));
        if data_end.is_none_or(|end| end > cd_start) {
            return Err(Error::CorruptDirectory(format!(
                "{} at offset {} extends past the central directory at {cd_start}",
                entry.path, entry.local_header_offset
            )));
        }
    }
    Ok(())
}

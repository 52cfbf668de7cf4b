use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{ByteRange, RangeResponse, RangeSource};
use crate::error::{Error, Result};

/// Local file reader with random access support
///
/// Behaves like a server that honours every range, which lets the CLI and
/// the session treat local archives exactly like remote ones.
pub struct LocalFileSource {
    file: Arc<std::fs::File>,
    path: PathBuf,
    size: u64,
}

impl LocalFileSource {
    pub fn new(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| local_error(path, e))?;
        let size = file.metadata().map_err(|e| local_error(path, e))?.len();
        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
            size,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    async fn read_span(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let file = Arc::clone(&self.file);
        let len = end.saturating_sub(start) as usize;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            read_exact_at(&file, &mut buf, start)?;
            Ok(buf)
        })
        .await
        .map_err(|e| Error::network(format!("read task failed: {e}")))?
        .map_err(|e| local_error(&path, e))
    }
}

#[async_trait]
impl RangeSource for LocalFileSource {
    async fn fetch(&self, range: ByteRange) -> Result<RangeResponse> {
        let (start, end) = match range {
            ByteRange::Suffix(n) => (self.size.saturating_sub(n), self.size),
            ByteRange::Span { start, end } => (start.min(self.size), end.min(self.size)),
        };
        let body = self.read_span(start, end).await?;
        Ok(RangeResponse::Partial {
            start,
            total: Some(self.size),
            body,
        })
    }

    async fn fetch_all(&self) -> Result<Vec<u8>> {
        self.read_span(0, self.size).await
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

fn local_error(path: &Path, err: std::io::Error) -> Error {
    Error::network(format!("{}: {err}", path.display()))
}

#[cfg(unix)]
fn read_exact_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(not(unix))]
fn read_exact_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    // Positional reads are unavailable, so seek a cloned handle instead.
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

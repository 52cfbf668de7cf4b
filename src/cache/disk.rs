use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

use super::{CacheItem, CacheKey, CacheLayer};
use crate::error::{Error, Result};

const DIRECTORY_FILE: &str = "directory.json";
const ENTRIES_DIR: &str = "entries";

/// Persistent tier: one file per key under `root`.
///
/// ```text
/// root/<sha256(archive url)>/directory.json
/// root/<sha256(archive url)>/entries/<sha256(entry path)>.bin
/// ```
///
/// File names are derived from the key alone, so a later process finds the
/// same file without an index. Writes go to a `.part` sibling first and are
/// renamed into place, so a reader never sees a half-written file.
pub struct DiskLayer {
    root: PathBuf,
}

impl DiskLayer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn archive_dir(&self, archive_url: &str) -> PathBuf {
        self.root.join(digest(archive_url))
    }

    /// Location of the file backing `key`.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        let dir = self.archive_dir(&key.archive_url);
        match &key.item {
            CacheItem::Directory => dir.join(DIRECTORY_FILE),
            CacheItem::Entry(path) => dir.join(ENTRIES_DIR).join(format!("{}.bin", digest(path))),
        }
    }
}

fn digest(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Whether `name` is one of the archive directories this layer creates.
fn is_archive_dir_name(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn cache_io(path: &Path, source: io::Error) -> Error {
    Error::CacheIo {
        path: path.to_path_buf(),
        source,
    }
}

async fn remove_dir_if_present(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(cache_io(path, e)),
    }
}

#[async_trait]
impl CacheLayer for DiskLayer {
    async fn get(&self, key: &CacheKey) -> Result<Option<Arc<[u8]>>> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(Arc::from(bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(cache_io(&path, e)),
        }
    }

    async fn put(&self, key: &CacheKey, bytes: Arc<[u8]>) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| cache_io(parent, e))?;
        }

        let tmp = path.with_extension("part");
        fs::write(&tmp, &bytes[..])
            .await
            .map_err(|e| cache_io(&tmp, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| cache_io(&path, e))
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(cache_io(&path, e)),
        }
    }

    async fn clear_archive(&self, archive_url: &str) -> Result<()> {
        remove_dir_if_present(&self.archive_dir(archive_url)).await
    }

    /// Remove every archive directory under the root. Anything else the
    /// root contains, and the root itself, is left alone.
    async fn clear(&self) -> Result<()> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(cache_io(&self.root, e)),
        };
        while let Some(child) = dir.next_entry().await.map_err(|e| cache_io(&self.root, e))? {
            let owned = child.file_name().to_str().is_some_and(is_archive_dir_name);
            let is_dir = child
                .file_type()
                .await
                .map_err(|e| cache_io(&child.path(), e))?
                .is_dir();
            if owned && is_dir {
                remove_dir_if_present(&child.path()).await?;
            }
        }
        Ok(())
    }
}

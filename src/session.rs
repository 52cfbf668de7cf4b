//! One remote archive: its directory, its downloads and its cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheStore};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::io::{HttpRangeSource, MemorySource, RangeSource};
use crate::zip::{
    ArchiveDirectory, DirectoryFetcher, DownloadTask, EntryDownloader, TaskHandle, ZipEntry,
};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    DirectoryLoading,
    DirectoryReady,
    /// Directory loaded and at least one entry download still running.
    EntryLoading,
}

struct Ready {
    directory: ArchiveDirectory,
    downloader: EntryDownloader,
}

/// Composition root for one archive URL.
///
/// Entries can only be loaded once [`load_directory`](Self::load_directory)
/// has succeeded; earlier calls fail with [`Error::DirectoryNotLoaded`]
/// without touching the network. Concurrent loads of the same entry are not
/// merged: check [`CacheStore`] or coalesce in the caller.
pub struct ArchiveSession {
    url: String,
    config: SessionConfig,
    cache: Arc<CacheStore>,
    /// The source the session was opened with. Transfer statistics come
    /// from here even after entries are served from memory.
    origin: Arc<dyn RangeSource>,
    source: RwLock<Arc<dyn RangeSource>>,
    ready: RwLock<Option<Ready>>,
    loading: AtomicBool,
    load_lock: tokio::sync::Mutex<()>,
    active: Mutex<HashMap<String, Vec<TaskHandle>>>,
}

impl ArchiveSession {
    /// Session over an HTTP(S) URL.
    pub fn open(url: impl Into<String>, config: SessionConfig) -> Result<Self> {
        let url = url.into();
        let source = HttpRangeSource::new(url.as_str(), config.request_timeout)?;
        Ok(Self::new(url, Arc::new(source), config))
    }

    /// `url` names the archive in cache keys; `source` serves its bytes.
    pub fn new(url: impl Into<String>, source: Arc<dyn RangeSource>, config: SessionConfig) -> Self {
        let cache = Arc::new(CacheStore::new(&config.cache));
        Self::with_cache(url, source, config, cache)
    }

    /// Like [`new`](Self::new), sharing a cache store with other sessions.
    pub fn with_cache(
        url: impl Into<String>,
        source: Arc<dyn RangeSource>,
        config: SessionConfig,
        cache: Arc<CacheStore>,
    ) -> Self {
        Self {
            url: url.into(),
            config,
            cache,
            origin: Arc::clone(&source),
            source: RwLock::new(source),
            ready: RwLock::new(None),
            loading: AtomicBool::new(false),
            load_lock: tokio::sync::Mutex::new(()),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn state(&self) -> SessionState {
        if self.read_ready().is_some() {
            if self.active_handles().values().flatten().next().is_some() {
                SessionState::EntryLoading
            } else {
                SessionState::DirectoryReady
            }
        } else if self.loading.load(Ordering::Acquire) {
            SessionState::DirectoryLoading
        } else {
            SessionState::Uninitialized
        }
    }

    /// Payload bytes received from the archive's source so far.
    pub fn transferred_bytes(&self) -> u64 {
        self.origin.transferred_bytes()
    }

    /// The loaded directory, if any.
    pub fn directory(&self) -> Option<ArchiveDirectory> {
        self.read_ready().as_ref().map(|r| r.directory.clone())
    }

    /// `(name, uncompressed size)` pairs in central directory order.
    pub fn entries(&self) -> Result<Vec<(String, u64)>> {
        let ready = self.read_ready();
        let ready = ready.as_ref().ok_or(Error::DirectoryNotLoaded)?;
        Ok(ready
            .directory
            .listing()
            .into_iter()
            .map(|(name, size)| (name.to_string(), size))
            .collect())
    }

    /// Load the central directory, from the cache when it has a copy.
    ///
    /// A second call after success returns the loaded directory without
    /// any I/O. A failure returns the session to
    /// [`SessionState::Uninitialized`].
    pub async fn load_directory(&self) -> Result<ArchiveDirectory> {
        let _guard = self.load_lock.lock().await;
        if let Some(directory) = self.directory() {
            return Ok(directory);
        }

        self.loading.store(true, Ordering::Release);
        let result = self.restore_or_fetch_directory().await;
        self.loading.store(false, Ordering::Release);
        let directory = result?;

        let downloader = EntryDownloader::new(
            self.url.as_str(),
            self.current_source(),
            Arc::clone(&self.cache),
            &self.config,
        );
        *self.write_ready() = Some(Ready {
            directory: directory.clone(),
            downloader,
        });
        Ok(directory)
    }

    async fn restore_or_fetch_directory(&self) -> Result<ArchiveDirectory> {
        let key = CacheKey::directory(self.url.as_str());
        if let Some(bytes) = self.cache.get(&key).await {
            match ArchiveDirectory::from_json(&bytes) {
                Ok(directory) => {
                    debug!(url = %self.url, entries = directory.len(), "directory restored from cache");
                    return Ok(directory);
                }
                Err(err) => {
                    warn!(url = %self.url, "discarding unreadable cached directory: {err}");
                    self.cache.remove(&key).await;
                }
            }
        }

        let fetched = DirectoryFetcher::new(self.current_source(), &self.config)
            .fetch_directory()
            .await?;

        if let Some(archive) = fetched.archive {
            // The whole archive is already here; serve entries from memory.
            let label = self.current_source().describe();
            let memory = MemorySource::new(archive).with_label(label);
            *self.source.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(memory);
        }

        match fetched.directory.to_json() {
            Ok(json) => {
                self.cache
                    .put(&key, Arc::from(json), self.config.directory_tier)
                    .await
            }
            Err(err) => warn!(url = %self.url, "directory not cached: {err}"),
        }
        Ok(fetched.directory)
    }

    /// Start downloading `path` without waiting for it.
    ///
    /// The task resumes from any payload an interrupted download of the
    /// same entry left behind. Its result is written to the cache.
    pub fn start_entry(&self, path: &str) -> Result<DownloadTask> {
        let (entry, downloader) = self.lookup(path)?;
        let resume_offset = downloader.resume_offset(path);
        let task = downloader.fetch_entry(&entry, resume_offset);

        let mut active = self.active_handles();
        active.entry(path.to_string()).or_default().push(task.handle());
        Ok(task)
    }

    /// Decompressed contents of `path`, from memory, the cache or the
    /// network in that order.
    ///
    /// The entry keeps its data only while the cache's memory tier holds
    /// it; records evicted from memory are dropped from the directory too.
    pub async fn load_entry(&self, path: &str) -> Result<Arc<[u8]>> {
        let (entry, _) = self.lookup(path)?;
        let key = CacheKey::entry(self.url.as_str(), path);
        if let Some(data) = entry.data {
            self.cache.mark_used(&key);
            return Ok(data);
        }

        if let Some(bytes) = self.cache.get(&key).await {
            debug!(path, "entry served from cache");
            self.update_entry(path, |e| e.data = Some(Arc::clone(&bytes)));
            self.forget_evicted();
            return Ok(bytes);
        }

        let task = self.start_entry(path)?;
        let result = task.wait().await;

        let resume_offset = self
            .read_ready()
            .as_ref()
            .map(|r| r.downloader.resume_offset(path))
            .unwrap_or(0);
        self.update_entry(path, |e| {
            e.resume_offset = resume_offset;
            if let Ok(data) = &result {
                e.data = Some(Arc::clone(data));
            }
        });
        self.forget_evicted();
        result
    }

    /// Cancel every running download of `path` and discard what any
    /// interrupted download of it retrieved, so the next load starts over.
    /// Returns whether there was anything to cancel.
    pub fn cancel_entry(&self, path: &str) -> bool {
        let handles = self.active_handles().remove(path).unwrap_or_default();
        for handle in &handles {
            handle.cancel();
        }
        let discarded = self
            .read_ready()
            .as_ref()
            .is_some_and(|r| r.downloader.discard_partial(path));
        self.update_entry(path, |e| e.resume_offset = 0);

        let cancelled = !handles.is_empty() || discarded;
        if cancelled {
            info!(path, running = handles.len(), "entry download cancelled");
        }
        cancelled
    }

    pub fn pause_entry(&self, path: &str) -> bool {
        self.with_handles(path, TaskHandle::pause)
    }

    pub fn resume_entry(&self, path: &str) -> bool {
        self.with_handles(path, TaskHandle::resume)
    }

    /// Remove this archive's records from both cache tiers and drop loaded
    /// entry data. The directory stays loaded.
    pub async fn clear_cache(&self) -> Result<()> {
        self.drop_entry_data();
        self.cache.clear_archive(&self.url).await
    }

    /// Release memory held for cached entries. Disk records are kept.
    pub async fn clear_memory_cache(&self) {
        self.drop_entry_data();
        self.cache.clear_memory().await;
    }

    fn lookup(&self, path: &str) -> Result<(ZipEntry, EntryDownloader)> {
        let ready = self.read_ready();
        let ready = ready.as_ref().ok_or(Error::DirectoryNotLoaded)?;
        let entry = ready
            .directory
            .get(path)
            .ok_or_else(|| Error::EntryNotFound(path.to_string()))?;
        Ok((entry.clone(), ready.downloader.clone()))
    }

    fn update_entry(&self, path: &str, f: impl FnOnce(&mut ZipEntry)) {
        if let Some(ready) = self.write_ready().as_mut() {
            if let Some(entry) = ready.directory.get_mut(path) {
                f(entry);
            }
        }
    }

    /// Drop entry data the cache's memory tier no longer holds.
    fn forget_evicted(&self) {
        if let Some(ready) = self.write_ready().as_mut() {
            for entry in &mut ready.directory.entries {
                if entry.data.is_some()
                    && !self
                        .cache
                        .in_memory(&CacheKey::entry(self.url.as_str(), entry.path.as_str()))
                {
                    debug!(path = %entry.path, "entry evicted from memory");
                    entry.data = None;
                }
            }
        }
    }

    fn drop_entry_data(&self) {
        if let Some(ready) = self.write_ready().as_mut() {
            for entry in &mut ready.directory.entries {
                entry.data = None;
            }
        }
    }

    fn with_handles(&self, path: &str, f: fn(&TaskHandle)) -> bool {
        let active = self.active_handles();
        match active.get(path) {
            Some(handles) if !handles.is_empty() => {
                handles.iter().for_each(f);
                true
            }
            _ => false,
        }
    }

    /// Running downloads, with finished ones pruned.
    fn active_handles(&self) -> MutexGuard<'_, HashMap<String, Vec<TaskHandle>>> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.retain(|_, handles| {
            handles.retain(|h| !h.state().is_terminal());
            !handles.is_empty()
        });
        active
    }

    fn current_source(&self) -> Arc<dyn RangeSource> {
        Arc::clone(&self.source.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn read_ready(&self) -> std::sync::RwLockReadGuard<'_, Option<Ready>> {
        self.ready.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_ready(&self) -> std::sync::RwLockWriteGuard<'_, Option<Ready>> {
        self.ready.write().unwrap_or_else(PoisonError::into_inner)
    }
}

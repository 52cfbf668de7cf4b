//! Two-tier cache for directories and decompressed entries.
//!
//! [`CacheStore`] composes two [`CacheLayer`]s into a read-through,
//! write-through chain: reads try memory, then disk, promoting disk hits into
//! memory; writes go to disk and are mirrored into memory unless the caller
//! asks for a single tier.
//!
//! Operations on one key are serialized; different keys proceed
//! independently. A failing disk tier is switched off for the rest of the
//! store's life and the store keeps working from memory.

mod disk;
mod memory;

pub use disk::DiskLayer;
pub use memory::MemoryLayer;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// What a cache record holds for an archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheItem {
    /// The serialized central directory.
    Directory,
    /// Decompressed contents of the entry at this path.
    Entry(String),
}

/// Composite key: archive URL plus item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub archive_url: String,
    pub item: CacheItem,
}

impl CacheKey {
    pub fn directory(archive_url: impl Into<String>) -> Self {
        Self {
            archive_url: archive_url.into(),
            item: CacheItem::Directory,
        }
    }

    pub fn entry(archive_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            archive_url: archive_url.into(),
            item: CacheItem::Entry(path.into()),
        }
    }
}

/// Where a record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    MemoryOnly,
    Disk,
    Both,
}

impl Tier {
    fn in_memory(self) -> bool {
        matches!(self, Tier::MemoryOnly | Tier::Both)
    }

    fn on_disk(self) -> bool {
        matches!(self, Tier::Disk | Tier::Both)
    }
}

/// Bookkeeping for one cached record.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub tier: Tier,
    pub size_bytes: u64,
    pub last_access: Instant,
}

/// A single cache tier.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<Arc<[u8]>>>;
    async fn put(&self, key: &CacheKey, bytes: Arc<[u8]>) -> Result<()>;
    async fn remove(&self, key: &CacheKey) -> Result<()>;
    /// Drop every record belonging to one archive.
    async fn clear_archive(&self, archive_url: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

type KeyLock = Arc<tokio::sync::Mutex<()>>;

pub struct CacheStore {
    memory: Arc<dyn CacheLayer>,
    disk: Option<Arc<dyn CacheLayer>>,
    disk_enabled: AtomicBool,
    memory_limit: Option<u64>,
    index: Mutex<HashMap<CacheKey, CacheEntry>>,
    locks: Mutex<HashMap<CacheKey, KeyLock>>,
}

impl CacheStore {
    pub fn new(config: &CacheConfig) -> Self {
        let disk = config
            .root
            .as_ref()
            .map(|root| Arc::new(DiskLayer::new(root)) as Arc<dyn CacheLayer>);
        Self::with_layers(Arc::new(MemoryLayer::new()), disk, config.memory_limit)
    }

    /// Compose arbitrary layers, e.g. to substitute a disk tier.
    pub fn with_layers(
        memory: Arc<dyn CacheLayer>,
        disk: Option<Arc<dyn CacheLayer>>,
        memory_limit: Option<u64>,
    ) -> Self {
        Self {
            disk_enabled: AtomicBool::new(disk.is_some()),
            memory,
            disk,
            memory_limit,
            index: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the disk tier is configured and has not failed.
    pub fn disk_enabled(&self) -> bool {
        self.disk_enabled.load(Ordering::Relaxed)
    }

    fn disk(&self) -> Option<&Arc<dyn CacheLayer>> {
        self.disk.as_ref().filter(|_| self.disk_enabled())
    }

    fn index(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_lock(&self, key: &CacheKey) -> KeyLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    fn release_key_lock(&self, key: &CacheKey, lock: KeyLock) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // The map and `lock` itself are the only holders: nobody is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    fn disk_failed(&self, err: Error) {
        if self.disk_enabled.swap(false, Ordering::Relaxed) {
            warn!("disk cache disabled, continuing in memory only: {err}");
        }
    }

    /// Look a key up in memory, then on disk.
    pub async fn get(&self, key: &CacheKey) -> Option<Arc<[u8]>> {
        let lock = self.key_lock(key);
        let found = {
            let _guard = lock.lock().await;
            self.get_locked(key).await
        };
        self.release_key_lock(key, lock);
        if found.is_some() {
            self.enforce_memory_limit().await;
        }
        found
    }

    async fn get_locked(&self, key: &CacheKey) -> Option<Arc<[u8]>> {
        if let Ok(Some(bytes)) = self.memory.get(key).await {
            self.touch(key, bytes.len() as u64, None);
            return Some(bytes);
        }

        let disk = self.disk()?;
        match disk.get(key).await {
            Ok(Some(bytes)) => {
                debug!(?key, "promoting disk hit into memory");
                // Memory writes cannot fail for the built-in layer; a custom
                // layer that fails simply leaves the record disk-only.
                let tier = match self.memory.put(key, Arc::clone(&bytes)).await {
                    Ok(()) => Tier::Both,
                    Err(_) => Tier::Disk,
                };
                self.touch(key, bytes.len() as u64, Some(tier));
                Some(bytes)
            }
            Ok(None) => None,
            Err(err) => {
                self.disk_failed(err);
                None
            }
        }
    }

    fn touch(&self, key: &CacheKey, size_bytes: u64, tier: Option<Tier>) {
        let mut index = self.index();
        let entry = index.entry(key.clone()).or_insert_with(|| CacheEntry {
            key: key.clone(),
            tier: tier.unwrap_or(Tier::MemoryOnly),
            size_bytes,
            last_access: Instant::now(),
        });
        entry.last_access = Instant::now();
        entry.size_bytes = size_bytes;
        if let Some(tier) = tier {
            entry.tier = tier;
        }
    }

    /// Store `bytes` under `key` in the requested tier.
    ///
    /// A disk failure is logged and the record is kept in memory instead.
    pub async fn put(&self, key: &CacheKey, bytes: Arc<[u8]>, tier: Tier) {
        let lock = self.key_lock(key);
        {
            let _guard = lock.lock().await;
            self.put_locked(key, bytes, tier).await;
        }
        self.release_key_lock(key, lock);
        self.enforce_memory_limit().await;
    }

    async fn put_locked(&self, key: &CacheKey, bytes: Arc<[u8]>, tier: Tier) {
        let mut stored_on_disk = false;
        if tier.on_disk() {
            if let Some(disk) = self.disk() {
                match disk.put(key, Arc::clone(&bytes)).await {
                    Ok(()) => stored_on_disk = true,
                    Err(err) => self.disk_failed(err),
                }
            }
        }

        let stored_in_memory = if tier.in_memory() || !stored_on_disk {
            self.memory.put(key, Arc::clone(&bytes)).await.is_ok()
        } else {
            // Disk-only request: drop any stale memory copy.
            let _ = self.memory.remove(key).await;
            false
        };

        let effective = match (stored_in_memory, stored_on_disk) {
            (true, true) => Tier::Both,
            (false, true) => Tier::Disk,
            (true, false) => Tier::MemoryOnly,
            (false, false) => {
                self.index().remove(key);
                return;
            }
        };

        self.index().insert(
            key.clone(),
            CacheEntry {
                key: key.clone(),
                tier: effective,
                size_bytes: bytes.len() as u64,
                last_access: Instant::now(),
            },
        );
    }

    pub async fn remove(&self, key: &CacheKey) {
        let lock = self.key_lock(key);
        {
            let _guard = lock.lock().await;
            let _ = self.memory.remove(key).await;
            if let Some(disk) = self.disk() {
                if let Err(err) = disk.remove(key).await {
                    self.disk_failed(err);
                }
            }
            self.index().remove(key);
        }
        self.release_key_lock(key, lock);
    }

    /// Record describing `key`, if the store knows about it.
    pub fn describe(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.index().get(key).cloned()
    }

    /// Whether the memory tier still holds `key`.
    pub fn in_memory(&self, key: &CacheKey) -> bool {
        self.index().get(key).is_some_and(|e| e.tier.in_memory())
    }

    /// Count a use of `key` that was served from a copy outside the store.
    pub fn mark_used(&self, key: &CacheKey) {
        if let Some(entry) = self.index().get_mut(key) {
            entry.last_access = Instant::now();
        }
    }

    /// Bytes currently held by the memory tier.
    pub fn memory_usage(&self) -> u64 {
        self.index()
            .values()
            .filter(|e| e.tier.in_memory())
            .map(|e| e.size_bytes)
            .sum()
    }

    /// Drop the memory tier. Records written to disk stay retrievable.
    pub async fn clear_memory(&self) {
        let _ = self.memory.clear().await;
        self.index().retain(|_, entry| match entry.tier {
            Tier::MemoryOnly => false,
            Tier::Both | Tier::Disk => {
                entry.tier = Tier::Disk;
                true
            }
        });
    }

    /// Drop one archive's records from both tiers.
    ///
    /// The disk tier is cleared even after it was switched off, so that a
    /// later process does not find the records again.
    pub async fn clear_archive(&self, archive_url: &str) -> Result<()> {
        let _ = self.memory.clear_archive(archive_url).await;
        self.index().retain(|key, _| key.archive_url != archive_url);
        match &self.disk {
            Some(disk) => disk.clear_archive(archive_url).await,
            None => Ok(()),
        }
    }

    /// Drop everything, including every archive's disk files.
    pub async fn clear_all(&self) -> Result<()> {
        let _ = self.memory.clear().await;
        self.index().clear();
        match &self.disk {
            Some(disk) => disk.clear().await,
            None => Ok(()),
        }
    }

    /// Evict least recently used memory records until the budget holds.
    async fn enforce_memory_limit(&self) {
        let Some(limit) = self.memory_limit else {
            return;
        };

        loop {
            let victim = {
                let mut index = self.index();
                let usage: u64 = index
                    .values()
                    .filter(|e| e.tier.in_memory())
                    .map(|e| e.size_bytes)
                    .sum();
                if usage <= limit {
                    return;
                }
                let Some(key) = index
                    .values()
                    .filter(|e| e.tier.in_memory())
                    .min_by_key(|e| e.last_access)
                    .map(|e| e.key.clone())
                else {
                    return;
                };
                match index.get(&key).map(|e| e.tier) {
                    Some(Tier::Both) => {
                        if let Some(entry) = index.get_mut(&key) {
                            entry.tier = Tier::Disk;
                        }
                    }
                    _ => {
                        index.remove(&key);
                    }
                }
                key
            };
            debug!(key = ?victim, "evicting from memory tier");
            let _ = self.memory.remove(&victim).await;
        }
    }
}

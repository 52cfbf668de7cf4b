//! Explicit configuration handed to [`ArchiveSession`](crate::ArchiveSession)
//! and [`CacheStore`](crate::CacheStore).
//!
//! There is no process-wide state: whoever builds the session decides where
//! the cache lives. The CLI supplies a per-user default.

use std::path::PathBuf;
use std::time::Duration;

use crate::cache::Tier;

/// Size of the first tail request. Covers the EOCD record plus a
/// maximum-length archive comment in almost every archive.
pub const DEFAULT_TAIL_WINDOW: u64 = 64 * 1024;
/// Window for the single retry when the EOCD was not in the first tail.
pub const DEFAULT_MAX_TAIL_WINDOW: u64 = 256 * 1024;
pub const DEFAULT_SEGMENT_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Root directory of the disk tier. `None` keeps everything in memory.
    pub root: Option<PathBuf>,
    /// Optional byte budget for the memory tier. Unbounded when `None`.
    pub memory_limit: Option<u64>,
}

impl CacheConfig {
    pub fn memory_only() -> Self {
        Self::default()
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            memory_limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub cache: CacheConfig,
    pub tail_window: u64,
    pub max_tail_window: u64,
    /// Largest single range request issued for entry payloads. A paused or
    /// interrupted download resumes from the last completed segment.
    pub segment_size: u64,
    /// Applied to every range request. Expiry is a network error.
    pub request_timeout: Option<Duration>,
    /// Tier for decompressed entries.
    pub entry_tier: Tier,
    /// Tier for the serialized directory.
    pub directory_tier: Tier,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            tail_window: DEFAULT_TAIL_WINDOW,
            max_tail_window: DEFAULT_MAX_TAIL_WINDOW,
            segment_size: DEFAULT_SEGMENT_SIZE,
            request_timeout: Some(Duration::from_secs(30)),
            entry_tier: Tier::Both,
            directory_tier: Tier::Both,
        }
    }
}

impl SessionConfig {
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_segment_size(mut self, segment_size: u64) -> Self {
        self.segment_size = segment_size.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

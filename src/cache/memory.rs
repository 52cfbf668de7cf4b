use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::{CacheKey, CacheLayer};
use crate::error::Result;

/// Process-local tier. Contents vanish with the process.
#[derive(Default)]
pub struct MemoryLayer {
    items: Mutex<HashMap<CacheKey, Arc<[u8]>>>,
}

impl MemoryLayer {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Arc<[u8]>>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CacheLayer for MemoryLayer {
    async fn get(&self, key: &CacheKey) -> Result<Option<Arc<[u8]>>> {
        Ok(self.items().get(key).cloned())
    }

    async fn put(&self, key: &CacheKey, bytes: Arc<[u8]>) -> Result<()> {
        self.items().insert(key.clone(), bytes);
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        self.items().remove(key);
        Ok(())
    }

    async fn clear_archive(&self, archive_url: &str) -> Result<()> {
        self.items().retain(|key, _| key.archive_url != archive_url);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.items().clear();
        Ok(())
    }
}

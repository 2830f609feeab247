//! A cached front for the engine.
//!
//! `AsyncDb` answers repeated reads of recently written keys from memory and
//! skips writes that would not change anything. Every call after `close()`
//! fails with [`StoreError::ClosedEngine`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::runtime::Handle;

use crate::config::EngineConfig;
use crate::storage::{Engine, Key, Result, StoreError, Value};

/// An engine with a bounded write-through cache.
pub struct AsyncDb<K, V> {
    engine: Engine<K, V>,
    cache: Mutex<BTreeMap<K, V>>,
    capacity: usize,
    open: AtomicBool,
}

impl<K: Key, V: Value> AsyncDb<K, V> {
    /// Open the store at `path`; see [`Engine::open`].
    pub async fn open(path: &Path, config: EngineConfig, runtime: Handle) -> Result<Self> {
        let capacity = config.cache_capacity;
        let engine = Engine::open(path, config, runtime).await?;
        Ok(Self {
            engine,
            cache: Mutex::new(BTreeMap::new()),
            capacity,
            open: AtomicBool::new(true),
        })
    }

    /// Look up `key`, from the cache when possible.
    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        self.ensure_open()?;
        let cached = self.cache().get(key).cloned();
        if cached.is_some() {
            return Ok(cached);
        }
        self.engine.get(key).await
    }

    /// Insert or replace `key`.
    pub async fn set(&self, key: K, value: V) -> Result<()> {
        self.ensure_open()?;
        if self.cache().get(&key) == Some(&value) {
            return Ok(());
        }

        self.engine.set(key.clone(), value.clone())?;
        if self.capacity > 0 {
            let mut cache = self.cache();
            cache.insert(key, value);
            if cache.len() > self.capacity {
                cache.pop_first();
            }
        }
        Ok(())
    }

    /// Remove `key`.
    pub async fn remove(&self, key: &K) -> Result<()> {
        self.ensure_open()?;
        self.cache().remove(key);
        self.engine.remove(key)
    }

    /// Range scan; see [`Engine::items`].
    pub async fn items(
        &self,
        from: Option<&K>,
        to: Option<&K>,
        max_len: usize,
        reverse: bool,
    ) -> Result<Vec<(K, V)>> {
        self.ensure_open()?;
        self.engine.items(from, to, max_len, reverse).await
    }

    /// Close the handle and the engine behind it.
    pub async fn close(&self) -> Result<()> {
        self.ensure_open()?;
        self.open.store(false, Ordering::Release);
        self.cache().clear();
        self.engine.close().await
    }

    /// Whether `close()` has not been called yet.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// The wrapped engine.
    #[must_use]
    pub const fn engine(&self) -> &Engine<K, V> {
        &self.engine
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StoreError::ClosedEngine)
        }
    }

    fn cache(&self) -> MutexGuard<'_, BTreeMap<K, V>> {
        #[allow(clippy::expect_used)] // Poisoning means a cache update panicked
        self.cache.lock().expect("lock poisoned")
    }
}

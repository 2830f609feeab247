//! Common helpers for end-to-end tests.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::storage::{Engine, Key, Value};
use crate::testing::open_engine;

/// A temporary directory holding one store file, removed on drop.
pub struct TestStore {
    _dir: TempDir,
    pub path: PathBuf,
}

impl TestStore {
    #[must_use]
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("store.db");
        Self { _dir: dir, path }
    }

    /// Open (or reopen) the store with the small test configuration.
    pub async fn open<K: Key, V: Value>(&self) -> Engine<K, V> {
        open_engine(&self.path).await
    }

    /// Force the header's status byte back to "open", as a crash would leave it.
    pub fn mark_unclean(&self) {
        mark_unclean(&self.path);
    }
}

pub fn mark_unclean(path: &Path) {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .expect("open store file");
    file.seek(SeekFrom::Start(0)).expect("seek header");
    file.write_all(&[0]).expect("write status");
    file.sync_all().expect("sync");
}

/// Every entry in ascending order.
pub async fn all_items<K: Key, V: Value>(engine: &Engine<K, V>) -> Vec<(K, V)> {
    engine
        .items(None, None, 0, false)
        .await
        .expect("scan all items")
}

/// Assert the engine holds exactly `model`, via both scans and point reads.
pub async fn assert_matches<K, V>(engine: &Engine<K, V>, model: &BTreeMap<K, V>)
where
    K: Key + std::fmt::Debug,
    V: Value + std::fmt::Debug,
{
    let expected: Vec<(K, V)> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(all_items(engine).await, expected);
    for (key, value) in model {
        assert_eq!(
            engine.get(key).await.expect("get"),
            Some(value.clone()),
            "key {key:?}"
        );
    }
}

/// Value text used across scenarios.
#[must_use]
pub fn value_for(key: u32) -> String {
    format!("value-{key:05}")
}

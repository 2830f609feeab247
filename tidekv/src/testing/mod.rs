use std::path::Path;

use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::storage::{Engine, Key, Value};

/// Install a test subscriber once; later calls are no-ops.
///
/// Honors `RUST_LOG`, defaulting to `tidekv=debug`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tidekv=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// A configuration with the smallest legal tree, so a handful of keys
/// already exercises splits, rotations and merges.
pub fn small_config() -> EngineConfig {
    EngineConfig::default()
        .with_min_degree(2)
        .with_io_handles(4)
        .with_allocator_capacity(64)
}

/// Open an engine at `path` with [`small_config`] on the current runtime.
pub async fn open_engine<K: Key, V: Value>(path: &Path) -> Engine<K, V> {
    init_tracing();
    Engine::open(path, small_config(), Handle::current())
        .await
        .expect("open engine")
}

//! Test range scans over bounds, direction and length limits.

use crate::e2e_tests::helpers::*;
use crate::storage::Engine;

/// Even keys 0, 2, ..., 98.
async fn even_store(store: &TestStore) -> Engine<u32, String> {
    let engine = store.open::<u32, String>().await;
    for key in (0..100).step_by(2) {
        engine.set(key, value_for(key)).expect("set");
    }
    engine
}

async fn keys(engine: &Engine<u32, String>, from: Option<u32>, to: Option<u32>, max_len: usize, reverse: bool) -> Vec<u32> {
    engine
        .items(from.as_ref(), to.as_ref(), max_len, reverse)
        .await
        .expect("items")
        .into_iter()
        .map(|(key, value)| {
            assert_eq!(value, value_for(key));
            key
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_inclusive_bounds() {
    let store = TestStore::new();
    let engine = even_store(&store).await;

    assert_eq!(keys(&engine, Some(10), Some(20), 0, false).await, vec![10, 12, 14, 16, 18, 20]);
    assert_eq!(keys(&engine, Some(11), Some(19), 0, false).await, vec![12, 14, 16, 18]);
    assert_eq!(keys(&engine, Some(99), Some(200), 0, false).await, Vec::<u32>::new());
    engine.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reverse_and_max_len() {
    let store = TestStore::new();
    let engine = even_store(&store).await;

    assert_eq!(keys(&engine, Some(10), Some(20), 0, true).await, vec![20, 18, 16, 14, 12, 10]);
    assert_eq!(keys(&engine, Some(10), Some(20), 3, false).await, vec![10, 12, 14]);
    assert_eq!(keys(&engine, Some(10), Some(20), 3, true).await, vec![20, 18, 16]);
    assert_eq!(keys(&engine, None, None, 2, true).await, vec![98, 96]);
    engine.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_degenerate_bounds() {
    let store = TestStore::new();
    let engine = even_store(&store).await;

    assert!(keys(&engine, Some(20), Some(10), 0, false).await.is_empty());
    assert_eq!(keys(&engine, Some(42), Some(42), 0, false).await, vec![42]);
    assert!(keys(&engine, Some(43), Some(43), 0, false).await.is_empty());
    engine.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_sided_bounds() {
    let store = TestStore::new();
    let engine = even_store(&store).await;

    assert_eq!(keys(&engine, Some(93), None, 0, false).await, vec![94, 96, 98]);
    assert_eq!(keys(&engine, None, Some(5), 0, false).await, vec![0, 2, 4]);
    assert_eq!(keys(&engine, None, Some(5), 0, true).await, vec![4, 2, 0]);
    assert_eq!(keys(&engine, None, None, 0, false).await.len(), 50);
    engine.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scan_of_empty_store() {
    let store = TestStore::new();
    let engine = store.open::<u32, String>().await;

    assert!(keys(&engine, None, None, 0, false).await.is_empty());
    assert!(keys(&engine, Some(1), Some(9), 0, true).await.is_empty());
    engine.close().await.expect("close");
}

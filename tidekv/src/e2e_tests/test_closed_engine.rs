//! Test that a closed engine refuses work and leaves a clean file behind.

use crate::e2e_tests::helpers::*;
use crate::storage::StoreError;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_operations_after_close_fail() {
    let store = TestStore::new();
    let engine = store.open::<u32, String>().await;
    engine.set(1, value_for(1)).expect("set");
    engine.close().await.expect("close");

    assert!(engine.is_closed());
    assert!(matches!(engine.get(&1).await, Err(StoreError::ClosedEngine)));
    assert!(matches!(engine.set(2, value_for(2)), Err(StoreError::ClosedEngine)));
    assert!(matches!(engine.remove(&1), Err(StoreError::ClosedEngine)));
    assert!(matches!(
        engine.items(None, None, 0, false).await,
        Err(StoreError::ClosedEngine)
    ));
    engine.close().await.expect("second close is a no-op");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_marks_file_clean() {
    let store = TestStore::new();
    let engine = store.open::<u32, String>().await;
    for key in 0..20 {
        engine.set(key, value_for(key)).expect("set");
    }

    let bytes = std::fs::read(&store.path).expect("read store file");
    assert_eq!(bytes[0], 0);

    engine.close().await.expect("close");
    let bytes = std::fs::read(&store.path).expect("read store file");
    assert_eq!(bytes[0], 1);

    let engine = store.open::<u32, String>().await;
    assert_eq!(all_items(&engine).await.len(), 20);
    engine.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clones_share_closed_state() {
    let store = TestStore::new();
    let engine = store.open::<u32, String>().await;
    let other = engine.clone();

    engine.close().await.expect("close");
    assert!(other.is_closed());
    assert!(matches!(other.get(&1).await, Err(StoreError::ClosedEngine)));
}

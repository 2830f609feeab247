//! Test that superseded records and nodes return to the allocator.

use crate::e2e_tests::helpers::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replace_churn_frees_space() {
    let store = TestStore::new();
    let engine = store.open::<u32, String>().await;
    for round in 0..10 {
        for key in 0..30 {
            engine.set(key, format!("{round}-{key}")).expect("set");
        }
    }
    engine.wait_until_idle().await;

    let stats = engine.stats();
    assert!(stats.free_bytes > 0, "{stats:?}");
    assert_eq!(stats.pending_tasks, 0);
    assert_eq!(stats.tracked_addresses, 0);
    assert!(stats.writes_applied > 0);

    for key in 0..30 {
        assert_eq!(engine.get(&key).await.expect("get"), Some(format!("9-{key}")));
    }
    engine.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_removing_everything_frees_space() {
    let store = TestStore::new();
    let engine = store.open::<u32, String>().await;
    for key in 0..50 {
        engine.set(key, value_for(key)).expect("set");
    }
    for key in 0..50 {
        engine.remove(&key).expect("remove");
    }
    engine.wait_until_idle().await;

    let stats = engine.stats();
    assert!(stats.free_bytes > 0, "{stats:?}");
    assert_eq!(stats.pending_tasks, 0);
    assert_eq!(stats.tracked_addresses, 0);
    assert_eq!(stats.queued_writes, 0);
    engine.close().await.expect("close");
}

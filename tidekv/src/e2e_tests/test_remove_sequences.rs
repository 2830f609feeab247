//! Test removals that drive the tree through rotations, merges and collapse.

use std::collections::BTreeMap;

use crate::e2e_tests::helpers::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remove_evens_then_odds() {
    let store = TestStore::new();
    let engine = store.open::<u32, String>().await;
    let mut model = BTreeMap::new();
    for key in 1..=64 {
        engine.set(key, value_for(key)).expect("set");
        model.insert(key, value_for(key));
    }

    for key in (2..=64).step_by(2) {
        engine.remove(&key).expect("remove");
        model.remove(&key);
    }
    assert_matches(&engine, &model).await;

    for key in (1..=63).rev().step_by(2) {
        engine.remove(&key).expect("remove");
        model.remove(&key);
        assert_eq!(engine.get(&key).await.expect("get"), None);
    }
    assert!(all_items(&engine).await.is_empty());
    assert_eq!(engine.get(&1).await.expect("get"), None);

    for key in 100..110 {
        engine.set(key, value_for(key)).expect("reinsert");
        model.insert(key, value_for(key));
    }
    engine.close().await.expect("close");

    let engine = store.open::<u32, String>().await;
    assert_matches(&engine, &model).await;
    engine.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remove_missing_key() {
    let store = TestStore::new();
    let engine = store.open::<u32, String>().await;

    engine.remove(&5).expect("remove from empty store");
    engine.set(1, value_for(1)).expect("set");
    engine.remove(&5).expect("remove missing key");
    assert_eq!(all_items(&engine).await, vec![(1, value_for(1))]);
    engine.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remove_from_middle_outward() {
    let store = TestStore::new();
    let engine = store.open::<u32, String>().await;
    let mut model = BTreeMap::new();
    for key in 0..40 {
        engine.set(key, value_for(key)).expect("set");
        model.insert(key, value_for(key));
    }

    for offset in 0..20 {
        for key in [20 + offset, 19 - offset] {
            engine.remove(&key).expect("remove");
            model.remove(&key);
        }
        if offset % 5 == 0 {
            assert_matches(&engine, &model).await;
        }
    }
    assert!(all_items(&engine).await.is_empty());
    engine.close().await.expect("close");

    let engine = store.open::<u32, String>().await;
    assert!(all_items(&engine).await.is_empty());
    engine.close().await.expect("close");
}

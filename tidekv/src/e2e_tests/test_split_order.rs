//! Test that splits keep keys ordered whatever the insertion order.

use std::collections::BTreeMap;

use tokio::runtime::Handle;

use crate::e2e_tests::helpers::*;
use crate::storage::Engine;
use crate::testing::{init_tracing, small_config};

async fn insert_in_order(keys: &[u32]) {
    let store = TestStore::new();
    let engine = store.open::<u32, String>().await;
    let empty_root = engine.stats().root_address;

    let mut model = BTreeMap::new();
    for &key in keys {
        engine.set(key, value_for(key)).expect("set");
        model.insert(key, value_for(key));
    }
    assert_matches(&engine, &model).await;
    assert_ne!(engine.stats().root_address, empty_root);
    engine.close().await.expect("close");

    let engine = store.open::<u32, String>().await;
    assert_matches(&engine, &model).await;
    engine.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ascending_inserts() {
    insert_in_order(&[1, 2, 3, 4, 5, 6, 7]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_descending_inserts() {
    insert_in_order(&[7, 6, 5, 4, 3, 2, 1]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_inserts() {
    insert_in_order(&[4, 1, 7, 2, 6, 3, 5]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_inserts_build_deeper_tree() {
    let keys: Vec<u32> = (0..200).map(|i| (i * 37) % 200).collect();
    insert_in_order(&keys).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wider_nodes() {
    init_tracing();
    let store = TestStore::new();
    let config = small_config().with_min_degree(3);
    let engine: Engine<u32, String> = Engine::open(&store.path, config.clone(), Handle::current())
        .await
        .expect("open engine");

    let mut model = BTreeMap::new();
    for key in (0..11).rev() {
        engine.set(key, value_for(key)).expect("set");
        model.insert(key, value_for(key));
    }
    assert_matches(&engine, &model).await;
    engine.close().await.expect("close");

    let engine: Engine<u32, String> = Engine::open(&store.path, config, Handle::current())
        .await
        .expect("reopen engine");
    assert_matches(&engine, &model).await;
    engine.close().await.expect("close");
}

//! Test the cached front end across a reopen.

use std::collections::BTreeMap;

use tokio::runtime::Handle;

use crate::db::AsyncDb;
use crate::e2e_tests::helpers::*;
use crate::storage::StoreError;
use crate::testing::{init_tracing, small_config};

async fn open_db(store: &TestStore) -> AsyncDb<u32, String> {
    init_tracing();
    AsyncDb::open(&store.path, small_config().with_cache_capacity(8), Handle::current())
        .await
        .expect("open db")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_trip_across_reopen() {
    let store = TestStore::new();
    let mut model = BTreeMap::new();

    let db = open_db(&store).await;
    for key in 0..40 {
        db.set(key, value_for(key)).await.expect("set");
        model.insert(key, value_for(key));
    }
    for key in (0..40).step_by(3) {
        db.remove(&key).await.expect("remove");
        model.remove(&key);
    }
    db.set(5, "five".to_string()).await.expect("replace");
    model.insert(5, "five".to_string());
    assert_matches(db.engine(), &model).await;
    db.close().await.expect("close");

    let db = open_db(&store).await;
    for (key, value) in &model {
        assert_eq!(db.get(key).await.expect("get"), Some(value.clone()));
    }
    let items = db.items(Some(&10), Some(&20), 0, true).await.expect("items");
    let expected: Vec<_> = model
        .range(10..=20)
        .rev()
        .map(|(k, v)| (*k, v.clone()))
        .collect();
    assert_eq!(items, expected);
    db.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_closed_db_returns_errors() {
    let store = TestStore::new();
    let db = open_db(&store).await;
    db.set(1, value_for(1)).await.expect("set");
    db.close().await.expect("close");

    assert!(db.engine().is_closed());
    assert!(matches!(db.get(&1).await, Err(StoreError::ClosedEngine)));
    assert!(matches!(db.set(2, value_for(2)).await, Err(StoreError::ClosedEngine)));
}

//! Test recovery of stores that were not closed cleanly.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use crate::e2e_tests::helpers::*;
use crate::storage::btree::node::RecordCodec;
use crate::storage::recovery::{self, staging_path};

fn model(range: std::ops::Range<u32>) -> BTreeMap<u32, String> {
    range.map(|key| (key, value_for(key))).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drop_without_close_repairs() {
    let store = TestStore::new();
    let mut expected = model(0..60);
    {
        let engine = store.open::<u32, String>().await;
        for (key, value) in &expected {
            engine.set(*key, value.clone()).expect("set");
        }
        for key in 0..10 {
            engine.remove(&key).expect("remove");
            expected.remove(&key);
        }
        engine.set(30, "replaced".to_string()).expect("replace");
        expected.insert(30, "replaced".to_string());
        engine.wait_until_idle().await;
    }

    let bytes = std::fs::read(&store.path).expect("read store file");
    assert_eq!(bytes[0], 0);

    let engine = store.open::<u32, String>().await;
    assert_matches(&engine, &expected).await;
    assert!(!staging_path(&store.path).exists());
    engine.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drop_with_writes_in_flight() {
    let store = TestStore::new();
    let expected = model(0..100);
    {
        let engine = store.open::<u32, String>().await;
        for (key, value) in &expected {
            engine.set(*key, value.clone()).expect("set");
        }
    }

    let engine = store.open::<u32, String>().await;
    assert_matches(&engine, &expected).await;
    engine.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leftover_staging_file_is_replayed() {
    let store = TestStore::new();
    let expected = model(0..40);
    {
        let engine = store.open::<u32, String>().await;
        for (key, value) in &expected {
            engine.set(*key, value.clone()).expect("set");
        }
        engine.close().await.expect("close");
    }

    // A crash after staging but before the rebuild finished.
    let codec = RecordCodec::new(crate::testing::small_config().max_record_size);
    let report = recovery::repair::<u32, String>(&store.path, codec).expect("repair");
    assert_eq!(report.records_recovered, 40);
    let file = OpenOptions::new()
        .write(true)
        .open(&store.path)
        .expect("open store file");
    file.set_len(20).expect("truncate");
    drop(file);

    let engine = store.open::<u32, String>().await;
    assert_matches(&engine, &expected).await;
    assert!(!staging_path(&store.path).exists());
    engine.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bad_status_byte_triggers_repair() {
    let store = TestStore::new();
    let expected = model(0..25);
    {
        let engine = store.open::<u32, String>().await;
        for (key, value) in &expected {
            engine.set(*key, value.clone()).expect("set");
        }
        engine.close().await.expect("close");
    }

    let mut file = OpenOptions::new()
        .write(true)
        .open(&store.path)
        .expect("open store file");
    file.seek(SeekFrom::Start(0)).expect("seek header");
    file.write_all(&[7]).expect("write status");
    drop(file);

    let engine = store.open::<u32, String>().await;
    assert_matches(&engine, &expected).await;
    engine.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clean_file_marked_unclean_repairs() {
    let store = TestStore::new();
    let expected = model(0..15);
    {
        let engine = store.open::<u32, String>().await;
        for (key, value) in &expected {
            engine.set(*key, value.clone()).expect("set");
        }
        engine.close().await.expect("close");
    }
    store.mark_unclean();

    let engine = store.open::<u32, String>().await;
    assert_matches(&engine, &expected).await;
    engine.close().await.expect("close");

    let bytes = std::fs::read(&store.path).expect("read store file");
    assert_eq!(bytes[0], 1);
}

//! Test readers racing replacements of the values they are reading.

use std::pin::pin;
use std::task::Poll;

use crate::e2e_tests::helpers::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_in_flight_keeps_its_snapshot() {
    let store = TestStore::new();
    let engine = store.open::<u32, String>().await;
    for key in 0..30 {
        engine.set(key, value_for(key)).expect("set");
    }

    let mut read = pin!(engine.get(&17));
    let early = futures::poll!(read.as_mut());

    // Replace the key and reshape the tree around it while the read is parked.
    engine.set(17, "replaced".to_string()).expect("replace");
    for key in 0..10 {
        engine.remove(&key).expect("remove");
    }
    for key in 100..140 {
        engine.set(key, value_for(key)).expect("set");
    }
    engine.remove(&17).expect("remove");

    let seen = match early {
        Poll::Ready(result) => result,
        Poll::Pending => read.await,
    };
    assert_eq!(seen.expect("get"), Some(value_for(17)));
    assert_eq!(engine.get(&17).await.expect("get"), None);
    engine.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_see_old_or_new_values() {
    let store = TestStore::new();
    let engine = store.open::<u32, String>().await;
    for key in 0..50 {
        engine.set(key, format!("v0-{key}")).expect("set");
    }

    let readers: Vec<_> = (0..4u32)
        .map(|offset| {
            let engine = engine.clone();
            tokio::spawn(async move {
                for i in 0..200u32 {
                    let key = (i + offset) % 50;
                    let value = engine
                        .get(&key)
                        .await
                        .expect("get")
                        .expect("key stays present");
                    assert!(value.starts_with('v'), "unexpected value {value}");
                    assert!(value.ends_with(&format!("-{key}")), "value {value} for key {key}");
                }
            })
        })
        .collect();

    for generation in 1..=20 {
        for key in 0..50 {
            engine
                .set(key, format!("v{generation}-{key}"))
                .expect("replace");
        }
        tokio::task::yield_now().await;
    }
    for reader in readers {
        reader.await.expect("reader task");
    }

    for key in 0..50 {
        assert_eq!(engine.get(&key).await.expect("get"), Some(format!("v20-{key}")));
    }
    engine.close().await.expect("close");

    let engine = store.open::<u32, String>().await;
    for key in 0..50 {
        assert_eq!(engine.get(&key).await.expect("get"), Some(format!("v20-{key}")));
    }
    engine.close().await.expect("close");
}

#[tokio::test]
async fn test_setting_equal_value_is_a_no_op() {
    let store = TestStore::new();
    let engine = store.open::<u32, String>().await;
    engine.set(1, value_for(1)).expect("set");
    engine.wait_until_idle().await;
    let before = engine.stats();

    engine.set(1, value_for(1)).expect("set again");
    let after = engine.stats();
    assert_eq!(after.file_size, before.file_size);
    assert_eq!(after.pending_tasks, 0);
    engine.close().await.expect("close");
}

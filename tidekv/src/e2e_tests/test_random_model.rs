//! Test a seeded random workload against an in-memory model.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::e2e_tests::helpers::*;
use crate::storage::Engine;

const KEY_SPACE: u32 = 300;

async fn run_ops(
    engine: &Engine<u32, String>,
    model: &mut BTreeMap<u32, String>,
    rng: &mut StdRng,
    ops: usize,
) {
    for step in 0..ops {
        let key = rng.random_range(0..KEY_SPACE);
        match rng.random_range(0..10) {
            0..=4 => {
                let value = format!("{key}-{}", rng.random_range(0..1000u32));
                engine.set(key, value.clone()).expect("set");
                model.insert(key, value);
            }
            5..=7 => {
                engine.remove(&key).expect("remove");
                model.remove(&key);
            }
            8 => {
                assert_eq!(engine.get(&key).await.expect("get"), model.get(&key).cloned());
            }
            _ => {
                let to = key + rng.random_range(0..40);
                let reverse = rng.random_bool(0.5);
                let mut expected: Vec<_> = model
                    .range(key..=to)
                    .map(|(k, v)| (*k, v.clone()))
                    .collect();
                if reverse {
                    expected.reverse();
                }
                let actual = engine
                    .items(Some(&key), Some(&to), 0, reverse)
                    .await
                    .expect("items");
                assert_eq!(actual, expected, "step {step}: range {key}..={to}");
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_ops_match_model() {
    let store = TestStore::new();
    let mut rng = StdRng::seed_from_u64(0x71DE);
    let mut model = BTreeMap::new();

    let engine = store.open::<u32, String>().await;
    run_ops(&engine, &mut model, &mut rng, 2000).await;
    assert_matches(&engine, &model).await;
    engine.close().await.expect("close");

    let engine = store.open::<u32, String>().await;
    assert_matches(&engine, &model).await;
    run_ops(&engine, &mut model, &mut rng, 1000).await;
    assert_matches(&engine, &model).await;

    engine.wait_until_idle().await;
    let stats = engine.stats();
    assert_eq!(stats.pending_tasks, 0);
    assert_eq!(stats.tracked_addresses, 0);
    assert_eq!(stats.queued_writes, 0);
    engine.close().await.expect("close");
}

//! Property tests for handle assignment and event ordering.

use proptest::prelude::*;
use rfh_core::{EventQueue, Handle, HandleRegistry, Resource};
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;

struct Item(u32);

impl Resource for Item {}

#[derive(Debug, Clone)]
enum Op {
    Create,
    FailedCreate,
    Remove(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Create),
        1 => Just(Op::FailedCreate),
        2 => any::<usize>().prop_map(Op::Remove),
    ]
}

#[test]
fn test_create_remove_get_sequence() {
    let registry = HandleRegistry::new("example");
    let a = registry.try_create(|| Ok(Item(10))).unwrap();
    let b = registry.try_create(|| Ok(Item(20))).unwrap();
    assert_eq!(a, Handle::new(1));
    assert_eq!(b, Handle::new(2));

    assert_eq!(registry.remove(a).unwrap().0, 10);
    assert!(registry.get(a).is_err());
    assert_eq!(registry.get(b).unwrap().0, 20);
}

proptest! {
    #[test]
    fn prop_handles_unique_and_never_reused(ops in prop::collection::vec(op(), 1..200)) {
        let registry = HandleRegistry::new("prop");
        let mut issued: Vec<Handle> = Vec::new();
        let mut removed: HashSet<Handle> = HashSet::new();

        for op in ops {
            match op {
                Op::Create => {
                    let handle = registry.create(Item(0)).unwrap();
                    if let Some(last) = issued.last() {
                        prop_assert!(handle > *last);
                    }
                    issued.push(handle);
                }
                Op::FailedCreate => {
                    let before = registry.last_issued();
                    let refused = registry
                        .try_create(|| -> anyhow::Result<Item> { anyhow::bail!("refused") })
                        .is_err();
                    prop_assert!(refused);
                    prop_assert_eq!(registry.last_issued(), before);
                }
                Op::Remove(pick) => {
                    if issued.is_empty() {
                        continue;
                    }
                    let handle = issued[pick % issued.len()];
                    let result = registry.remove(handle);
                    prop_assert_eq!(result.is_ok(), !removed.contains(&handle));
                    removed.insert(handle);
                }
            }
        }

        // Removed handles stay dead even after later creates
        for handle in &removed {
            prop_assert!(registry.get(*handle).is_err());
        }
        prop_assert_eq!(registry.len(), issued.len() - removed.len());

        // Handles are dense from 1 because failed creates consume nothing
        let expected: Vec<Handle> = (1..=issued.len() as u32).map(Handle::new).collect();
        prop_assert_eq!(issued, expected);
    }

    #[test]
    fn prop_drain_preserves_publish_order(
        names in prop::collection::vec("[a-z]{1,6}", 1..50),
        batch in 1usize..10,
    ) {
        let queue = EventQueue::new();
        for (i, name) in names.iter().enumerate() {
            queue.publish(name.clone(), json!({ "i": i }));
        }

        let mut seen = Vec::new();
        loop {
            let records = queue.drain_blocking(batch, Duration::ZERO);
            if records.is_empty() {
                break;
            }
            prop_assert!(records.len() <= batch);
            seen.extend(records);
        }

        let got: Vec<(String, u64)> = seen
            .iter()
            .map(|r| (r.name().to_string(), r.get("i").and_then(|v| v.as_u64()).unwrap()))
            .collect();
        let want: Vec<(String, u64)> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as u64))
            .collect();
        prop_assert_eq!(got, want);
    }
}

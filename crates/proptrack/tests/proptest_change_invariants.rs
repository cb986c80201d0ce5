//! Property-based invariant tests for change batching and delivery.
//!
//! Verifies:
//!
//! 1. A batch of writes delivers `old` = value before the first write and
//!    `new` = value after the last write
//! 2. The default detector suppresses batches whose writes cancel out, and
//!    the pending record is cleared either way
//! 3. Raw pipelines deliver every written property exactly once per cycle
//! 4. Properties are delivered in the order they first became pending
//! 5. Any number of update requests in one turn run the hooks once
//! 6. Callback chains run ancestors first, then in registration order
//! 7. Two pipelines on one property receive independent change sets

use std::cell::RefCell;
use std::rc::Rc;

use proptest::prelude::*;
use proptrack::{
    ChangeRecord, ChangeSet, PendingKey, PropertyKey, Runtime, on_property_change, on_update,
    register_change_callback, request_update,
};

// ── Helpers ──────────────────────────────────────────────────────────

const PROPERTIES: [PropertyKey; 4] = ["alpha", "beta", "gamma", "delta"];

type Records = Rc<RefCell<Vec<(PropertyKey, ChangeRecord<i64>)>>>;

fn arb_writes() -> impl Strategy<Value = Vec<(usize, i64)>> {
    proptest::collection::vec((0..PROPERTIES.len(), -3i64..=3), 1..=24)
}

/// Expected net changes: first-pending order, (first old, last new).
fn net_changes(writes: &[(usize, i64)]) -> Vec<(PropertyKey, i64, i64)> {
    let mut current = [0i64; PROPERTIES.len()];
    let mut out: Vec<(PropertyKey, i64, i64)> = Vec::new();
    for &(index, value) in writes {
        let property = PROPERTIES[index];
        match out.iter_mut().find(|(p, _, _)| *p == property) {
            Some(entry) => entry.2 = value,
            None => out.push((property, current[index], value)),
        }
        current[index] = value;
    }
    out
}

fn observed_runtime() -> (Runtime<i64>, proptrack::TypeKey, Records) {
    let runtime = Runtime::new();
    let ty = runtime.define_type("Model", None).unwrap();
    let records: Records = Rc::default();
    for property in PROPERTIES {
        let sink = Rc::clone(&records);
        on_property_change(&runtime, ty, property, move |_, record| {
            sink.borrow_mut().push((property, record.clone()));
            Ok(())
        })
        .unwrap();
    }
    (runtime, ty, records)
}

// ═════════════════════════════════════════════════════════════════════════
// 1–2. Net change per property, cancelled batches suppressed
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn batch_delivers_first_old_and_last_new(writes in arb_writes()) {
        let (runtime, ty, records) = observed_runtime();
        let model = runtime.instantiate(ty).unwrap();

        for &(index, value) in &writes {
            model.set(PROPERTIES[index], value);
        }
        prop_assert!(records.borrow().is_empty());
        runtime.run_microtasks().unwrap();

        let expected: Vec<_> = net_changes(&writes)
            .into_iter()
            .filter(|(_, old, new)| old != new)
            .map(|(property, old, new)| (property, ChangeRecord::new(old, new)))
            .collect();
        prop_assert_eq!(&*records.borrow(), &expected);
        prop_assert!(!model.has_pending(PendingKey::ENGINE));
    }

    #[test]
    fn values_read_back_after_flush(writes in arb_writes()) {
        let (runtime, ty, _) = observed_runtime();
        let model = runtime.instantiate(ty).unwrap();
        for &(index, value) in &writes {
            model.set(PROPERTIES[index], value);
        }
        runtime.run_microtasks().unwrap();
        for (property, _, new) in net_changes(&writes) {
            prop_assert_eq!(model.get(property), new);
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 3–4. Raw pipelines see every written property, in first-pending order
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn raw_pipeline_delivers_every_written_property(writes in arb_writes()) {
        let runtime: Runtime<i64> = Runtime::new();
        let ty = runtime.define_type("Model", None).unwrap();
        let deliveries: Rc<RefCell<Vec<ChangeSet<i64>>>> = Rc::default();
        let sink = Rc::clone(&deliveries);
        let pipeline = runtime.create_pipeline(move |_, changes| {
            sink.borrow_mut().push(changes.clone());
            Ok(())
        });
        for property in PROPERTIES {
            pipeline.register_property(ty, property).unwrap();
        }

        let model = runtime.instantiate(ty).unwrap();
        for &(index, value) in &writes {
            model.set(PROPERTIES[index], value);
        }
        runtime.run_microtasks().unwrap();

        let expected: ChangeSet<i64> = net_changes(&writes)
            .into_iter()
            .map(|(property, old, new)| (property, ChangeRecord::new(old, new)))
            .collect();
        let delivered = deliveries.borrow();
        prop_assert_eq!(delivered.len(), 1);
        prop_assert_eq!(
            delivered[0].properties().collect::<Vec<_>>(),
            expected.properties().collect::<Vec<_>>()
        );
        prop_assert_eq!(&delivered[0], &expected);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 5. Coalescing
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn requests_in_one_turn_run_hooks_once(turns in proptest::collection::vec(1usize..=8, 1..=6)) {
        let runtime: Runtime<i64> = Runtime::new();
        let ty = runtime.define_type("Model", None).unwrap();
        let runs = Rc::new(RefCell::new(0usize));
        let counter = Rc::clone(&runs);
        on_update(&runtime, ty, move |_| {
            *counter.borrow_mut() += 1;
            Ok(())
        })
        .unwrap();

        let model = runtime.instantiate(ty).unwrap();
        for (turn, &requests) in turns.iter().enumerate() {
            for _ in 0..requests {
                request_update(&model);
            }
            prop_assert_eq!(runtime.pending_microtasks(), 1);
            runtime.run_microtasks().unwrap();
            prop_assert_eq!(*runs.borrow(), turn + 1);
            prop_assert!(!model.update_requested());
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 6. Callback chain order
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn chain_runs_ancestors_first(owners in proptest::collection::vec(0usize..3, 1..=12)) {
        let runtime: Runtime<i64> = Runtime::new();
        let root = runtime.define_type("Root", None).unwrap();
        let middle = runtime.define_type("Middle", Some(root)).unwrap();
        let leaf = runtime.define_type("Leaf", Some(middle)).unwrap();
        let types = [root, middle, leaf];

        let order = Rc::new(RefCell::new(Vec::new()));
        for (registration, &depth) in owners.iter().enumerate() {
            let sink = Rc::clone(&order);
            register_change_callback(&runtime, types[depth], "value", move |_, _| {
                sink.borrow_mut().push((depth, registration));
                Ok(())
            })
            .unwrap();
        }
        on_property_change(&runtime, leaf, "value", |_, _| Ok(())).unwrap();

        let item = runtime.instantiate(leaf).unwrap();
        item.set("value", 1);
        runtime.run_microtasks().unwrap();

        let mut expected: Vec<(usize, usize)> =
            owners.iter().copied().enumerate().map(|(r, d)| (d, r)).collect();
        expected.sort_unstable();
        prop_assert_eq!(&*order.borrow(), &expected);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 7. Pipeline isolation
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn pipelines_receive_independent_sets(
        writes in arb_writes(),
        extra_requests in 0usize..4,
    ) {
        let runtime: Runtime<i64> = Runtime::new();
        let ty = runtime.define_type("Model", None).unwrap();

        let first_seen: Rc<RefCell<Vec<ChangeSet<i64>>>> = Rc::default();
        let second_seen: Rc<RefCell<Vec<ChangeSet<i64>>>> = Rc::default();
        let sink = Rc::clone(&first_seen);
        let first = runtime.create_pipeline(move |_, changes| {
            sink.borrow_mut().push(changes.clone());
            Ok(())
        });
        let sink = Rc::clone(&second_seen);
        let second = runtime.create_pipeline(move |_, changes| {
            sink.borrow_mut().push(changes.clone());
            Ok(())
        });
        for property in PROPERTIES {
            first.register_property(ty, property).unwrap();
            second.register_property(ty, property).unwrap();
        }

        let model = runtime.instantiate(ty).unwrap();
        for &(index, value) in &writes {
            model.set(PROPERTIES[index], value);
        }
        runtime.run_microtasks().unwrap();
        prop_assert_eq!(&*first_seen.borrow(), &*second_seen.borrow());

        for _ in 0..extra_requests {
            second.request_update(&model).unwrap();
            runtime.run_microtasks().unwrap();
        }
        prop_assert_eq!(first_seen.borrow().len(), 1);
        prop_assert_eq!(second_seen.borrow().len(), 1 + extra_requests);
        prop_assert!(second_seen.borrow()[1..].iter().all(ChangeSet::is_empty));
    }
}

//! Cross-implementation scheduler tests
//!
//! Drives whole schedules through the serial and parallel schedulers and
//! checks that dependency-respecting dispatch keeps the merged state
//! transition identical to strict in-order execution.

use fugue_scheduler::{ParallelScheduler, Scheduler, SerialScheduler, TxnDispatch, TxnStatus};
use fugue_state::{ContextManager, InMemoryContextManager, StateRoot};
use fugue_types::{Batch, BatchId, Transaction, TransactionHeader, TxnId};
use std::collections::BTreeMap;
use std::sync::Arc;

fn make_txn(id: &str, inputs: &[&str], outputs: &[&str]) -> Transaction {
    Transaction::new(
        id,
        TransactionHeader {
            signer: "signer".into(),
            family_name: "test".into(),
            family_version: "1.0".into(),
            inputs: inputs.iter().map(|a| a.to_string()).collect(),
            outputs: outputs.iter().map(|a| a.to_string()).collect(),
            dependencies: vec![],
            payload_sha512: String::new(),
        },
        id.as_bytes().to_vec(),
    )
}

/// A block's worth of batches: (batch id, [(txn id, inputs, outputs)]).
type Workload<'a> = &'a [(&'a str, &'a [(&'a str, &'a [&'a str], &'a [&'a str])])];

fn load(sched: &dyn Scheduler, workload: Workload<'_>) {
    for (batch_id, txns) in workload {
        let transactions = txns
            .iter()
            .map(|(id, inputs, outputs)| make_txn(id, inputs, outputs))
            .collect();
        sched
            .add_batch(Batch::new(*batch_id, transactions), None, false)
            .unwrap();
    }
    sched.finalize();
}

/// Execute a dispatch: every output address gets the transaction's own id
/// as its value.
fn apply_valid(sched: &dyn Scheduler, cm: &InMemoryContextManager, dispatch: &TxnDispatch) {
    let ctx = cm
        .create_context(
            &dispatch.base_root,
            &dispatch.base_contexts,
            dispatch.txn.inputs(),
            dispatch.txn.outputs(),
        )
        .unwrap();
    let writes = dispatch
        .txn
        .outputs()
        .iter()
        .map(|addr| (addr.clone(), dispatch.id().as_str().as_bytes().to_vec()))
        .collect();
    cm.set(&ctx, writes).unwrap();
    sched.set_status(dispatch.id(), TxnStatus::Valid(ctx)).unwrap();
}

/// Run to completion strictly one at a time, in whatever order the
/// scheduler hands transactions out.
fn drive_in_order(sched: &dyn Scheduler, cm: &InMemoryContextManager) {
    while !sched.complete(false) {
        if let Some(dispatch) = sched.next_transaction() {
            apply_valid(sched, cm, &dispatch);
        }
    }
}

/// Run to completion, but hold every concurrently-ready transaction and
/// report outcomes in reverse dispatch order to shake the wall-clock
/// schedule loose from the arrival order.
fn drive_reversed(sched: &dyn Scheduler, cm: &InMemoryContextManager) {
    while !sched.complete(false) {
        let mut wave = Vec::new();
        while let Some(dispatch) = sched.next_transaction() {
            wave.push(dispatch);
        }
        for dispatch in wave.iter().rev() {
            apply_valid(sched, cm, dispatch);
        }
    }
}

/// The state root stamped on the last valid batch of a completed
/// schedule.
fn final_root(sched: &dyn Scheduler) -> StateRoot {
    sched
        .batch_ids()
        .into_iter()
        .rev()
        .find_map(|id| sched.batch_result(&id).unwrap().unwrap().state_root)
        .unwrap()
}

fn run_serial(workload: Workload<'_>) -> (StateRoot, BTreeMap<String, Vec<u8>>) {
    let cm = Arc::new(InMemoryContextManager::new());
    let sched = SerialScheduler::new(cm.clone(), cm.first_root(), true);
    load(&sched, workload);
    drive_in_order(&sched, &cm);
    let root = final_root(&sched);
    let state = cm.state_at(&root).unwrap();
    (root, state)
}

fn run_parallel_reversed(workload: Workload<'_>) -> (StateRoot, BTreeMap<String, Vec<u8>>) {
    let cm = Arc::new(InMemoryContextManager::new());
    let sched = ParallelScheduler::new(cm.clone(), cm.first_root(), true);
    load(&sched, workload);
    drive_reversed(&sched, &cm);
    let root = final_root(&sched);
    let state = cm.state_at(&root).unwrap();
    (root, state)
}

const CONFLICTING_WORKLOAD: Workload<'static> = &[
    ("b1", &[
        ("t1", &["aa"], &["aa"]),
        ("t2", &[], &["bb"]),
    ]),
    ("b2", &[
        ("t3", &["aa"], &["aabb"]),
        ("t4", &["bb"], &["cc"]),
    ]),
    ("b3", &[
        ("t5", &["aabb", "cc"], &["dd"]),
        ("t6", &[], &["ee"]),
    ]),
    ("b4", &[
        ("t7", &["aa"], &["aa"]),
    ]),
];

#[test]
fn serial_dispatch_order_equals_arrival_order() {
    let cm = Arc::new(InMemoryContextManager::new());
    let sched = SerialScheduler::new(cm.clone(), cm.first_root(), true);
    load(&sched, CONFLICTING_WORKLOAD);
    drive_in_order(&sched, &cm);

    let flattened: Vec<TxnId> = CONFLICTING_WORKLOAD
        .iter()
        .flat_map(|(_, txns)| txns.iter().map(|(id, _, _)| TxnId::new(*id)))
        .collect();
    let dispatched: Vec<TxnId> = (0..sched.dispatch_count())
        .map(|i| sched.dispatched(i).unwrap().id().clone())
        .collect();
    assert_eq!(dispatched, flattened);
}

#[test]
fn parallel_matches_serial_on_conflicting_workload() {
    let (serial_root, serial_state) = run_serial(CONFLICTING_WORKLOAD);
    let (parallel_root, parallel_state) = run_parallel_reversed(CONFLICTING_WORKLOAD);

    assert_eq!(serial_state, parallel_state);
    assert_eq!(serial_root, parallel_root);
}

#[test]
fn parallel_matches_serial_on_independent_workload() {
    let workload: Workload<'static> = &[
        ("b1", &[("t1", &[], &["aa"]), ("t2", &[], &["bb"])]),
        ("b2", &[("t3", &[], &["cc"]), ("t4", &[], &["dd"])]),
    ];
    let (serial_root, _) = run_serial(workload);
    let (parallel_root, _) = run_parallel_reversed(workload);
    assert_eq!(serial_root, parallel_root);
}

#[test]
fn parallel_matches_serial_on_write_chain() {
    // Every transaction rewrites the same address; the last arrival wins.
    let workload: Workload<'static> = &[
        ("b1", &[("t1", &["aa"], &["aa"]), ("t2", &["aa"], &["aa"])]),
        ("b2", &[("t3", &["aa"], &["aa"])]),
        ("b3", &[("t4", &["aa"], &["aa"])]),
    ];
    let (serial_root, serial_state) = run_serial(workload);
    let (parallel_root, parallel_state) = run_parallel_reversed(workload);

    assert_eq!(serial_state.get("aa"), Some(&b"t4".to_vec()));
    assert_eq!(serial_state, parallel_state);
    assert_eq!(serial_root, parallel_root);
}

#[test]
fn conflicting_successor_sees_predecessor_write() {
    // T2 is declared after T1 and reads the address T1 writes: T2's
    // execution context must reflect T1's outcome.
    let cm = Arc::new(InMemoryContextManager::new());
    let sched = ParallelScheduler::new(cm.clone(), cm.first_root(), true);

    sched
        .add_batch(
            Batch::new("b1", vec![make_txn("t1", &["aa"], &["aa"])]),
            None,
            false,
        )
        .unwrap();
    sched
        .add_batch(
            Batch::new("b2", vec![make_txn("t2", &["aa"], &["bb"])]),
            None,
            false,
        )
        .unwrap();
    sched.finalize();

    let t1 = sched.next_transaction().unwrap();
    apply_valid(&sched, &cm, &t1);

    let t2 = sched.next_transaction().unwrap();
    let ctx = cm
        .create_context(
            &t2.base_root,
            &t2.base_contexts,
            t2.txn.inputs(),
            t2.txn.outputs(),
        )
        .unwrap();
    assert_eq!(
        cm.get(&ctx, &"aa".to_string()).unwrap(),
        Some(b"t1".to_vec())
    );
}

#[test]
fn transaction_added_after_failure_reads_around_excluded_batch() {
    // t1 writes aa, t2 rewrites aa and fails. A transaction registered
    // afterwards must derive its context from t1, as if t2's batch was
    // never part of the block.
    let cm = Arc::new(InMemoryContextManager::new());
    let sched = ParallelScheduler::new(cm.clone(), cm.first_root(), true);

    sched
        .add_batch(
            Batch::new("b1", vec![make_txn("t1", &["aa"], &["aa"])]),
            None,
            false,
        )
        .unwrap();
    sched
        .add_batch(
            Batch::new("b2", vec![make_txn("t2", &["aa"], &["aa"])]),
            None,
            false,
        )
        .unwrap();

    let t1 = sched.next_transaction().unwrap();
    apply_valid(&sched, &cm, &t1);
    let t2 = sched.next_transaction().unwrap();
    sched.set_status(t2.id(), TxnStatus::Invalid).unwrap();

    sched
        .add_batch(
            Batch::new("b3", vec![make_txn("t3", &["aa"], &["bb"])]),
            None,
            false,
        )
        .unwrap();
    sched.finalize();

    let t3 = sched.next_transaction().unwrap();
    assert_eq!(t3.id(), &TxnId::new("t3"));
    let ctx = cm
        .create_context(
            &t3.base_root,
            &t3.base_contexts,
            t3.txn.inputs(),
            t3.txn.outputs(),
        )
        .unwrap();
    assert_eq!(
        cm.get(&ctx, &"aa".to_string()).unwrap(),
        Some(b"t1".to_vec())
    );
    apply_valid(&sched, &cm, &t3);

    assert!(sched.complete(false));
    assert!(!sched
        .batch_result(&BatchId::new("b2"))
        .unwrap()
        .unwrap()
        .is_valid);
    assert!(sched
        .batch_result(&BatchId::new("b3"))
        .unwrap()
        .unwrap()
        .is_valid);
}

#[test]
fn excluded_context_is_never_squashed() {
    // The invalid transaction's write must not appear in the final state,
    // even though a context was issued for it before the failure report.
    let cm = Arc::new(InMemoryContextManager::new());
    let sched = ParallelScheduler::new(cm.clone(), cm.first_root(), true);

    sched
        .add_batch(
            Batch::new("b1", vec![make_txn("t1", &[], &["aa"])]),
            None,
            false,
        )
        .unwrap();
    sched
        .add_batch(
            Batch::new("b2", vec![make_txn("t2", &[], &["bb"])]),
            None,
            false,
        )
        .unwrap();
    sched.finalize();

    let t1 = sched.next_transaction().unwrap();
    let t2 = sched.next_transaction().unwrap();

    // t2 wrote into a context before turning out invalid.
    let doomed = cm
        .create_context(&t2.base_root, &[], t2.txn.inputs(), t2.txn.outputs())
        .unwrap();
    cm.set(&doomed, vec![("bb".to_string(), b"t2".to_vec())])
        .unwrap();
    cm.release_contexts(&[doomed]);
    sched.set_status(t2.id(), TxnStatus::Invalid).unwrap();

    apply_valid(&sched, &cm, &t1);
    assert!(sched.complete(false));

    let root = final_root(&sched);
    let state = cm.state_at(&root).unwrap();
    assert_eq!(state.get("aa"), Some(&b"t1".to_vec()));
    assert!(state.get("bb").is_none());
}

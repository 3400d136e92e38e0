//! Failed-speculation log properties.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;

use prism_ci::wire::{SpeculationEncoding, SpeculationRecord, TypeId, UnitId};
use prism_ci::{
    CompilerToRuntime, FailedSpeculationList, HostRuntime, RuntimeConfig, SpeculationLog,
};

fn record() -> impl Strategy<Value = SpeculationRecord> {
    prop::collection::vec(0u8..4, 0..4).prop_map(SpeculationRecord::from)
}

proptest! {
    #[test]
    fn test_list_holds_each_record_once(records in prop::collection::vec(record(), 0..64)) {
        let list = FailedSpeculationList::new();
        let mut seen = BTreeSet::new();
        for r in &records {
            prop_assert_eq!(list.append(r), seen.insert(r.clone()));
        }
        prop_assert_eq!(list.len(), seen.len());

        let stored: Vec<_> = list.iter().cloned().collect();
        let unique: BTreeSet<_> = stored.iter().cloned().collect();
        prop_assert_eq!(unique.len(), stored.len());
    }

    #[test]
    fn test_snapshot_is_union_of_log_and_known(
        stored in prop::collection::vec(record(), 0..16),
        known in prop::collection::vec(record(), 0..16),
    ) {
        let list = FailedSpeculationList::new();
        for r in &stored {
            list.append(r);
        }
        let snapshot = list.snapshot(&known);

        let expected: BTreeSet<_> = stored.iter().chain(&known).cloned().collect();
        let actual: BTreeSet<_> = snapshot.iter().cloned().collect();
        prop_assert_eq!(snapshot.len(), actual.len());
        prop_assert_eq!(actual, expected);
    }
}

#[test]
fn test_concurrent_appends_converge() {
    const THREADS: usize = 8;
    const PER_THREAD: i32 = 64;

    let rt = Arc::new(HostRuntime::new(RuntimeConfig::for_testing()).unwrap());
    let unit = UnitId(1);
    let address = rt.failed_speculations_address(unit);

    let new_counts: Vec<usize> = thread::scope(|s| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let rt = &rt;
                s.spawn(move || {
                    (0..PER_THREAD)
                        .filter(|i| {
                            let r = SpeculationEncoding::new().put_int(*i).finish();
                            rt.add_failed_speculation(address, &r).unwrap()
                        })
                        .count()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(new_counts.iter().sum::<usize>(), PER_THREAD as usize);
    let snapshot = rt.failed_speculations(address, &[]).unwrap();
    assert_eq!(snapshot.len(), PER_THREAD as usize);
}

#[test]
fn test_failure_is_visible_to_next_compilation() {
    let rt = Arc::new(HostRuntime::new(RuntimeConfig::for_testing()).unwrap());
    let unit = UnitId(2);
    let record = SpeculationEncoding::new()
        .put_type(TypeId(5))
        .put_str("exact-type")
        .finish();

    let first = SpeculationLog::new(rt.clone(), unit);
    first.collect_failed_speculations().unwrap();
    assert!(first.speculate(record.clone()).is_some());

    // Deoptimization in the running code.
    rt.add_failed_speculation(first.address(), &record).unwrap();

    let second = SpeculationLog::new(rt.clone(), unit);
    second.collect_failed_speculations().unwrap();
    assert!(!second.may_speculate(&record));
    assert_eq!(second.failed_speculations(), vec![record]);
}

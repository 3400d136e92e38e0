//! Concurrent installation scenarios against the in-process runtime.

use std::sync::{Arc, Barrier};
use std::thread;

use prism_ci::wire::{CompiledArtifact, DependencyAssumption, SpeculationRecord, UnitId};
use prism_ci::{
    ClientConfig, CodeState, CompilerToRuntime, HostRuntime, InstallChannel, InstallOutcome,
    InstalledCode, InvalidationReason, LogAddress, RuntimeConfig,
};

fn setup() -> (Arc<HostRuntime>, InstallChannel) {
    let rt = Arc::new(HostRuntime::new(RuntimeConfig::for_testing()).unwrap());
    let channel = InstallChannel::new(rt.clone(), ClientConfig::for_testing());
    (rt, channel)
}

fn artifact(rt: &HostRuntime, unit: UnitId, size: usize) -> CompiledArtifact {
    CompiledArtifact::builder(unit, rt.allocate_compile_id(unit), vec![0x90; size]).build()
}

#[test]
fn test_racing_installs_leave_one_valid_handle() {
    for _ in 0..32 {
        let (rt, channel) = setup();
        let unit = UnitId(1);
        let artifacts = [artifact(&rt, unit, 32), artifact(&rt, unit, 32)];
        let newest = artifacts[1].compile_id();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<InstalledCode> = thread::scope(|s| {
            let workers: Vec<_> = artifacts
                .iter()
                .map(|a| {
                    let channel = channel.clone();
                    let barrier = Arc::clone(&barrier);
                    s.spawn(move || {
                        let handle = InstalledCode::new("race");
                        barrier.wait();
                        let outcome = channel.install(a, &handle, LogAddress::NULL).unwrap();
                        assert_eq!(outcome, InstallOutcome::Installed);
                        handle
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let valid: Vec<_> = handles.iter().filter(|h| h.is_valid()).collect();
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].compile_id(), Some(newest));

        let loser = handles.iter().find(|h| !h.is_valid()).unwrap();
        assert_eq!(loser.state(), CodeState::Invalidated);
        assert_eq!(loser.invalidation_reason(), Some(InvalidationReason::Superseded));
        assert_eq!(rt.code_cache().entrant_for(unit).unwrap().compile_id(), newest);
    }
}

#[test]
fn test_installs_of_distinct_units_do_not_interfere() {
    let (rt, channel) = setup();
    let handles: Vec<InstalledCode> = thread::scope(|s| {
        let workers: Vec<_> = (0..8u64)
            .map(|unit| {
                let channel = channel.clone();
                let rt = &rt;
                s.spawn(move || {
                    let handle = InstalledCode::new(format!("u{unit}"));
                    let a = artifact(rt, UnitId(unit), 64);
                    channel.install(&a, &handle, LogAddress::NULL).unwrap();
                    handle
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert!(handles.iter().all(InstalledCode::is_valid));
    assert_eq!(rt.stats().snapshot().installed, 8);
    assert_eq!(rt.code_cache().len(), 8);
}

#[test]
fn test_speculation_failed_during_compile_blocks_install() {
    let (rt, channel) = setup();
    let unit = UnitId(4);
    let address = rt.failed_speculations_address(unit);
    let record = SpeculationRecord::from(&b"null-check@12"[..]);

    // Compiler relied on the speculation; deoptimization reports it failed
    // before the artifact reaches the runtime.
    let a = CompiledArtifact::builder(unit, rt.allocate_compile_id(unit), vec![0; 16])
        .assume(DependencyAssumption::Speculation(record.clone()))
        .build();
    rt.add_failed_speculation(address, &record).unwrap();

    let handle = InstalledCode::new("f");
    let outcome = channel.install(&a, &handle, address).unwrap();
    assert_eq!(outcome, InstallOutcome::DependenciesFailed);
    assert_eq!(handle.state(), CodeState::Empty);
    assert!(rt.code_cache().is_empty());
}

#[test]
fn test_install_without_log_address_honors_unit_log() {
    let (rt, channel) = setup();
    let unit = UnitId(6);
    let record = SpeculationRecord::from(&b"bounds@40"[..]);
    let a = CompiledArtifact::builder(unit, rt.allocate_compile_id(unit), vec![0; 16])
        .assume(DependencyAssumption::Speculation(record.clone()))
        .build();

    // The failure lands in the unit's log; the client never asked for it.
    let address = rt.failed_speculations_address(unit);
    rt.add_failed_speculation(address, &record).unwrap();

    let handle = InstalledCode::new("n");
    let outcome = channel.install(&a, &handle, LogAddress::NULL).unwrap();
    assert_eq!(outcome, InstallOutcome::DependenciesFailed);
    assert_eq!(handle.state(), CodeState::Empty);
    assert!(rt.code_cache().is_empty());
    assert_eq!(rt.stats().snapshot().dependencies_failed, 1);
}

#[test]
fn test_handle_transitions_are_monotonic_under_contention() {
    let (rt, channel) = setup();
    let unit = UnitId(9);
    let handle = InstalledCode::new("f");
    channel
        .install(&artifact(&rt, unit, 16), &handle, LogAddress::NULL)
        .unwrap();

    thread::scope(|s| {
        for i in 0..4 {
            let rt = &rt;
            let handle = &handle;
            s.spawn(move || {
                if i % 2 == 0 {
                    rt.invalidate_installed_code(handle, i == 0);
                } else {
                    rt.update_installed_code(handle);
                }
            });
        }
    });

    assert_eq!(handle.state(), CodeState::Invalidated);
    assert!(!rt.update_installed_code(&handle));
    assert!(rt.execute_installed_code(&handle, &[]).unwrap_err().is_invalid_code());
    assert_eq!(rt.stats().snapshot().invalidations, 1);
}

#[test]
fn test_cache_full_is_retryable_after_sweep() {
    let mut config = RuntimeConfig::small_cache();
    config.install_flags = RuntimeConfig::for_testing().install_flags;
    let rt = Arc::new(HostRuntime::new(config).unwrap());
    let channel = InstallChannel::new(rt.clone(), ClientConfig::for_testing());
    let ceiling = rt.config().max_unit_code_size;

    let unit = UnitId(1);
    channel
        .install(&artifact(&rt, unit, ceiling), &InstalledCode::new("a"), LogAddress::NULL)
        .unwrap();
    channel
        .install(&artifact(&rt, unit, ceiling), &InstalledCode::new("b"), LogAddress::NULL)
        .unwrap();

    let other = artifact(&rt, UnitId(2), 64);
    let handle = InstalledCode::new("c");
    let outcome = channel.install(&other, &handle, LogAddress::NULL).unwrap();
    assert_eq!(outcome, InstallOutcome::CacheFull);
    assert!(outcome.is_retryable());

    assert!(rt.request_eviction() > 0);
    let outcome = channel.install(&other, &handle, LogAddress::NULL).unwrap();
    assert_eq!(outcome, InstallOutcome::Installed);
    assert!(handle.is_valid());
}

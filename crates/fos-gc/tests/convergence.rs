//! Repeated-collection convergence tests
//!
//! Chains alternating native -> script -> native lose one native/script pair
//! per collection, so a three-hop chain needs three passes and a fourth finds
//! nothing left to collect.

use std::sync::Arc;

use fos_gc::{CrossHeap, GcConfig, GcController, HeapSide};
use fos_scheduler::{Scheduler, SchedulerConfig, ThreadRegistry, WrapperId};

/// N1 -> S1 -> N2 -> S2 -> N3 -> S3, nothing rooted
fn three_hop_chain(heap: &mut CrossHeap) -> anyhow::Result<Vec<WrapperId>> {
    let mut chain = Vec::new();
    for hop in 1..=3 {
        chain.push(heap.allocate_native(&format!("N{}", hop)));
        chain.push(heap.allocate_script(&format!("S{}", hop)));
    }
    for link in chain.windows(2) {
        heap.add_reference(link[0], link[1])?;
    }
    Ok(chain)
}

fn controller(config: GcConfig) -> GcController {
    GcController::new(Arc::new(ThreadRegistry::new()), config)
}

// ============================================================================
// CROSS-HEAP CHAINS
// ============================================================================

#[test]
fn test_three_hop_chain_converges_in_three_passes() -> anyhow::Result<()> {
    let gc = controller(GcConfig::default());
    let mut heap = CrossHeap::new();
    three_hop_chain(&mut heap)?;

    let report = gc.collect_all_garbage_for_testing(&mut heap);

    assert!(report.converged);
    assert_eq!(report.collected_per_pass(), vec![2, 2, 2, 0]);
    assert_eq!(report.total_collected(), 6);
    assert!(heap.is_empty());
    Ok(())
}

#[test]
fn test_each_pass_unwinds_one_hop() -> anyhow::Result<()> {
    let gc = controller(GcConfig::default());
    let mut heap = CrossHeap::new();
    let chain = three_hop_chain(&mut heap)?;

    for hop in 0..3 {
        let outcome = gc.collect_garbage(&mut heap, fos_gc::CollectionKind::Major);
        assert_eq!((outcome.native, outcome.script), (1, 1));
        assert!(!heap.contains(chain[hop * 2]));
        assert!(!heap.contains(chain[hop * 2 + 1]));
        assert_eq!(heap.len(), 6 - 2 * (hop + 1));
    }
    Ok(())
}

#[test]
fn test_ceiling_stops_before_fixed_point() -> anyhow::Result<()> {
    let gc = controller(GcConfig::default().with_max_convergence_passes(2));
    let mut heap = CrossHeap::new();
    let chain = three_hop_chain(&mut heap)?;

    let report = gc.collect_all_garbage_for_testing(&mut heap);

    assert!(!report.converged);
    assert_eq!(report.collected_per_pass(), vec![2, 2]);
    assert_eq!(heap.len(), 2);
    assert!(heap.contains(chain[4]));
    assert!(heap.contains(chain[5]));
    Ok(())
}

#[test]
fn test_rooted_chain_is_already_fixed() -> anyhow::Result<()> {
    let gc = controller(GcConfig::default());
    let mut heap = CrossHeap::new();
    let chain = three_hop_chain(&mut heap)?;
    heap.add_root(chain[0])?;

    let report = gc.collect_all_garbage_for_testing(&mut heap);

    assert!(report.converged);
    assert_eq!(report.pass_count(), 1);
    assert_eq!(heap.len(), 6);
    Ok(())
}

#[test]
fn test_wrapped_tree_dies_after_wrapper() -> anyhow::Result<()> {
    let gc = controller(GcConfig::default());
    let mut heap = CrossHeap::new();
    let document = heap.allocate_native("document");
    let div = heap.allocate_native("div");
    heap.append_child(document, div)?;
    heap.create_wrapper(div, "HTMLDivElement")?;

    let report = gc.collect_all_garbage_for_testing(&mut heap);

    // The wrapper goes first, then the tree it was keeping alive
    assert_eq!(report.collected_per_pass(), vec![1, 2, 0]);
    assert_eq!(heap.count(HeapSide::Native), 0);
    Ok(())
}

// ============================================================================
// TASK-RETAINED OBJECTS
// ============================================================================

#[test]
fn test_pending_task_keeps_chain_alive() -> anyhow::Result<()> {
    let registry = Arc::new(ThreadRegistry::new());
    let scheduler = Scheduler::new(SchedulerConfig::default());
    registry.register(&scheduler);
    let gc = GcController::new(registry, GcConfig::default());

    let mut heap = CrossHeap::new();
    let chain = three_hop_chain(&mut heap)?;
    scheduler.default_task_runner().post_retaining_task([chain[0]], || {});

    let report = gc.collect_all_garbage_for_testing(&mut heap);
    assert_eq!(report.collected_per_pass(), vec![0]);
    assert_eq!(heap.len(), 6);

    assert_eq!(scheduler.run_until_idle(), 1);
    let report = gc.collect_all_garbage_for_testing(&mut heap);
    assert_eq!(report.collected_per_pass(), vec![2, 2, 2, 0]);
    Ok(())
}

#[test]
fn test_cancelled_task_releases_objects() -> anyhow::Result<()> {
    let registry = Arc::new(ThreadRegistry::new());
    let scheduler = Scheduler::new(SchedulerConfig::default());
    registry.register(&scheduler);
    let gc = GcController::new(registry, GcConfig::default());

    let mut heap = CrossHeap::new();
    let listener = heap.allocate_script("listener");
    let task = scheduler
        .default_task_runner()
        .post_retaining_task([listener], || panic!("cancelled"));
    assert!(task.cancel());

    let report = gc.collect_all_garbage_for_testing(&mut heap);
    assert_eq!(report.collected_per_pass(), vec![1, 0]);
    assert_eq!(scheduler.run_until_idle(), 0);
    Ok(())
}

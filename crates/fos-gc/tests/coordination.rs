//! GC/scheduler coordination tests
//!
//! No task may run between a prologue and its epilogue, on any thread the
//! controller knows about.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fos_gc::{CollectionKind, CrossHeap, GcCallbackFlags, GcConfig, GcController, RetainingRoot};
use fos_scheduler::{Scheduler, SchedulerConfig, SchedulerThread, TaskStatus, ThreadRegistry};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn registered_scheduler() -> (Arc<ThreadRegistry>, Scheduler) {
    let registry = Arc::new(ThreadRegistry::new());
    let scheduler = Scheduler::new(SchedulerConfig::default());
    registry.register(&scheduler);
    (registry, scheduler)
}

// ============================================================================
// BRACKETS
// ============================================================================

#[test]
fn test_task_posted_inside_bracket_waits_for_epilogue() {
    let (registry, scheduler) = registered_scheduler();
    let gc = GcController::new(registry, GcConfig::default());
    let heap = CrossHeap::new();

    gc.gc_prologue(&heap, CollectionKind::Major, GcCallbackFlags::NONE);
    assert!(scheduler.handle().is_gc_paused());

    let task = scheduler.default_task_runner().post_task(|| {});
    let idle = scheduler.idle_task_runner().post_idle_task(|_| {});
    assert_eq!(scheduler.run_until_idle(), 0);
    assert!(task.is_pending());
    assert!(idle.is_pending());

    gc.gc_epilogue(&heap, CollectionKind::Major, GcCallbackFlags::NONE);
    assert!(!scheduler.handle().is_gc_paused());
    assert_eq!(scheduler.run_until_idle(), 2);
    assert_eq!(task.status(), TaskStatus::Completed);
}

#[test]
fn test_bracket_holds_dedicated_thread() -> anyhow::Result<()> {
    init_tracing();
    let registry = Arc::new(ThreadRegistry::new());
    let mut worker = SchedulerThread::spawn("worker", SchedulerConfig::default(), Some(registry.clone()), |_| {})?;
    let gc = GcController::new(registry, GcConfig::default());
    let heap = CrossHeap::new();

    gc.gc_prologue(&heap, CollectionKind::Minor, GcCallbackFlags::NONE);
    let reply = worker.task_runner().post_task_with_reply(|| "ran");
    std::thread::sleep(Duration::from_millis(50));
    assert!(reply.try_recv().is_none());
    assert!(reply.handle().is_pending());

    gc.gc_epilogue(&heap, CollectionKind::Minor, GcCallbackFlags::NONE);
    assert_eq!(smol::block_on(reply.recv())?, "ran");

    worker.stop();
    Ok(())
}

#[test]
fn test_terminated_threads_are_not_paused() {
    let (registry, scheduler) = registered_scheduler();
    let handle = scheduler.handle();
    scheduler.shutdown();

    let gc = GcController::new(registry, GcConfig::default());
    let heap = CrossHeap::new();
    gc.gc_prologue(&heap, CollectionKind::Major, GcCallbackFlags::NONE);
    assert!(!handle.is_gc_paused());
    gc.gc_epilogue(&heap, CollectionKind::Major, GcCallbackFlags::NONE);
}

#[test]
#[should_panic(expected = "without a matching gc_prologue")]
fn test_double_epilogue_is_fatal() {
    let (registry, _scheduler) = registered_scheduler();
    let gc = GcController::new(registry, GcConfig::default());
    let heap = CrossHeap::new();

    gc.gc_prologue(&heap, CollectionKind::Major, GcCallbackFlags::NONE);
    gc.gc_epilogue(&heap, CollectionKind::Major, GcCallbackFlags::NONE);
    gc.gc_epilogue(&heap, CollectionKind::Major, GcCallbackFlags::NONE);
}

// ============================================================================
// COLLECTION FROM INSIDE A TASK
// ============================================================================

#[test]
fn test_executing_task_retains_its_objects() -> anyhow::Result<()> {
    let (registry, scheduler) = registered_scheduler();
    let gc = Arc::new(GcController::new(registry, GcConfig::default()));
    let heap = Arc::new(Mutex::new(CrossHeap::new()));

    let (node, wrapper) = {
        let mut heap = heap.lock().unwrap();
        let node = heap.allocate_native("node");
        let wrapper = heap.create_wrapper(node, "Node")?;
        (node, wrapper)
    };

    let outcome = Arc::new(Mutex::new(None));
    let (g, h, o) = (gc.clone(), heap.clone(), outcome.clone());
    let task = scheduler
        .default_task_runner()
        .post_retaining_task([wrapper], move || {
            let mut heap = h.lock().unwrap();
            *o.lock().unwrap() = Some(g.collect_garbage(&mut heap, CollectionKind::Major));
        });
    assert_eq!(scheduler.run_until_idle(), 1);

    let outcome = outcome.lock().unwrap().take().unwrap();
    assert_eq!(outcome.total(), 0);
    let retainers = gc.last_retainer_infos();
    assert_eq!(
        retainers.get(wrapper).map(|info| info.root),
        Some(RetainingRoot::ExecutingTask {
            task: task.id(),
            object: wrapper,
        })
    );
    assert_eq!(retainers.get(node).map(|info| info.depth), Some(1));

    // Nothing retains the pair once the task has finished
    let report = gc.collect_all_garbage_for_testing(&mut heap.lock().unwrap());
    assert_eq!(report.collected_per_pass(), vec![1, 1, 0]);
    Ok(())
}

#[test]
fn test_retainer_snapshot_serializes() -> anyhow::Result<()> {
    let (registry, scheduler) = registered_scheduler();
    let gc = GcController::new(registry, GcConfig::default());
    let mut heap = CrossHeap::new();
    let listener = heap.allocate_script("listener");
    let task = scheduler.default_task_runner().post_retaining_task([listener], || {});

    let json = gc.get_retainer_infos(&heap).to_json()?;
    let value: serde_json::Value = serde_json::from_str(&json)?;
    let entry = &value["entries"][listener.0.to_string()];
    assert_eq!(entry["root"]["kind"], "pending_task");
    assert_eq!(entry["root"]["task"], task.id().0);
    assert_eq!(entry["label"], "listener");
    Ok(())
}

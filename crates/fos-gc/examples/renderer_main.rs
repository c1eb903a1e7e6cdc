//! Example: a renderer thread with GC coordination
//!
//! Spawns a scheduler thread, posts work that retains heap objects, runs a
//! collection while the work is queued and prints the retainer snapshot.

use std::sync::Arc;
use std::time::Duration;

use fos_gc::{CollectionKind, CrossHeap, GcConfig, GcController};
use fos_scheduler::{SchedulerConfig, SchedulerThread, ThreadRegistry};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let registry = Arc::new(ThreadRegistry::new());
    let mut renderer = SchedulerThread::spawn("renderer", SchedulerConfig::default(), Some(registry.clone()), |wrapper| {
        tracing::info!("Renderer thread ready: {:?}", wrapper.thread_id());
    })?;
    let gc = GcController::new(registry, GcConfig::default());

    println!("fOS GC v{} initialized", fos_gc::VERSION);

    // document > body, with a wrapper for body holding a listener
    let mut heap = CrossHeap::new();
    let document = heap.allocate_native("document");
    let body = heap.allocate_native("body");
    heap.append_child(document, body)?;
    let wrapper = heap.create_wrapper(body, "HTMLBodyElement")?;
    let listener = heap.allocate_script("onload");
    heap.add_reference(wrapper, listener)?;
    heap.allocate_script("temporary");

    // The listener stays alive until this task has run
    let task = renderer
        .task_runner()
        .post_delayed_task(Duration::from_millis(20), || tracing::info!("onload fired"));
    let retaining = renderer
        .task_runner()
        .post_retaining_task([wrapper], || tracing::info!("dispatching load event"));

    let outcome = gc.collect_garbage(&mut heap, CollectionKind::Major);
    println!("Collected {} objects while work was queued", outcome.total());
    println!("{}", gc.last_retainer_infos().to_json()?);

    while task.is_pending() || retaining.is_pending() {
        std::thread::sleep(Duration::from_millis(5));
    }

    let report = gc.collect_all_garbage_for_testing(&mut heap);
    println!(
        "Converged: {} after {} passes, {} objects left",
        report.converged,
        report.pass_count(),
        heap.len()
    );

    renderer.stop();
    Ok(())
}

//! GC Controller
//!
//! Coordination surface the embedding collector calls around every
//! collection. The prologue holds the run loop of every registered scheduler
//! thread and the epilogue releases it, so no task runs inside the bracket.
//! Tasks already executing when the prologue arrives run to completion.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use fos_scheduler::{SchedulerHandle, TaskRoot, ThreadRegistry, WrapperId};

use crate::config::GcConfig;
use crate::error::GcError;
use crate::heap::{CrossHeap, HeapObject, HeapSide};
use crate::retainer::RetainerInfos;

/// Collection kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    /// Scripting heap scavenge only
    Minor,
    /// Native pass followed by a scripting pass
    Major,
}

impl CollectionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Minor => "minor",
            Self::Major => "major",
        }
    }
}

/// Flags the collector passes to the prologue and epilogue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcCallbackFlags {
    /// Requested explicitly rather than by allocation pressure
    pub forced: bool,
    pub synchronous_phantom_processing: bool,
    /// Part of a repeated collection that wants everything collectable
    pub collect_all_available_garbage: bool,
}

impl GcCallbackFlags {
    pub const NONE: Self = Self {
        forced: false,
        synchronous_phantom_processing: false,
        collect_all_available_garbage: false,
    };

    /// Flags used by the repeated-collection entry point
    pub const COLLECT_ALL: Self = Self {
        forced: true,
        synchronous_phantom_processing: true,
        collect_all_available_garbage: true,
    };
}

/// GC statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    pub collections: u64,
    pub minor_collections: u64,
    pub major_collections: u64,
    pub native_collected: u64,
    pub script_collected: u64,
    /// Objects reachable at the last recorded prologue
    pub last_retained: usize,
}

/// Objects freed by one collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionOutcome {
    pub native: usize,
    pub script: usize,
}

impl CollectionOutcome {
    pub fn total(&self) -> usize {
        self.native + self.script
    }
}

/// Result of a repeated collection
#[derive(Debug, Clone, Default)]
pub struct ConvergenceReport {
    /// One entry per pass, including the final empty pass
    pub passes: Vec<CollectionOutcome>,
    /// A pass collected nothing before the ceiling was hit
    pub converged: bool,
}

impl ConvergenceReport {
    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    pub fn total_collected(&self) -> usize {
        self.passes.iter().map(CollectionOutcome::total).sum()
    }

    /// Objects collected per pass
    pub fn collected_per_pass(&self) -> Vec<usize> {
        self.passes.iter().map(CollectionOutcome::total).collect()
    }
}

/// Collection currently between prologue and epilogue
#[derive(Debug)]
struct ActiveCollection {
    kind: CollectionKind,
    paused: Vec<SchedulerHandle>,
    started: Instant,
}

#[derive(Debug, Default)]
struct ControllerState {
    active: Option<ActiveCollection>,
    last_retainers: RetainerInfos,
    stats: GcStats,
}

/// Garbage collection coordinator for all scheduler threads in a registry
#[derive(Debug)]
pub struct GcController {
    registry: Arc<ThreadRegistry>,
    config: GcConfig,
    state: Mutex<ControllerState>,
}

impl GcController {
    pub fn new(registry: Arc<ThreadRegistry>, config: GcConfig) -> Self {
        Self {
            registry,
            config,
            state: Mutex::new(ControllerState::default()),
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Is a prologue waiting for its epilogue?
    pub fn in_collection(&self) -> bool {
        self.lock().active.is_some()
    }

    /// Objects retained by every live scheduler's pending and executing tasks
    pub fn task_roots(&self) -> Vec<TaskRoot> {
        let mut roots = Vec::new();
        for handle in self.registry.live_threads() {
            handle.trace_tasks(&mut |root| roots.push(root));
        }
        roots
    }

    // ------------------------------------------------------------------
    // Collector hooks
    // ------------------------------------------------------------------

    /// Start of a collection: hold every scheduler's run loop.
    ///
    /// # Panics
    /// If the previous prologue has not been matched by an epilogue.
    pub fn gc_prologue(&self, heap: &CrossHeap, kind: CollectionKind, flags: GcCallbackFlags) {
        let mut state = self.lock();
        if let Some(active) = &state.active {
            panic!(
                "gc_prologue({}) called while a {} collection is still open",
                kind.name(),
                active.kind.name()
            );
        }

        let paused = self.registry.live_threads();
        for handle in &paused {
            handle.enter_gc_pause();
        }
        tracing::debug!(
            "GC prologue ({}, {:?}): paused {} scheduler threads",
            kind.name(),
            flags,
            paused.len()
        );

        if self.config.record_retainers {
            let retainers = RetainerInfos::compute(heap, &self.task_roots());
            state.stats.last_retained = retainers.len();
            state.last_retainers = retainers;
        }

        state.active = Some(ActiveCollection {
            kind,
            paused,
            started: Instant::now(),
        });
    }

    /// End of a collection: release the run loops held by the prologue.
    ///
    /// # Panics
    /// If there is no open prologue, or it was for a different kind.
    pub fn gc_epilogue(&self, heap: &CrossHeap, kind: CollectionKind, flags: GcCallbackFlags) {
        let mut state = self.lock();
        let Some(active) = state.active.take() else {
            panic!("gc_epilogue({}) without a matching gc_prologue", kind.name());
        };
        if active.kind != kind {
            panic!(
                "gc_epilogue({}) does not match gc_prologue({})",
                kind.name(),
                active.kind.name()
            );
        }

        state.stats.collections += 1;
        match kind {
            CollectionKind::Minor => state.stats.minor_collections += 1,
            CollectionKind::Major => state.stats.major_collections += 1,
        }
        drop(state);

        for handle in &active.paused {
            handle.exit_gc_pause();
        }
        tracing::debug!(
            "GC epilogue ({}, {:?}): {} objects live, resumed {} threads after {:?}",
            kind.name(),
            flags,
            heap.len(),
            active.paused.len(),
            active.started.elapsed()
        );
    }

    // ------------------------------------------------------------------
    // Collection entry points
    // ------------------------------------------------------------------

    /// Run one bracketed collection
    pub fn collect_garbage(&self, heap: &mut CrossHeap, kind: CollectionKind) -> CollectionOutcome {
        self.collect_with_flags(heap, kind, GcCallbackFlags::NONE)
    }

    fn collect_with_flags(&self, heap: &mut CrossHeap, kind: CollectionKind, flags: GcCallbackFlags) -> CollectionOutcome {
        self.gc_prologue(heap, kind, flags);

        let task_roots = self.task_roots();
        let mut outcome = CollectionOutcome::default();
        if kind == CollectionKind::Major {
            outcome.native = heap.collect_native(&task_roots);
        }
        outcome.script = heap.collect_script(&task_roots);

        {
            let mut state = self.lock();
            state.stats.native_collected += outcome.native as u64;
            state.stats.script_collected += outcome.script as u64;
        }
        self.gc_epilogue(heap, kind, flags);

        tracing::info!(
            "{} collection freed {} native and {} script objects",
            kind.name(),
            outcome.native,
            outcome.script
        );
        outcome
    }

    /// Collect repeatedly until a pass frees nothing or the pass ceiling is
    /// reached. Chains that alternate between the heaps need one pass per
    /// hop. Test support only.
    pub fn collect_all_garbage_for_testing(&self, heap: &mut CrossHeap) -> ConvergenceReport {
        let mut report = ConvergenceReport::default();
        for pass in 1..=self.config.max_convergence_passes {
            let outcome = self.collect_with_flags(heap, CollectionKind::Major, GcCallbackFlags::COLLECT_ALL);
            report.passes.push(outcome);
            tracing::debug!("Convergence pass {} collected {}", pass, outcome.total());
            if outcome.total() == 0 {
                report.converged = true;
                break;
            }
        }

        if !report.converged {
            tracing::warn!(
                "Heap still shrinking after {} passes ({} objects collected)",
                report.pass_count(),
                report.total_collected()
            );
        }
        report
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Object keeping `id` alive across the heap boundary
    pub fn opaque_root_for_gc(&self, heap: &CrossHeap, id: WrapperId) -> Result<WrapperId, GcError> {
        heap.opaque_root(id)
    }

    /// Visit every scripting wrapper reachable from tasks and live roots
    pub fn trace_wrappers(&self, heap: &CrossHeap, visitor: &mut dyn FnMut(&HeapObject)) -> usize {
        let retainers = RetainerInfos::compute(heap, &self.task_roots());
        let mut visited = 0;
        for (id, info) in retainers.iter() {
            if info.side != HeapSide::Script {
                continue;
            }
            if let Ok(object) = heap.get(id) {
                visitor(object);
                visited += 1;
            }
        }
        visited
    }

    /// Does any object sharing `context`'s opaque root have work in flight?
    pub fn has_pending_activity(&self, heap: &CrossHeap, context: WrapperId) -> Result<bool, GcError> {
        let root = heap.opaque_root(context)?;
        Ok(heap
            .iter()
            .filter(|o| o.has_pending_activity())
            .any(|o| heap.opaque_root(o.id()).is_ok_and(|r| r == root)))
    }

    /// Fresh retainer snapshot for the current heap and task queues
    pub fn get_retainer_infos(&self, heap: &CrossHeap) -> RetainerInfos {
        RetainerInfos::compute(heap, &self.task_roots())
    }

    /// Snapshot taken at the most recent prologue
    pub fn last_retainer_infos(&self) -> RetainerInfos {
        self.lock().last_retainers.clone()
    }

    /// Get GC stats
    pub fn stats(&self) -> GcStats {
        self.lock().stats
    }
}

//! Retainer Diagnostics
//!
//! A point-in-time answer to "what keeps this object alive?" for every object
//! reachable from a root. Not a live view: the snapshot is stale as soon as
//! the heap or the task queues change.

use std::collections::{BTreeMap, VecDeque};

use fos_scheduler::{TaskId, TaskRoot, WrapperId};
use serde::{Deserialize, Serialize};

use crate::heap::{CrossHeap, HeapSide};

/// Root a retained object was first reached from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetainingRoot {
    /// Held by the task currently running
    ExecutingTask { task: TaskId, object: WrapperId },
    /// Held by a queued task
    PendingTask { task: TaskId, object: WrapperId },
    NativeRoot { object: WrapperId },
    ScriptRoot { object: WrapperId },
    /// Native object with work in flight
    PendingActivity { object: WrapperId },
}

impl RetainingRoot {
    /// Object the root starts from
    pub fn object(&self) -> WrapperId {
        match *self {
            Self::ExecutingTask { object, .. }
            | Self::PendingTask { object, .. }
            | Self::NativeRoot { object }
            | Self::ScriptRoot { object }
            | Self::PendingActivity { object } => object,
        }
    }

    /// Is this object retained by scheduled work?
    pub fn is_task(&self) -> bool {
        matches!(self, Self::ExecutingTask { .. } | Self::PendingTask { .. })
    }
}

/// Why one object is alive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainerInfo {
    pub side: HeapSide,
    pub label: String,
    pub root: RetainingRoot,
    pub opaque_root: WrapperId,
    /// Edges between the root and this object
    pub depth: usize,
}

/// Snapshot of retainer information keyed by object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainerInfos {
    entries: BTreeMap<WrapperId, RetainerInfo>,
}

impl RetainerInfos {
    /// Walk the heap breadth-first from every root. Each object is attributed
    /// to the first root that reaches it; task roots are visited first.
    pub fn compute(heap: &CrossHeap, task_roots: &[TaskRoot]) -> Self {
        let mut roots: Vec<RetainingRoot> = Vec::new();
        let (executing, pending): (Vec<&TaskRoot>, Vec<&TaskRoot>) = task_roots.iter().partition(|r| r.executing);
        roots.extend(executing.iter().map(|r| RetainingRoot::ExecutingTask {
            task: r.task,
            object: r.object,
        }));
        roots.extend(pending.iter().map(|r| RetainingRoot::PendingTask {
            task: r.task,
            object: r.object,
        }));
        roots.extend(heap.native_roots().map(|object| RetainingRoot::NativeRoot { object }));
        roots.extend(heap.script_roots().map(|object| RetainingRoot::ScriptRoot { object }));
        roots.extend(
            heap.iter()
                .filter(|o| o.has_pending_activity())
                .map(|o| RetainingRoot::PendingActivity { object: o.id() }),
        );

        let mut entries = BTreeMap::new();
        let mut queue: VecDeque<(WrapperId, RetainingRoot, usize)> =
            roots.into_iter().map(|root| (root.object(), root, 0)).collect();

        while let Some((id, root, depth)) = queue.pop_front() {
            if entries.contains_key(&id) {
                continue;
            }
            let Ok(object) = heap.get(id) else {
                continue;
            };
            let opaque_root = heap.opaque_root(id).unwrap_or(id);
            entries.insert(
                id,
                RetainerInfo {
                    side: object.side(),
                    label: object.label().to_string(),
                    root,
                    opaque_root,
                    depth,
                },
            );
            queue.extend(object.edges().map(|next| (next, root, depth + 1)));
        }

        Self { entries }
    }

    pub fn get(&self, id: WrapperId) -> Option<&RetainerInfo> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: WrapperId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (WrapperId, &RetainerInfo)> {
        self.entries.iter().map(|(id, info)| (*id, info))
    }

    /// Objects retained by pending or executing tasks
    pub fn task_retained(&self) -> impl Iterator<Item = WrapperId> + '_ {
        self.iter().filter(|(_, info)| info.root.is_task()).map(|(id, _)| id)
    }

    /// Serialize for diagnostics consumers
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

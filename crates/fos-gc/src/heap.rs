//! Cross-Heap Object Graph
//!
//! Native objects form trees (a node keeps its whole tree alive) and may hold
//! scripting objects. Scripting objects may wrap a native object and may hold
//! native objects. Each heap is collected by its own mark-and-sweep pass and
//! treats references from the other heap as roots.
//!
//! A major collection runs the native pass first, while every scripting
//! object still exists, then the scripting pass against the surviving native
//! objects. A chain that alternates native -> script -> native therefore loses
//! one native/script pair per collection.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use fos_scheduler::{TaskRoot, WrapperId};
use serde::{Deserialize, Serialize};

use crate::error::GcError;

/// Which heap an object lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeapSide {
    Native,
    Script,
}

impl HeapSide {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Script => "script",
        }
    }
}

impl fmt::Display for HeapSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One object in either heap
#[derive(Debug, Clone)]
pub struct HeapObject {
    id: WrapperId,
    side: HeapSide,
    label: String,
    parent: Option<WrapperId>,
    children: Vec<WrapperId>,
    refs: Vec<WrapperId>,
    wraps: Option<WrapperId>,
    pending_activity: bool,
}

impl HeapObject {
    fn new(id: WrapperId, side: HeapSide, label: &str) -> Self {
        Self {
            id,
            side,
            label: label.to_string(),
            parent: None,
            children: Vec::new(),
            refs: Vec::new(),
            wraps: None,
            pending_activity: false,
        }
    }

    pub fn id(&self) -> WrapperId {
        self.id
    }

    pub fn side(&self) -> HeapSide {
        self.side
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Tree parent (native objects only)
    pub fn parent(&self) -> Option<WrapperId> {
        self.parent
    }

    pub fn children(&self) -> &[WrapperId] {
        &self.children
    }

    /// Outgoing references, to either heap
    pub fn refs(&self) -> &[WrapperId] {
        &self.refs
    }

    /// Native object this scripting wrapper stands for
    pub fn wraps(&self) -> Option<WrapperId> {
        self.wraps
    }

    pub fn has_pending_activity(&self) -> bool {
        self.pending_activity
    }

    /// Every object this one keeps reachable
    pub(crate) fn edges(&self) -> impl Iterator<Item = WrapperId> + '_ {
        self.refs
            .iter()
            .chain(self.children.iter())
            .copied()
            .chain(self.parent)
            .chain(self.wraps)
    }
}

/// Native and scripting heaps plus the references between them
#[derive(Debug, Default)]
pub struct CrossHeap {
    objects: BTreeMap<WrapperId, HeapObject>,
    native_roots: BTreeSet<WrapperId>,
    script_roots: BTreeSet<WrapperId>,
    next_id: u64,
}

impl CrossHeap {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self, side: HeapSide, label: &str) -> WrapperId {
        self.next_id += 1;
        let id = WrapperId(self.next_id);
        self.objects.insert(id, HeapObject::new(id, side, label));
        tracing::trace!("Allocated {} object {} ({})", side, id, label);
        id
    }

    /// Allocate a native object
    pub fn allocate_native(&mut self, label: &str) -> WrapperId {
        self.allocate(HeapSide::Native, label)
    }

    /// Allocate a plain scripting object
    pub fn allocate_script(&mut self, label: &str) -> WrapperId {
        self.allocate(HeapSide::Script, label)
    }

    /// Allocate a scripting wrapper for a native object
    pub fn create_wrapper(&mut self, native: WrapperId, label: &str) -> Result<WrapperId, GcError> {
        self.expect_side(native, HeapSide::Native)?;
        let id = self.allocate(HeapSide::Script, label);
        if let Some(wrapper) = self.objects.get_mut(&id) {
            wrapper.wraps = Some(native);
        }
        Ok(id)
    }

    /// Attach a native object under a native parent
    pub fn append_child(&mut self, parent: WrapperId, child: WrapperId) -> Result<(), GcError> {
        self.expect_side(parent, HeapSide::Native)?;
        self.expect_side(child, HeapSide::Native)?;

        if let Some(old) = self.objects.get(&child).and_then(|c| c.parent) {
            if let Some(old_parent) = self.objects.get_mut(&old) {
                old_parent.children.retain(|&c| c != child);
            }
        }
        if let Some(node) = self.objects.get_mut(&child) {
            node.parent = Some(parent);
        }
        if let Some(node) = self.objects.get_mut(&parent) {
            node.children.push(child);
        }
        Ok(())
    }

    /// Add a reference from one object to another, on either heap
    pub fn add_reference(&mut self, from: WrapperId, to: WrapperId) -> Result<(), GcError> {
        self.get(to)?;
        let object = self.get_mut(from)?;
        if !object.refs.contains(&to) {
            object.refs.push(to);
        }
        Ok(())
    }

    pub fn remove_reference(&mut self, from: WrapperId, to: WrapperId) -> Result<bool, GcError> {
        let object = self.get_mut(from)?;
        let before = object.refs.len();
        object.refs.retain(|&r| r != to);
        Ok(object.refs.len() != before)
    }

    /// Mark a native object as having work in flight
    pub fn set_pending_activity(&mut self, id: WrapperId, pending: bool) -> Result<(), GcError> {
        self.expect_side(id, HeapSide::Native)?;
        self.get_mut(id)?.pending_activity = pending;
        Ok(())
    }

    /// Make an object a root of its heap
    pub fn add_root(&mut self, id: WrapperId) -> Result<(), GcError> {
        match self.get(id)?.side {
            HeapSide::Native => self.native_roots.insert(id),
            HeapSide::Script => self.script_roots.insert(id),
        };
        Ok(())
    }

    pub fn remove_root(&mut self, id: WrapperId) -> bool {
        self.native_roots.remove(&id) | self.script_roots.remove(&id)
    }

    pub fn get(&self, id: WrapperId) -> Result<&HeapObject, GcError> {
        self.objects.get(&id).ok_or(GcError::UnknownObject(id))
    }

    fn get_mut(&mut self, id: WrapperId) -> Result<&mut HeapObject, GcError> {
        self.objects.get_mut(&id).ok_or(GcError::UnknownObject(id))
    }

    fn expect_side(&self, id: WrapperId, expected: HeapSide) -> Result<&HeapObject, GcError> {
        let object = self.get(id)?;
        if object.side != expected {
            return Err(GcError::SideMismatch {
                id,
                expected,
                found: object.side,
            });
        }
        Ok(object)
    }

    pub fn contains(&self, id: WrapperId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Number of live objects on one heap
    pub fn count(&self, side: HeapSide) -> usize {
        self.objects.values().filter(|o| o.side == side).count()
    }

    /// Objects in id order
    pub fn iter(&self) -> impl Iterator<Item = &HeapObject> {
        self.objects.values()
    }

    pub fn native_roots(&self) -> impl Iterator<Item = WrapperId> + '_ {
        self.native_roots.iter().copied()
    }

    pub fn script_roots(&self) -> impl Iterator<Item = WrapperId> + '_ {
        self.script_roots.iter().copied()
    }

    /// Wrappers standing for a native object
    pub fn wrappers_of(&self, native: WrapperId) -> impl Iterator<Item = WrapperId> + '_ {
        self.objects
            .values()
            .filter(move |o| o.wraps == Some(native))
            .map(|o| o.id)
    }

    /// Object responsible for keeping `id` alive across the heap boundary.
    ///
    /// Native objects resolve to the root of their tree. Scripting wrappers
    /// resolve through the native object they wrap. Anything else is its
    /// own opaque root.
    pub fn opaque_root(&self, id: WrapperId) -> Result<WrapperId, GcError> {
        let object = self.get(id)?;
        match (object.side, object.wraps) {
            (HeapSide::Script, Some(native)) => self.opaque_root(native),
            (HeapSide::Script, None) => Ok(id),
            (HeapSide::Native, _) => {
                let mut current = object;
                let mut seen = HashSet::new();
                while let Some(parent) = current.parent {
                    if !seen.insert(current.id) {
                        break;
                    }
                    current = self.get(parent)?;
                }
                Ok(current.id)
            }
        }
    }

    /// Group key used by the scripting pass: wrappers group by opaque root,
    /// plain scripting objects do not group
    fn group_of(&self, object: &HeapObject) -> Option<WrapperId> {
        object.wraps.and_then(|native| self.opaque_root(native).ok())
    }

    // ------------------------------------------------------------------
    // Collection passes
    // ------------------------------------------------------------------

    /// Mark and sweep the native heap. Every existing scripting object is
    /// treated as live. Returns the number of objects collected.
    pub(crate) fn collect_native(&mut self, task_roots: &[TaskRoot]) -> usize {
        let mut worklist: Vec<WrapperId> = self.native_roots.iter().copied().collect();
        worklist.extend(task_roots.iter().map(|r| r.object));
        for object in self.objects.values() {
            match object.side {
                HeapSide::Native if object.pending_activity => worklist.push(object.id),
                HeapSide::Native => {}
                HeapSide::Script => worklist.extend(object.edges()),
            }
        }

        let marked = self.mark(HeapSide::Native, worklist);
        self.sweep(HeapSide::Native, &marked)
    }

    /// Mark and sweep the scripting heap against the surviving native
    /// objects. Returns the number of objects collected.
    pub(crate) fn collect_script(&mut self, task_roots: &[TaskRoot]) -> usize {
        let mut worklist: Vec<WrapperId> = self.script_roots.iter().copied().collect();
        worklist.extend(task_roots.iter().map(|r| r.object));
        for object in self.objects.values() {
            match object.side {
                HeapSide::Native => worklist.extend(object.refs.iter().copied()),
                HeapSide::Script => {
                    let wraps_active = object
                        .wraps
                        .and_then(|native| self.objects.get(&native))
                        .is_some_and(|native| native.pending_activity);
                    if wraps_active {
                        worklist.push(object.id);
                    }
                }
            }
        }

        let mut marked = self.mark(HeapSide::Script, worklist);

        // Wrappers sharing an opaque root live or die together
        loop {
            let live_groups: HashSet<WrapperId> = marked
                .iter()
                .filter_map(|id| self.objects.get(id))
                .filter_map(|object| self.group_of(object))
                .collect();
            let joined: Vec<WrapperId> = self
                .objects
                .values()
                .filter(|o| o.side == HeapSide::Script && !marked.contains(&o.id))
                .filter(|o| self.group_of(o).is_some_and(|group| live_groups.contains(&group)))
                .map(|o| o.id)
                .collect();
            if joined.is_empty() {
                break;
            }
            tracing::trace!("{} wrappers kept alive by their object group", joined.len());
            marked.extend(self.mark(HeapSide::Script, joined));
        }

        self.sweep(HeapSide::Script, &marked)
    }

    /// Objects on `side` reachable from `worklist` without leaving that side
    fn mark(&self, side: HeapSide, mut worklist: Vec<WrapperId>) -> HashSet<WrapperId> {
        let mut marked = HashSet::new();
        while let Some(id) = worklist.pop() {
            let Some(object) = self.objects.get(&id) else {
                continue;
            };
            if object.side != side || !marked.insert(id) {
                continue;
            }
            worklist.extend(object.edges());
        }
        marked
    }

    fn sweep(&mut self, side: HeapSide, marked: &HashSet<WrapperId>) -> usize {
        let dead: Vec<WrapperId> = self
            .objects
            .values()
            .filter(|o| o.side == side && !marked.contains(&o.id))
            .map(|o| o.id)
            .collect();
        if dead.is_empty() {
            return 0;
        }

        for id in &dead {
            if let Some(object) = self.objects.remove(id) {
                tracing::trace!("Collected {} object {} ({})", side, id, object.label);
            }
            self.native_roots.remove(id);
            self.script_roots.remove(id);
        }

        let objects = &self.objects;
        let alive = |id: &WrapperId| objects.contains_key(id);
        let mut pruned: Vec<(WrapperId, HeapObject)> = Vec::new();
        for object in objects.values() {
            let dangling = object.refs.iter().chain(object.children.iter()).any(|id| !alive(id))
                || object.parent.is_some_and(|p| !alive(&p))
                || object.wraps.is_some_and(|w| !alive(&w));
            if dangling {
                let mut object = object.clone();
                object.refs.retain(|id| alive(id));
                object.children.retain(|id| alive(id));
                object.parent = object.parent.filter(|p| alive(p));
                object.wraps = object.wraps.filter(|w| alive(w));
                pruned.push((object.id, object));
            }
        }
        self.objects.extend(pruned);

        dead.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapper_requires_native() {
        let mut heap = CrossHeap::new();
        let script = heap.allocate_script("obj");
        assert!(matches!(
            heap.create_wrapper(script, "bad"),
            Err(GcError::SideMismatch {
                expected: HeapSide::Native,
                found: HeapSide::Script,
                ..
            })
        ));
        assert!(matches!(
            heap.add_reference(script, WrapperId(999)),
            Err(GcError::UnknownObject(WrapperId(999)))
        ));
    }

    #[test]
    fn test_opaque_root_walks_tree() {
        let mut heap = CrossHeap::new();
        let document = heap.allocate_native("document");
        let body = heap.allocate_native("body");
        let div = heap.allocate_native("div");
        heap.append_child(document, body).unwrap();
        heap.append_child(body, div).unwrap();
        let wrapper = heap.create_wrapper(div, "HTMLDivElement").unwrap();
        let loose = heap.allocate_script("closure");

        assert_eq!(heap.opaque_root(div).unwrap(), document);
        assert_eq!(heap.opaque_root(wrapper).unwrap(), document);
        assert_eq!(heap.opaque_root(loose).unwrap(), loose);
    }

    #[test]
    fn test_reparent_moves_child() {
        let mut heap = CrossHeap::new();
        let a = heap.allocate_native("a");
        let b = heap.allocate_native("b");
        let child = heap.allocate_native("child");
        heap.append_child(a, child).unwrap();
        heap.append_child(b, child).unwrap();

        assert!(heap.get(a).unwrap().children().is_empty());
        assert_eq!(heap.get(b).unwrap().children(), &[child]);
        assert_eq!(heap.opaque_root(child).unwrap(), b);
    }

    #[test]
    fn test_native_pass_keeps_rooted_tree() {
        let mut heap = CrossHeap::new();
        let document = heap.allocate_native("document");
        let child = heap.allocate_native("child");
        let orphan = heap.allocate_native("orphan");
        heap.append_child(document, child).unwrap();
        heap.add_root(child).unwrap();

        assert_eq!(heap.collect_native(&[]), 1);
        assert!(heap.contains(document));
        assert!(heap.contains(child));
        assert!(!heap.contains(orphan));
    }

    #[test]
    fn test_script_pass_groups_wrappers() {
        let mut heap = CrossHeap::new();
        let document = heap.allocate_native("document");
        let a = heap.allocate_native("a");
        let b = heap.allocate_native("b");
        heap.append_child(document, a).unwrap();
        heap.append_child(document, b).unwrap();
        heap.add_root(document).unwrap();

        let wrapper_a = heap.create_wrapper(a, "A").unwrap();
        let wrapper_b = heap.create_wrapper(b, "B").unwrap();
        let expando = heap.allocate_script("expando");
        heap.add_reference(wrapper_b, expando).unwrap();
        heap.add_root(wrapper_a).unwrap();

        assert_eq!(heap.collect_script(&[]), 0);
        assert!(heap.contains(wrapper_b));
        assert!(heap.contains(expando));
    }

    #[test]
    fn test_pending_activity_keeps_wrapper() {
        let mut heap = CrossHeap::new();
        let request = heap.allocate_native("request");
        let wrapper = heap.create_wrapper(request, "XMLHttpRequest").unwrap();
        heap.set_pending_activity(request, true).unwrap();

        assert_eq!(heap.collect_native(&[]), 0);
        assert_eq!(heap.collect_script(&[]), 0);
        assert!(heap.contains(wrapper));

        heap.set_pending_activity(request, false).unwrap();
        assert_eq!(heap.collect_native(&[]), 0);
        assert_eq!(heap.collect_script(&[]), 1);
        assert_eq!(heap.collect_native(&[]), 1);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_sweep_prunes_dangling_edges() {
        let mut heap = CrossHeap::new();
        let holder = heap.allocate_native("holder");
        let script = heap.allocate_script("value");
        heap.add_reference(holder, script).unwrap();
        heap.add_root(script).unwrap();

        // Native holder dies; the rooted script object survives the script pass
        assert_eq!(heap.collect_native(&[]), 1);
        assert_eq!(heap.collect_script(&[]), 0);

        let native = heap.allocate_native("other");
        heap.add_reference(script, native).unwrap();
        heap.remove_root(script);
        assert_eq!(heap.collect_script(&[]), 1);
        assert_eq!(heap.count(HeapSide::Native), 1);
        assert_eq!(heap.count(HeapSide::Script), 0);
    }
}

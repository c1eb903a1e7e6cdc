//! GC errors

use fos_scheduler::WrapperId;

use crate::heap::HeapSide;

/// Mistakes made while building the cross-heap object graph.
///
/// Collection itself has no recoverable errors: a mismatched
/// prologue/epilogue pair panics.
#[derive(Debug, thiserror::Error)]
pub enum GcError {
    #[error("Unknown heap object {0}")]
    UnknownObject(WrapperId),

    #[error("Object {id} lives on the {found} heap, expected {expected}")]
    SideMismatch {
        id: WrapperId,
        expected: HeapSide,
        found: HeapSide,
    },
}

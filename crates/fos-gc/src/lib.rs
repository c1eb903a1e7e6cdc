//! fOS GC Coordination
//!
//! Keeps the native heap and the scripting heap consistent across garbage
//! collections, and keeps scheduled tasks from running inside a collection.
//!
//! # Overview
//! - [`GcController`]: prologue/epilogue hooks that hold every registered
//!   scheduler thread's run loop for the duration of a collection
//! - [`CrossHeap`]: native trees and scripting objects with cross-heap edges
//! - Opaque-root resolution and object grouping for wrappers
//! - [`RetainerInfos`]: serializable "what keeps this alive" snapshots
//! - A repeated-collection entry point that converges cross-heap chains
//!
//! # Example
//! ```rust,ignore
//! use std::sync::Arc;
//! use fos_gc::{CollectionKind, CrossHeap, GcConfig, GcController};
//! use fos_scheduler::ThreadRegistry;
//!
//! let gc = GcController::new(Arc::new(ThreadRegistry::new()), GcConfig::default());
//! let mut heap = CrossHeap::new();
//! let document = heap.allocate_native("document");
//! heap.add_root(document)?;
//! gc.collect_garbage(&mut heap, CollectionKind::Major);
//! ```

mod config;
mod controller;
mod error;
mod heap;
mod retainer;

pub use config::GcConfig;
pub use controller::{CollectionKind, CollectionOutcome, ConvergenceReport, GcCallbackFlags, GcController, GcStats};
pub use error::GcError;
pub use heap::{CrossHeap, HeapObject, HeapSide};
pub use retainer::{RetainerInfo, RetainerInfos, RetainingRoot};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

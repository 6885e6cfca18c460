//! # scstore-core
//!
//! Embeddable, concurrently accessible store of typed graph elements:
//! nodes, links carrying binary content, and arcs between any two elements
//! (arcs included).
//!
//! ## Layout
//!
//! - Elements live in fixed-size segments addressed by `(segment, offset)`.
//! - Each segment is split into 32 lock sections; an operation locks only
//!   the sections of the elements it touches.
//! - Every element keeps the heads of its outgoing and incoming arc lists,
//!   and every arc threads itself into both lists.
//! - Link content longer than an element's payload slot lives in a
//!   content-addressed [`ContentStore`].
//!
//! ## Access control
//!
//! Every call carries a [`Context`] with read/write levels; every element
//! carries the levels a context needs to read or write it.
//!
//! ## Architectural Constraints
//!
//! - No async runtime, no network dependencies
//! - No `unsafe`: element records are atomics ordered by their section lock
//! - A broken internal invariant aborts the process; it is never reported
//!   as an error

// =============================================================================
// MODULES
// =============================================================================

pub mod config;
pub mod content;
pub mod context;
pub mod event;
pub mod formats;
pub mod iterator;
pub mod primitives;
pub mod storage;
pub mod types;

mod lock;
mod segment;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{AccessLevels, Addr, Checksum, ElementStat, EventType, ScError, ScType};

// =============================================================================
// RE-EXPORTS: Storage
// =============================================================================

pub use config::{ContentBackend, StorageConfig};
pub use content::{ContentStore, MemoryContentStore, RedbContentStore};
pub use context::Context;
pub use event::{EventArgs, EventHandle};
pub use iterator::{Iterator3, Iterator5};
pub use storage::Storage;

// =============================================================================
// RE-EXPORTS: Formats (from formats module)
// =============================================================================

pub use formats::{PersistenceHeader, segments_from_bytes, segments_to_bytes};

//! # Engine Constants
//!
//! Fixed geometry and tuning constants of the store.
//!
//! ## Geometry
//!
//! 1. **Segment**: a fixed array of `SEGMENT_ELEMENTS_COUNT` element slots.
//! 2. **Section**: slots with the same `offset % CONCURRENCY_LEVEL` form one
//!    independently lockable section.
//! 3. **Allocation cache**: `SEGMENT_CACHE_SIZE` slots of segments known to
//!    have free capacity, indexed by context id.

/// Number of element slots in one segment.
///
/// Offsets are `u16`, so every offset value names a slot.
pub const SEGMENT_ELEMENTS_COUNT: usize = 1 << 16;

/// Number of lock sections per segment.
pub const CONCURRENCY_LEVEL: usize = 32;

/// Slots per section.
pub const SECTION_ELEMENTS_COUNT: usize = SEGMENT_ELEMENTS_COUNT / CONCURRENCY_LEVEL;

/// Upper bound on the number of segments (segment index is `u16`).
pub const MAX_SEGMENTS: usize = 1 << 16;

/// Default value of `StorageConfig::max_loaded_segments`.
pub const DEFAULT_MAX_LOADED_SEGMENTS: usize = 1000;

/// Number of slots in the allocation cache.
pub const SEGMENT_CACHE_SIZE: usize = 32;

/// Length of a content checksum in bytes.
pub const CHECKSUM_LEN: usize = 32;

/// Largest link payload stored inline in the element record.
///
/// One byte of the checksum slot holds the length.
pub const MAX_INLINE_CONTENT: usize = CHECKSUM_LEN - 1;

/// Bounded `lock_try` budget used by `arc_new` for each element it locks.
pub const MAX_STORAGE_LOCK_ATTEMPTS: u32 = 100;

/// Bounded `lock_try` budget used by iterators when stepping along a list.
pub const ITERATOR_LOCK_ATTEMPTS: u32 = 10;

/// Number of attempts an iterator makes to pin a fixed element.
pub const PIN_ATTEMPTS: u32 = 1000;

/// Sleep between two pin attempts, in microseconds.
pub const PIN_RETRY_SLEEP_US: u64 = 1000;

/// Spins before a blocking section lock starts yielding the thread.
pub const SPIN_BEFORE_YIELD: u32 = 64;

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Magic bytes for the segment file header.
///
/// - File Header = Magic Bytes ("SCSG") + Version (u8) before payload.
pub const MAGIC_BYTES: &[u8; 4] = b"SCSG";

/// Current segment file format version.
///
/// Increment this when making breaking changes to the serialization format.
pub const FORMAT_VERSION: u8 = 1;

/// Name of the segment file inside the repository directory.
pub const SEGMENTS_FILE_NAME: &str = "segments.scg";

/// Name of the redb content database inside the repository directory.
pub const CONTENT_DB_FILE_NAME: &str = "content.redb";

/// Name of the memory content store snapshot inside the repository directory.
pub const CONTENT_SNAPSHOT_FILE_NAME: &str = "content.bin";

/// Magic bytes for the memory content store snapshot header.
pub const CONTENT_MAGIC_BYTES: &[u8; 4] = b"SCCT";

//! # Formats
//!
//! On-disk encodings of segments and content snapshots.

pub mod persistence;

pub use persistence::{
    ContentEntry, MAX_PERSISTENCE_PAYLOAD_SIZE, PersistenceHeader, SegmentBlock,
    content_from_bytes, content_to_bytes, segments_from_bytes, segments_to_bytes,
};

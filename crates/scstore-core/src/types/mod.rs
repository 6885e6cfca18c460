//! # Core Type Definitions
//!
//! This module contains the value types shared by every part of the store:
//! - Element addresses (`Addr`)
//! - Element type bitmasks (`ScType`)
//! - Access levels (`AccessLevels`)
//! - Element lifecycle state (`ElementState`)
//! - Content checksums (`Checksum`)
//! - Event kinds (`EventType`) and storage statistics (`ElementStat`)
//! - Error types (`ScError`)
//!
//! ## Bit Layout
//!
//! `ScType` keeps the classic sc-type bit assignment so that type masks
//! written against one store are meaningful to another. Bits `0x4000` and
//! `0x8000` are internal flags and never leave the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr};
use thiserror::Error;

use crate::primitives::CHECKSUM_LEN;

// =============================================================================
// ADDRESS
// =============================================================================

/// Address of one element slot: segment index plus offset inside the segment.
///
/// `(0, 0)` is the empty address. The slot it would name is reserved when
/// segment 0 is created, so no element ever lives there.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Addr {
    /// Segment index.
    pub seg: u16,
    /// Offset inside the segment.
    pub offset: u16,
}

impl Addr {
    /// The "no element" address.
    pub const EMPTY: Self = Self { seg: 0, offset: 0 };

    /// Create an address from its two parts.
    #[must_use]
    pub const fn new(seg: u16, offset: u16) -> Self {
        Self { seg, offset }
    }

    /// Whether this is the empty address.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.seg == 0 && self.offset == 0
    }

    /// Pack into a `u32` (segment in the high half).
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        ((self.seg as u32) << 16) | self.offset as u32
    }

    /// Unpack from a `u32` produced by [`Addr::to_u32`].
    #[must_use]
    pub const fn from_u32(raw: u32) -> Self {
        Self {
            seg: (raw >> 16) as u16,
            offset: (raw & 0xffff) as u16,
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.seg, self.offset)
    }
}

// =============================================================================
// ELEMENT TYPE
// =============================================================================

/// Element type bitmask.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ScType(pub u16);

impl ScType {
    /// Wildcard: matches every element in iterator templates.
    pub const UNKNOWN: Self = Self(0);

    // --- element kinds ---
    pub const NODE: Self = Self(0x1);
    pub const LINK: Self = Self(0x2);
    pub const EDGE_COMMON: Self = Self(0x4);
    pub const ARC_COMMON: Self = Self(0x8);
    pub const ARC_ACCESS: Self = Self(0x10);

    // --- constancy ---
    pub const CONST: Self = Self(0x20);
    pub const VAR: Self = Self(0x40);

    // --- access arc subtypes ---
    pub const ARC_POS: Self = Self(0x80);
    pub const ARC_NEG: Self = Self(0x100);
    pub const ARC_FUZ: Self = Self(0x200);
    pub const ARC_TEMP: Self = Self(0x400);
    pub const ARC_PERM: Self = Self(0x800);

    // --- node struct subtypes ---
    pub const NODE_TUPLE: Self = Self(0x80);
    pub const NODE_STRUCT: Self = Self(0x100);
    pub const NODE_ROLE: Self = Self(0x200);
    pub const NODE_NOROLE: Self = Self(0x400);
    pub const NODE_CLASS: Self = Self(0x800);
    pub const NODE_ABSTRACT: Self = Self(0x1000);
    pub const NODE_MATERIAL: Self = Self(0x2000);

    // --- masks ---
    pub const ELEMENT_MASK: Self = Self(0x1f);
    pub const ARC_MASK: Self = Self(0x1c);
    pub const CONSTANCY_MASK: Self = Self(0x60);
    pub const ARC_POS_MASK: Self = Self(0x380);
    pub const ARC_PERM_MASK: Self = Self(0xc00);
    pub const NODE_STRUCT_MASK: Self = Self(0x3f80);

    // --- internal flags ---
    /// Legacy "request deletion" bit. Deletion state now lives in
    /// [`ElementState`]; the bit is only stripped, never set.
    pub const REQUEST_DELETION: Self = Self(0x4000);
    /// Link content is stored inline in the element record.
    pub const LINK_INLINE: Self = Self(0x8000);
    pub const INTERNAL_FLAGS: Self = Self(0xc000);

    // --- common composites ---
    pub const NODE_CONST: Self = Self(0x1 | 0x20);
    pub const NODE_VAR: Self = Self(0x1 | 0x40);
    pub const NODE_CONST_CLASS: Self = Self(0x1 | 0x20 | 0x800);
    pub const NODE_CONST_ROLE: Self = Self(0x1 | 0x20 | 0x200);
    pub const NODE_CONST_NOROLE: Self = Self(0x1 | 0x20 | 0x400);
    pub const NODE_CONST_TUPLE: Self = Self(0x1 | 0x20 | 0x80);
    pub const LINK_CONST: Self = Self(0x2 | 0x20);
    pub const ARC_COMMON_CONST: Self = Self(0x8 | 0x20);
    pub const EDGE_COMMON_CONST: Self = Self(0x4 | 0x20);
    pub const ARC_POS_CONST_PERM: Self = Self(0x10 | 0x20 | 0x80 | 0x800);
    pub const ARC_NEG_CONST_PERM: Self = Self(0x10 | 0x20 | 0x100 | 0x800);
    pub const ARC_POS_VAR_PERM: Self = Self(0x10 | 0x40 | 0x80 | 0x800);

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether `self` and `other` share at least one bit.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// The same type with `other`'s bits cleared.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// The type as callers see it: internal flags cleared.
    #[must_use]
    pub const fn strip_internal_flags(self) -> Self {
        self.without(Self::INTERNAL_FLAGS)
    }

    /// The element-kind bits only.
    #[must_use]
    pub const fn element_kind(self) -> Self {
        Self(self.0 & Self::ELEMENT_MASK.0)
    }

    #[must_use]
    pub const fn is_node(self) -> bool {
        self.intersects(Self::NODE)
    }

    #[must_use]
    pub const fn is_link(self) -> bool {
        self.intersects(Self::LINK)
    }

    #[must_use]
    pub const fn is_arc(self) -> bool {
        self.intersects(Self::ARC_MASK)
    }

    /// Iterator template test: every bit of the template (`self`) must be
    /// present in the stored type once internal flags are removed.
    #[must_use]
    pub const fn matches(self, stored: Self) -> bool {
        self.0 & stored.strip_internal_flags().0 == self.0
    }
}

impl BitOr for ScType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for ScType {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for ScType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

// =============================================================================
// ACCESS LEVELS
// =============================================================================

/// Read/write access pair packed in one byte.
///
/// The read level is the high nibble, the write level the low nibble, each
/// in `0..=15`. A context may read (write) an element when its read (write)
/// level is at least the element's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessLevels(u8);

impl AccessLevels {
    pub const MAX_LEVEL: u8 = 0x0f;
    pub const FULL: Self = Self(0xff);
    pub const NONE: Self = Self(0x00);

    /// Build from separate levels; values above 15 are clamped.
    #[must_use]
    pub const fn new(read: u8, write: u8) -> Self {
        let read = if read > Self::MAX_LEVEL { Self::MAX_LEVEL } else { read };
        let write = if write > Self::MAX_LEVEL { Self::MAX_LEVEL } else { write };
        Self((read << 4) | write)
    }

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn read(self) -> u8 {
        self.0 >> 4
    }

    #[must_use]
    pub const fn write(self) -> u8 {
        self.0 & Self::MAX_LEVEL
    }

    /// Whether a holder of `self` may read an element carrying `element`.
    #[must_use]
    pub const fn can_read(self, element: Self) -> bool {
        self.read() >= element.read()
    }

    /// Whether a holder of `self` may write an element carrying `element`.
    #[must_use]
    pub const fn can_write(self, element: Self) -> bool {
        self.write() >= element.write()
    }

    /// Per-nibble minimum.
    #[must_use]
    pub const fn min(self, other: Self) -> Self {
        let read = if self.read() < other.read() { self.read() } else { other.read() };
        let write = if self.write() < other.write() { self.write() } else { other.write() };
        Self::new(read, write)
    }
}

impl Default for AccessLevels {
    fn default() -> Self {
        Self::NONE
    }
}

// =============================================================================
// ELEMENT STATE
// =============================================================================

/// Lifecycle of one element slot.
///
/// `Live -> PendingDeletion -> Free` when the element is pinned at deletion
/// time, `Live -> Free` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ElementState {
    #[default]
    Free = 0,
    Live = 1,
    PendingDeletion = 2,
}

impl ElementState {
    #[must_use]
    pub const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Live,
            2 => Self::PendingDeletion,
            _ => Self::Free,
        }
    }
}

// =============================================================================
// CHECKSUM
// =============================================================================

/// 32-byte BLAKE3 digest of link content.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Checksum(pub [u8; CHECKSUM_LEN]);

impl Checksum {
    /// Digest of `content`.
    #[must_use]
    pub fn of(content: &[u8]) -> Self {
        Self(*blake3::hash(content).as_bytes())
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CHECKSUM_LEN] {
        &self.0
    }

    /// Lowercase hex encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

// =============================================================================
// EVENTS & STATISTICS
// =============================================================================

/// Kinds of structural change reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    AddOutputArc,
    AddInputArc,
    RemoveOutputArc,
    RemoveInputArc,
    RemoveElement,
    ContentChanged,
}

/// Element counts over all loaded segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ElementStat {
    pub nodes: u64,
    pub links: u64,
    pub arcs: u64,
    /// Free slots. Elements pending deletion still hold their slot, so they
    /// are counted neither here nor as nodes, links or arcs.
    pub empty: u64,
    pub segments: u64,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Error taxonomy of every store operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScError {
    /// Unclassified failure, including transient lock contention.
    #[error("operation failed")]
    Error,

    #[error("invalid parameters")]
    InvalidParams,

    /// The element is not of the kind the operation needs.
    #[error("invalid element type")]
    InvalidType,

    #[error("io error: {0}")]
    Io(String),

    /// The element is logically deleted or otherwise unusable.
    #[error("invalid element state")]
    InvalidState,

    #[error("not found")]
    NotFound,

    #[error("no write rights")]
    NoWriteRights,

    #[error("no read rights")]
    NoReadRights,
}

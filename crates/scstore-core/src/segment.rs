//! # Segments and Section Locks
//!
//! A [`Segment`] is a fixed array of element records plus a parallel array of
//! per-element metadata (the pin count). Slots are partitioned into
//! [`CONCURRENCY_LEVEL`] sections by `offset % CONCURRENCY_LEVEL`; each section
//! is an independently lockable unit that also tracks its own free slots.
//!
//! ## Locking
//!
//! A section lock is an [`OwnerLock`]: owned by a context id, reentrant for
//! that id, never blocking in the OS.
//!
//! ## Element records
//!
//! Every field of an [`Element`] is an atomic. Loads and stores use relaxed
//! ordering; the acquire/release pair on the section spin flag orders them.
//! Callers only touch a record while holding its section.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::lock::OwnerLock;
use crate::primitives::{
    CHECKSUM_LEN, CONCURRENCY_LEVEL, SECTION_ELEMENTS_COUNT, SEGMENT_CACHE_SIZE,
    SEGMENT_ELEMENTS_COUNT,
};
use crate::types::{AccessLevels, Addr, ElementState, ScType};

/// Report a broken internal invariant and abort the process.
pub(crate) fn corrupted(what: fmt::Arguments<'_>) -> ! {
    tracing::error!(invariant = %what, "store invariant violated, aborting");
    std::process::abort()
}

// =============================================================================
// SECTION
// =============================================================================

const NO_HINT: u32 = u32::MAX;

/// One lockable partition of a segment with its free-slot bookkeeping.
#[derive(Debug)]
pub(crate) struct Section {
    lock: OwnerLock,
    empty_count: AtomicU32,
    empty_offset: AtomicU32,
}

impl Section {
    fn new(empty_offset: u32, empty_count: u32) -> Self {
        Self {
            lock: OwnerLock::new(),
            empty_count: AtomicU32::new(empty_count),
            empty_offset: AtomicU32::new(empty_offset),
        }
    }

    pub(crate) fn lock(&self, owner: u64) {
        self.lock.lock(owner);
    }

    pub(crate) fn lock_try(&self, owner: u64, attempts: u32) -> bool {
        self.lock.lock_try(owner, attempts)
    }

    pub(crate) fn unlock(&self, owner: u64) {
        self.lock.unlock(owner);
    }

    pub(crate) fn empty_count(&self) -> u32 {
        self.empty_count.load(Ordering::Relaxed)
    }
}

// =============================================================================
// ELEMENT RECORD
// =============================================================================

/// Indices of the arc fields inside `Element::data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArcField {
    Begin = 0,
    End = 1,
    NextOut = 2,
    PrevOut = 3,
    NextIn = 4,
    PrevIn = 5,
}

const DATA_WORDS: usize = CHECKSUM_LEN / 4;

/// One element slot. Nodes use only the header, arcs use `data[0..6]` as
/// `{begin, end, next_out, prev_out, next_in, prev_in}`, links use all of
/// `data` as a checksum or as a length-prefixed inline payload.
#[derive(Debug, Default)]
pub(crate) struct Element {
    kind: AtomicU16,
    access: AtomicU8,
    state: AtomicU8,
    first_out: AtomicU32,
    first_in: AtomicU32,
    data: [AtomicU32; DATA_WORDS],
}

impl Element {
    pub(crate) fn kind(&self) -> ScType {
        ScType(self.kind.load(Ordering::Relaxed))
    }

    pub(crate) fn set_kind(&self, kind: ScType) {
        self.kind.store(kind.bits(), Ordering::Relaxed);
    }

    pub(crate) fn access(&self) -> AccessLevels {
        AccessLevels::from_bits(self.access.load(Ordering::Relaxed))
    }

    pub(crate) fn set_access(&self, levels: AccessLevels) {
        self.access.store(levels.bits(), Ordering::Relaxed);
    }

    pub(crate) fn state(&self) -> ElementState {
        ElementState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_state(&self, state: ElementState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn is_live(&self) -> bool {
        self.state() == ElementState::Live
    }

    pub(crate) fn first_out(&self) -> Addr {
        Addr::from_u32(self.first_out.load(Ordering::Relaxed))
    }

    pub(crate) fn set_first_out(&self, addr: Addr) {
        self.first_out.store(addr.to_u32(), Ordering::Relaxed);
    }

    pub(crate) fn first_in(&self) -> Addr {
        Addr::from_u32(self.first_in.load(Ordering::Relaxed))
    }

    pub(crate) fn set_first_in(&self, addr: Addr) {
        self.first_in.store(addr.to_u32(), Ordering::Relaxed);
    }

    pub(crate) fn arc(&self, field: ArcField) -> Addr {
        Addr::from_u32(self.data[field as usize].load(Ordering::Relaxed))
    }

    pub(crate) fn set_arc(&self, field: ArcField, addr: Addr) {
        self.data[field as usize].store(addr.to_u32(), Ordering::Relaxed);
    }

    /// The 32 payload bytes of a link.
    pub(crate) fn payload(&self) -> [u8; CHECKSUM_LEN] {
        let mut out = [0u8; CHECKSUM_LEN];
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.data.iter()) {
            chunk.copy_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        out
    }

    pub(crate) fn set_payload(&self, bytes: &[u8; CHECKSUM_LEN]) {
        for (chunk, word) in bytes.chunks_exact(4).zip(self.data.iter()) {
            let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            word.store(value, Ordering::Relaxed);
        }
    }

    fn clear(&self) {
        self.kind.store(0, Ordering::Relaxed);
        self.access.store(0, Ordering::Relaxed);
        self.set_state(ElementState::Free);
        self.first_out.store(0, Ordering::Relaxed);
        self.first_in.store(0, Ordering::Relaxed);
        for word in &self.data {
            word.store(0, Ordering::Relaxed);
        }
    }

    fn record(&self, offset: u16) -> ElementRecord {
        let mut data = [0u32; DATA_WORDS];
        for (slot, word) in data.iter_mut().zip(self.data.iter()) {
            *slot = word.load(Ordering::Relaxed);
        }
        ElementRecord {
            offset,
            kind: self.kind().bits(),
            access: self.access().bits(),
            first_out: self.first_out.load(Ordering::Relaxed),
            first_in: self.first_in.load(Ordering::Relaxed),
            data,
        }
    }

    fn restore(&self, record: &ElementRecord) {
        self.kind.store(record.kind, Ordering::Relaxed);
        self.access.store(record.access, Ordering::Relaxed);
        self.set_state(ElementState::Live);
        self.first_out.store(record.first_out, Ordering::Relaxed);
        self.first_in.store(record.first_in, Ordering::Relaxed);
        for (word, value) in self.data.iter().zip(record.data.iter()) {
            word.store(*value, Ordering::Relaxed);
        }
    }
}

/// Serializable copy of one live element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementRecord {
    pub offset: u16,
    pub kind: u16,
    pub access: u8,
    pub first_out: u32,
    pub first_in: u32,
    pub data: [u32; DATA_WORDS],
}

/// Per-element metadata kept beside the record.
#[derive(Debug, Default)]
struct ElementMeta {
    refs: AtomicU32,
}

// =============================================================================
// SEGMENT
// =============================================================================

/// Fixed-capacity element arena.
pub(crate) struct Segment {
    num: u16,
    elements: Box<[Element]>,
    meta: Box<[ElementMeta]>,
    sections: [Section; CONCURRENCY_LEVEL],
    elements_count: AtomicU32,
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("num", &self.num)
            .field("elements_count", &self.elements_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Segment {
    /// Create an empty segment. In segment 0, slot 0 is reserved for the
    /// empty address.
    pub(crate) fn new(num: u16) -> Self {
        let elements = (0..SEGMENT_ELEMENTS_COUNT)
            .map(|_| Element::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let meta = (0..SEGMENT_ELEMENTS_COUNT)
            .map(|_| ElementMeta::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let sections = std::array::from_fn(|i| {
            if num == 0 && i == 0 {
                Section::new(CONCURRENCY_LEVEL as u32, SECTION_ELEMENTS_COUNT as u32 - 1)
            } else {
                Section::new(i as u32, SECTION_ELEMENTS_COUNT as u32)
            }
        });
        tracing::debug!(segment = num, "segment created");
        Self {
            num,
            elements,
            meta,
            sections,
            elements_count: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub(crate) fn num(&self) -> u16 {
        self.num
    }

    pub(crate) fn section(&self, offset: u16) -> &Section {
        &self.sections[usize::from(offset) % CONCURRENCY_LEVEL]
    }

    pub(crate) fn element(&self, offset: u16) -> &Element {
        &self.elements[usize::from(offset)]
    }

    fn is_reserved(&self, offset: u32) -> bool {
        self.num == 0 && offset == 0
    }

    pub(crate) fn has_empty_slots(&self) -> bool {
        self.sections.iter().any(|s| s.empty_count() > 0)
    }

    pub(crate) fn elements_count(&self) -> u32 {
        self.elements_count.load(Ordering::Relaxed)
    }

    /// Lock `offset`'s section for `owner` and return a guard.
    pub(crate) fn lock(&self, owner: u64, offset: u16) -> Locked<'_> {
        self.section(offset).lock(owner);
        Locked {
            segment: self,
            offset,
            owner,
        }
    }

    pub(crate) fn lock_try(&self, owner: u64, offset: u16, attempts: u32) -> Option<Locked<'_>> {
        self.section(offset)
            .lock_try(owner, attempts)
            .then_some(Locked {
                segment: self,
                offset,
                owner,
            })
    }

    fn slot_is_free(&self, offset: u32) -> bool {
        !self.is_reserved(offset)
            && self.elements[offset as usize].state() == ElementState::Free
    }

    /// First free slot of section `index`, starting after `from` and wrapping.
    fn find_free(&self, index: usize, from: u32) -> Option<u32> {
        let step = CONCURRENCY_LEVEL as u32;
        let first = index as u32;
        let end = SEGMENT_ELEMENTS_COUNT as u32;
        (from + step..end)
            .step_by(CONCURRENCY_LEVEL)
            .chain((first..=from.min(end - 1)).step_by(CONCURRENCY_LEVEL))
            .find(|&offset| self.slot_is_free(offset))
    }

    /// Claim a free slot for `owner`, starting at the section preferred by
    /// `owner` and round-robining through the others. The returned guard
    /// keeps the slot's section locked; the caller initializes the record.
    pub(crate) fn lock_empty_element(&self, owner: u64) -> Option<Locked<'_>> {
        for i in 0..CONCURRENCY_LEVEL {
            let index = (owner as usize).wrapping_add(i) % CONCURRENCY_LEVEL;
            let section = &self.sections[index];
            if section.empty_count() == 0 || !section.lock_try(owner, 1) {
                continue;
            }
            if section.empty_count() == 0 {
                section.unlock(owner);
                continue;
            }

            let hint = section.empty_offset.load(Ordering::Relaxed);
            let found = if hint != NO_HINT && self.slot_is_free(hint) {
                Some(hint)
            } else {
                self.find_free(index, index as u32)
            };
            let Some(offset) = found else {
                corrupted(format_args!(
                    "segment {} section {index} counts free slots but has none",
                    self.num
                ));
            };

            section.empty_count.fetch_sub(1, Ordering::Relaxed);
            self.elements_count.fetch_add(1, Ordering::Relaxed);
            // Mark the slot taken before searching for the next hint.
            self.elements[offset as usize].set_state(ElementState::Live);
            let next = if section.empty_count() == 0 {
                NO_HINT
            } else {
                self.find_free(index, offset).unwrap_or(NO_HINT)
            };
            section.empty_offset.store(next, Ordering::Relaxed);

            return Some(Locked {
                segment: self,
                offset: offset as u16,
                owner,
            });
        }
        None
    }

    /// Zero a slot and return it to its section's free pool.
    /// The caller holds the slot's section.
    pub(crate) fn erase(&self, offset: u16) {
        self.element(offset).clear();
        self.meta[usize::from(offset)].refs.store(0, Ordering::Relaxed);
        let section = self.section(offset);
        section.empty_count.fetch_add(1, Ordering::Relaxed);
        section
            .empty_offset
            .store(u32::from(offset), Ordering::Relaxed);
        self.elements_count.fetch_sub(1, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Pins
    // -------------------------------------------------------------------------

    pub(crate) fn refs(&self, offset: u16) -> u32 {
        self.meta[usize::from(offset)].refs.load(Ordering::Relaxed)
    }

    /// Pin a live element. The caller holds the slot's section.
    pub(crate) fn pin_locked(&self, offset: u16) -> bool {
        if !self.element(offset).is_live() {
            return false;
        }
        self.meta[usize::from(offset)]
            .refs
            .fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Drop a pin; erases the slot when it was the last pin on an element
    /// pending deletion. Returns whether the slot was erased.
    pub(crate) fn unpin(&self, owner: u64, offset: u16) -> bool {
        let _guard = self.lock(owner, offset);
        let refs = &self.meta[usize::from(offset)].refs;
        let previous = refs.load(Ordering::Relaxed);
        if previous == 0 {
            corrupted(format_args!(
                "unpin of {} with no pins",
                Addr::new(self.num, offset)
            ));
        }
        refs.store(previous - 1, Ordering::Relaxed);
        if previous == 1 && self.element(offset).state() == ElementState::PendingDeletion {
            self.erase(offset);
            return true;
        }
        false
    }

    // -------------------------------------------------------------------------
    // Whole-segment access
    // -------------------------------------------------------------------------

    /// Lock every section for `owner`.
    pub(crate) fn lock_all(&self, owner: u64) -> SegmentLock<'_> {
        for section in &self.sections {
            section.lock(owner);
        }
        SegmentLock {
            segment: self,
            owner,
        }
    }

    /// Run `f` over every element of every section, one section locked at a time.
    pub(crate) fn for_each_element(&self, owner: u64, mut f: impl FnMut(&Element)) {
        for (index, section) in self.sections.iter().enumerate() {
            section.lock(owner);
            for offset in (index..SEGMENT_ELEMENTS_COUNT).step_by(CONCURRENCY_LEVEL) {
                f(&self.elements[offset]);
            }
            section.unlock(owner);
        }
    }

    /// Copy of every live element. The caller holds all sections.
    pub(crate) fn records(&self, _lock: &SegmentLock<'_>) -> Vec<ElementRecord> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, el)| el.is_live())
            .map(|(offset, el)| el.record(offset as u16))
            .collect()
    }

    /// Rebuild a segment from saved records.
    pub(crate) fn from_records(num: u16, records: &[ElementRecord]) -> Self {
        let segment = Self::new(num);
        for record in records {
            if segment.is_reserved(u32::from(record.offset)) {
                continue;
            }
            let element = segment.element(record.offset);
            if element.is_live() {
                continue;
            }
            element.restore(record);
            let section = segment.section(record.offset);
            section.empty_count.fetch_sub(1, Ordering::Relaxed);
            segment.elements_count.fetch_add(1, Ordering::Relaxed);
        }
        for (index, section) in segment.sections.iter().enumerate() {
            let hint = if section.empty_count() == 0 {
                NO_HINT
            } else {
                segment
                    .find_free(index, index as u32)
                    .unwrap_or(NO_HINT)
            };
            section.empty_offset.store(hint, Ordering::Relaxed);
        }
        segment
    }
}

// =============================================================================
// GUARDS
// =============================================================================

/// Per-context hint of a segment with free slots, shared by the storage
/// and the pins it hands out. Slot values are `segment + 1`; zero is empty.
#[derive(Debug)]
pub(crate) struct FreeSegmentCache {
    slots: [AtomicU32; SEGMENT_CACHE_SIZE],
}

impl FreeSegmentCache {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    fn slot(&self, owner: u64) -> &AtomicU32 {
        &self.slots[(owner % SEGMENT_CACHE_SIZE as u64) as usize]
    }

    pub(crate) fn append(&self, owner: u64, seg: u16) {
        self.slot(owner).store(u32::from(seg) + 1, Ordering::Relaxed);
    }

    pub(crate) fn get(&self, owner: u64) -> Option<u16> {
        let raw = self.slot(owner).load(Ordering::Relaxed);
        raw.checked_sub(1).map(|seg| seg as u16)
    }
}

/// A pin taken on behalf of a holder that outlives any borrow of the
/// storage (events). Released explicitly with the releasing context's id.
#[derive(Debug)]
pub(crate) struct ElementPin {
    segment: Arc<Segment>,
    offset: u16,
    cache: Arc<FreeSegmentCache>,
}

impl ElementPin {
    /// Wrap a pin the caller has already taken on `offset`.
    pub(crate) fn adopt(
        segment: Arc<Segment>,
        offset: u16,
        cache: Arc<FreeSegmentCache>,
    ) -> Self {
        Self {
            segment,
            offset,
            cache,
        }
    }

    /// Drop the pin. A slot erased by it is offered to the releasing
    /// context's allocation cache.
    pub(crate) fn release(&self, owner: u64) -> bool {
        let erased = self.segment.unpin(owner, self.offset);
        if erased {
            self.cache.append(owner, self.segment.num);
        }
        erased
    }
}

/// A locked element slot. Dropping the guard releases one level of the
/// section lock.
pub(crate) struct Locked<'a> {
    segment: &'a Segment,
    offset: u16,
    owner: u64,
}

impl<'a> Locked<'a> {
    pub(crate) fn addr(&self) -> Addr {
        Addr::new(self.segment.num, self.offset)
    }

    pub(crate) fn element(&self) -> &'a Element {
        self.segment.element(self.offset)
    }

    pub(crate) fn refs(&self) -> u32 {
        self.segment.refs(self.offset)
    }

    pub(crate) fn pin(&self) -> bool {
        self.segment.pin_locked(self.offset)
    }

    pub(crate) fn erase(&self) {
        self.segment.erase(self.offset);
    }
}

impl Drop for Locked<'_> {
    fn drop(&mut self) {
        self.segment.section(self.offset).unlock(self.owner);
    }
}

impl fmt::Debug for Locked<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locked")
            .field("addr", &self.addr())
            .field("owner", &self.owner)
            .finish()
    }
}

/// All sections of a segment held by one owner.
#[derive(Debug)]
pub(crate) struct SegmentLock<'a> {
    segment: &'a Segment,
    owner: u64,
}

impl Drop for SegmentLock<'_> {
    fn drop(&mut self) {
        for section in self.segment.sections.iter().rev() {
            section.unlock(self.owner);
        }
    }
}

//! # Storage
//!
//! The owning handle of the whole store: the segment table, the allocation
//! cache, the content store, and the event registry.
//!
//! ## Segments
//!
//! Segments are append-only. The table is sized to `max_loaded_segments` up
//! front and each slot is filled once; readers never take a lock to find a
//! segment.
//!
//! ## Allocation cache
//!
//! `SEGMENT_CACHE_SIZE` slots, indexed by `context id % SEGMENT_CACHE_SIZE`,
//! each remembering a segment that recently had free capacity. Allocation
//! tries the cached segment first, then scans the table newest-first, and
//! only then appends a new segment.
//!
//! ## Operations
//!
//! - Element creation: [`Storage::node_new`], [`Storage::link_new`],
//!   [`Storage::arc_new`] (see `arcs.rs`)
//! - Deletion: [`Storage::element_free`] (see `free.rs`)
//! - Link content: see `link.rs`
//! - Accessors, access levels, statistics, persistence, events: here

mod arcs;
mod free;
mod link;

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::StorageConfig;
use crate::content::{self, ContentStore};
use crate::context::{Context, ContextIds};
use crate::event::{
    DeleteCallback, EventArgs, EventCallback, EventHandle, EventQueue, EventRegistry,
};
use crate::formats::persistence::{self, SegmentBlock};
use crate::primitives::{
    ITERATOR_LOCK_ATTEMPTS, PIN_ATTEMPTS, PIN_RETRY_SLEEP_US, SEGMENT_ELEMENTS_COUNT,
    SEGMENTS_FILE_NAME,
};
use crate::segment::{ArcField, ElementPin, FreeSegmentCache, Locked, Segment};
use crate::types::{AccessLevels, Addr, ElementStat, EventType, ScError, ScType};

/// Rounds of contended allocation before a new segment is appended anyway.
const ALLOCATION_ROUNDS: u32 = 8;

/// The store.
pub struct Storage {
    config: StorageConfig,
    segments: Box<[OnceLock<Arc<Segment>>]>,
    segments_num: AtomicUsize,
    growth: Mutex<()>,
    cache: Arc<FreeSegmentCache>,
    /// Serializes deletions and saves.
    free_lock: Mutex<()>,
    content: Box<dyn ContentStore>,
    events: EventRegistry,
    ids: Arc<ContextIds>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("segments", &self.segments_count())
            .field("max_loaded_segments", &self.config.max_loaded_segments)
            .field("content", &self.content)
            .finish_non_exhaustive()
    }
}

impl Storage {
    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Start a store. With a repository configured (and `clear` unset) the
    /// saved segments and contents are loaded.
    pub fn open(config: StorageConfig) -> Result<Self, ScError> {
        config.validate()?;
        if let Some(repo) = &config.repo_path {
            fs::create_dir_all(repo).map_err(|e| ScError::Io(e.to_string()))?;
        }
        let content = content::open_content_store(&config)?;
        Self::with_content_store(config, content)
    }

    /// Start a store over an already opened content store.
    pub(crate) fn with_content_store(
        config: StorageConfig,
        content: Box<dyn ContentStore>,
    ) -> Result<Self, ScError> {
        let ids = Arc::new(ContextIds::new());
        let queue = EventQueue::new(config.event_worker_count(), Arc::clone(&ids))?;

        let segments = (0..config.max_loaded_segments)
            .map(|_| OnceLock::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let storage = Self {
            segments,
            segments_num: AtomicUsize::new(0),
            growth: Mutex::new(()),
            cache: Arc::new(FreeSegmentCache::new()),
            free_lock: Mutex::new(()),
            content,
            events: EventRegistry::new(queue),
            ids,
            closed: AtomicBool::new(false),
            config,
        };

        if let (Some(repo), false) = (&storage.config.repo_path, storage.config.clear) {
            let blocks = persistence::load(&repo.join(SEGMENTS_FILE_NAME))?;
            storage.install_segments(blocks)?;
        }

        tracing::debug!(
            segments = storage.segments_count(),
            repo = ?storage.config.repo_path,
            "storage opened"
        );
        Ok(storage)
    }

    /// In-memory store with default settings.
    pub fn in_memory() -> Result<Self, ScError> {
        Self::open(StorageConfig::default())
    }

    fn install_segments(&self, mut blocks: Vec<SegmentBlock>) -> Result<(), ScError> {
        blocks.sort_by_key(|b| b.num);
        let Some(last) = blocks.last() else {
            return Ok(());
        };
        let needed = usize::from(last.num) + 1;
        if needed > self.segments.len() {
            return Err(ScError::Io(format!(
                "repository holds {} segments, limit is {}",
                needed,
                self.segments.len()
            )));
        }

        let mut blocks = blocks.into_iter().peekable();
        for num in 0..needed {
            let segment = match blocks.next_if(|b| usize::from(b.num) == num) {
                Some(block) => {
                    let records = persistence::decode_records(&block.bytes)?;
                    Segment::from_records(num as u16, &records)
                }
                None => Segment::new(num as u16),
            };
            if self.segments[num].set(Arc::new(segment)).is_err() {
                return Err(ScError::InvalidState);
            }
        }
        self.segments_num.store(needed, Ordering::Release);
        Ok(())
    }

    /// Stop the store: drain event callbacks, tear down subscriptions, and
    /// save when `save_on_shutdown` is set.
    pub fn shutdown(mut self) -> Result<(), ScError> {
        self.close()
    }

    fn close(&mut self) -> Result<(), ScError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let ctx = self.ids.context(AccessLevels::FULL);
        self.events.shutdown(&ctx);
        if self.config.save_on_shutdown {
            self.save(&ctx)?;
        }
        tracing::debug!("storage shut down");
        Ok(())
    }

    // =========================================================================
    // CONTEXTS
    // =========================================================================

    /// A new context with the given access levels.
    #[must_use]
    pub fn context(&self, levels: AccessLevels) -> Context {
        self.ids.context(levels)
    }

    /// A new context with full rights.
    #[must_use]
    pub fn full_context(&self) -> Context {
        self.ids.context(AccessLevels::FULL)
    }

    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn content(&self) -> &dyn ContentStore {
        self.content.as_ref()
    }

    // =========================================================================
    // SEGMENTS & ALLOCATION
    // =========================================================================

    #[must_use]
    pub fn segments_count(&self) -> usize {
        self.segments_num.load(Ordering::Acquire)
    }

    fn segment_arc(&self, seg: u16) -> Option<&Arc<Segment>> {
        let seg = usize::from(seg);
        if seg >= self.segments_count() {
            return None;
        }
        self.segments[seg].get()
    }

    pub(crate) fn segment(&self, seg: u16) -> Option<&Segment> {
        self.segment_arc(seg).map(Arc::as_ref)
    }

    fn loaded_segments(&self) -> impl DoubleEndedIterator<Item = &Segment> {
        self.segments[..self.segments_count()]
            .iter()
            .filter_map(|slot| slot.get().map(Arc::as_ref))
    }

    /// Remember `seg` as having free capacity for `ctx`'s cache slot.
    pub(crate) fn cache_append(&self, ctx: &Context, seg: u16) {
        self.cache.append(ctx.id(), seg);
    }

    fn cached_segment(&self, ctx: &Context) -> Option<&Segment> {
        self.segment(self.cache.get(ctx.id())?)
    }

    fn append_segment(&self) -> Option<&Segment> {
        let _growth = self.growth.lock();
        let num = self.segments_count();
        if num >= self.segments.len() {
            return None;
        }
        let segment = Arc::new(Segment::new(num as u16));
        if self.segments[num].set(segment).is_err() {
            return None;
        }
        self.segments_num.store(num + 1, Ordering::Release);
        self.segments[num].get().map(Arc::as_ref)
    }

    /// Claim a free slot. The returned guard holds the slot's section.
    pub(crate) fn allocate(&self, ctx: &Context) -> Result<Locked<'_>, ScError> {
        let owner = ctx.id();
        if let Some(guard) = self
            .cached_segment(ctx)
            .and_then(|segment| segment.lock_empty_element(owner))
        {
            return Ok(guard);
        }

        for _ in 0..ALLOCATION_ROUNDS {
            let mut contended = false;
            for segment in self.loaded_segments().rev() {
                if !segment.has_empty_slots() {
                    continue;
                }
                if let Some(guard) = segment.lock_empty_element(owner) {
                    self.cache_append(ctx, segment.num());
                    return Ok(guard);
                }
                contended = true;
            }
            if !contended {
                break;
            }
            thread::yield_now();
        }

        let segment = self.append_segment().ok_or(ScError::Error)?;
        let guard = segment.lock_empty_element(owner).ok_or(ScError::Error)?;
        self.cache_append(ctx, segment.num());
        Ok(guard)
    }

    // =========================================================================
    // LOCKING & PINS
    // =========================================================================

    fn locate(&self, addr: Addr) -> Result<&Segment, ScError> {
        if addr.is_empty() {
            return Err(ScError::InvalidParams);
        }
        self.segment(addr.seg).ok_or(ScError::InvalidParams)
    }

    pub(crate) fn lock(&self, ctx: &Context, addr: Addr) -> Result<Locked<'_>, ScError> {
        Ok(self.locate(addr)?.lock(ctx.id(), addr.offset))
    }

    pub(crate) fn lock_try(
        &self,
        ctx: &Context,
        addr: Addr,
        attempts: u32,
    ) -> Result<Option<Locked<'_>>, ScError> {
        Ok(self
            .locate(addr)?
            .lock_try(ctx.id(), addr.offset, attempts))
    }

    /// Lock a live element the caller may read.
    fn lock_readable(&self, ctx: &Context, addr: Addr) -> Result<Locked<'_>, ScError> {
        let guard = self.lock(ctx, addr)?;
        let element = guard.element();
        if !element.is_live() {
            return Err(ScError::InvalidState);
        }
        if !ctx.can_read(element.access()) {
            return Err(ScError::NoReadRights);
        }
        Ok(guard)
    }

    /// Lock a live element the caller may write.
    fn lock_writable(&self, ctx: &Context, addr: Addr) -> Result<Locked<'_>, ScError> {
        let guard = self.lock(ctx, addr)?;
        let element = guard.element();
        if !element.is_live() {
            return Err(ScError::InvalidState);
        }
        if !ctx.can_write(element.access()) {
            return Err(ScError::NoWriteRights);
        }
        Ok(guard)
    }

    /// Pin a live, readable element for an iterator, retrying while its
    /// section is busy. Returns the element's type.
    pub(crate) fn pin_for_read(&self, ctx: &Context, addr: Addr) -> Result<ScType, ScError> {
        for _ in 0..PIN_ATTEMPTS {
            let Some(guard) = self.lock_try(ctx, addr, ITERATOR_LOCK_ATTEMPTS)? else {
                thread::sleep(Duration::from_micros(PIN_RETRY_SLEEP_US));
                continue;
            };
            let element = guard.element();
            if !element.is_live() {
                return Err(ScError::InvalidState);
            }
            if !ctx.can_read(element.access()) {
                return Err(ScError::NoReadRights);
            }
            guard.pin();
            return Ok(element.kind().strip_internal_flags());
        }
        Err(ScError::Error)
    }

    /// Drop a pin, recycling the slot if that erased it.
    pub(crate) fn unpin(&self, ctx: &Context, addr: Addr) {
        if let Some(segment) = self.segment(addr.seg) {
            if segment.unpin(ctx.id(), addr.offset) {
                self.cache_append(ctx, addr.seg);
            }
        }
    }

    /// Type and access of a live element, `None` otherwise.
    pub(crate) fn peek(&self, ctx: &Context, addr: Addr) -> Option<(ScType, AccessLevels)> {
        let guard = self.lock(ctx, addr).ok()?;
        let element = guard.element();
        element
            .is_live()
            .then(|| (element.kind().strip_internal_flags(), element.access()))
    }

    // =========================================================================
    // ELEMENT CREATION
    // =========================================================================

    /// Create a node carrying the caller's access levels.
    pub fn node_new(&self, ctx: &Context, node_type: ScType) -> Result<Addr, ScError> {
        self.node_new_ext(ctx, node_type, ctx.access_levels())
    }

    /// Create a node with explicit access levels (capped at the caller's).
    pub fn node_new_ext(
        &self,
        ctx: &Context,
        node_type: ScType,
        levels: AccessLevels,
    ) -> Result<Addr, ScError> {
        let node_type = node_type.strip_internal_flags();
        if node_type.intersects(ScType::LINK | ScType::ARC_MASK) {
            return Err(ScError::InvalidParams);
        }
        let guard = self.allocate(ctx)?;
        let element = guard.element();
        element.set_kind(ScType::NODE | node_type);
        element.set_access(levels.min(ctx.access_levels()));
        Ok(guard.addr())
    }

    /// Create a constant link with no content.
    pub fn link_new(&self, ctx: &Context) -> Result<Addr, ScError> {
        self.link_new_ext(ctx, ScType::LINK_CONST, ctx.access_levels())
    }

    /// Create a link of the given type with explicit access levels.
    pub fn link_new_ext(
        &self,
        ctx: &Context,
        link_type: ScType,
        levels: AccessLevels,
    ) -> Result<Addr, ScError> {
        let link_type = link_type.strip_internal_flags();
        if link_type.intersects(ScType::NODE | ScType::ARC_MASK) {
            return Err(ScError::InvalidParams);
        }
        let guard = self.allocate(ctx)?;
        let element = guard.element();
        element.set_kind(ScType::LINK | link_type);
        element.set_access(levels.min(ctx.access_levels()));
        Ok(guard.addr())
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Whether `addr` names a live element.
    #[must_use]
    pub fn is_element(&self, ctx: &Context, addr: Addr) -> bool {
        self.lock(ctx, addr)
            .map(|guard| guard.element().is_live())
            .unwrap_or(false)
    }

    /// Element type as callers see it (internal flags stripped).
    pub fn get_element_type(&self, ctx: &Context, addr: Addr) -> Result<ScType, ScError> {
        let guard = self.lock_readable(ctx, addr)?;
        Ok(guard.element().kind().strip_internal_flags())
    }

    /// Replace everything but the element-kind bits of an element's type.
    pub fn change_element_subtype(
        &self,
        ctx: &Context,
        addr: Addr,
        subtype: ScType,
    ) -> Result<(), ScError> {
        if subtype.intersects(ScType::ELEMENT_MASK | ScType::INTERNAL_FLAGS) {
            return Err(ScError::InvalidParams);
        }
        let guard = self.lock_writable(ctx, addr)?;
        let element = guard.element();
        let kind = element.kind();
        let kept = kind & (ScType::ELEMENT_MASK | ScType::INTERNAL_FLAGS);
        element.set_kind(kept | subtype);
        Ok(())
    }

    pub fn get_arc_begin(&self, ctx: &Context, addr: Addr) -> Result<Addr, ScError> {
        self.get_arc_info(ctx, addr).map(|(begin, _)| begin)
    }

    pub fn get_arc_end(&self, ctx: &Context, addr: Addr) -> Result<Addr, ScError> {
        self.get_arc_info(ctx, addr).map(|(_, end)| end)
    }

    /// `(begin, end)` of an arc.
    pub fn get_arc_info(&self, ctx: &Context, addr: Addr) -> Result<(Addr, Addr), ScError> {
        let guard = self.lock_readable(ctx, addr)?;
        let element = guard.element();
        if !element.kind().is_arc() {
            return Err(ScError::InvalidType);
        }
        Ok((element.arc(ArcField::Begin), element.arc(ArcField::End)))
    }

    // =========================================================================
    // ACCESS LEVELS
    // =========================================================================

    pub fn get_element_access_levels(
        &self,
        ctx: &Context,
        addr: Addr,
    ) -> Result<AccessLevels, ScError> {
        let guard = self.lock_readable(ctx, addr)?;
        Ok(guard.element().access())
    }

    /// Set an element's levels to `min(levels, ctx levels)` and return what
    /// was stored.
    pub fn set_element_access_levels(
        &self,
        ctx: &Context,
        addr: Addr,
        levels: AccessLevels,
    ) -> Result<AccessLevels, ScError> {
        let guard = self.lock_writable(ctx, addr)?;
        let stored = levels.min(ctx.access_levels());
        guard.element().set_access(stored);
        Ok(stored)
    }

    // =========================================================================
    // STATISTICS
    // =========================================================================

    /// Count live nodes, links and arcs over all segments, plus free slots.
    /// Elements pending deletion appear in neither.
    pub fn get_elements_stat(&self, ctx: &Context) -> Result<ElementStat, ScError> {
        let mut stat = ElementStat::default();
        for segment in self.loaded_segments() {
            segment.for_each_element(ctx.id(), |element| {
                if !element.is_live() {
                    return;
                }
                let kind = element.kind();
                if kind.is_arc() {
                    stat.arcs += 1;
                } else if kind.is_link() {
                    stat.links += 1;
                } else {
                    stat.nodes += 1;
                }
            });
            let reserved = u64::from(segment.num() == 0);
            stat.empty +=
                SEGMENT_ELEMENTS_COUNT as u64 - u64::from(segment.elements_count()) - reserved;
            stat.segments += 1;
        }
        Ok(stat)
    }

    // =========================================================================
    // PERSISTENCE
    // =========================================================================

    /// Snapshot every segment under whole-segment locks and write it to the
    /// repository, then save the content store.
    pub fn save(&self, ctx: &Context) -> Result<(), ScError> {
        let Some(repo) = self.config.repo_path.clone() else {
            return Err(ScError::InvalidParams);
        };

        let snapshots = {
            let _free = self.free_lock.lock();
            let segments: Vec<&Segment> = self.loaded_segments().collect();
            let locks: Vec<_> = segments.iter().map(|s| s.lock_all(ctx.id())).collect();
            let snapshots: Vec<_> = segments
                .iter()
                .zip(locks.iter())
                .map(|(segment, lock)| (segment.num(), segment.records(lock)))
                .collect();
            drop(locks);
            snapshots
        };

        let blocks = snapshots
            .iter()
            .map(|(num, records)| {
                Ok(SegmentBlock {
                    num: *num,
                    bytes: persistence::encode_records(records)?,
                })
            })
            .collect::<Result<Vec<_>, ScError>>()?;
        persistence::save(&repo.join(SEGMENTS_FILE_NAME), &blocks)?;
        self.content.save()?;

        tracing::debug!(segments = blocks.len(), repo = %repo.display(), "storage saved");
        Ok(())
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    /// Subscribe to `event_type` on `addr`. The element stays pinned while
    /// the subscription lives.
    pub fn event_new<F>(
        &self,
        ctx: &Context,
        addr: Addr,
        event_type: EventType,
        callback: F,
    ) -> Result<EventHandle, ScError>
    where
        F: Fn(&Context, &EventArgs) + Send + Sync + 'static,
    {
        self.subscribe(ctx, addr, event_type, Box::new(callback), None)
    }

    /// Like [`Storage::event_new`], with a callback run once the event is
    /// freed (after `event_destroy` or deletion of the element).
    pub fn event_new_with_delete<F, D>(
        &self,
        ctx: &Context,
        addr: Addr,
        event_type: EventType,
        callback: F,
        on_delete: D,
    ) -> Result<EventHandle, ScError>
    where
        F: Fn(&Context, &EventArgs) + Send + Sync + 'static,
        D: FnOnce(Addr) + Send + 'static,
    {
        let on_delete: DeleteCallback = Box::new(on_delete);
        self.subscribe(ctx, addr, event_type, Box::new(callback), Some(on_delete))
    }

    fn subscribe(
        &self,
        ctx: &Context,
        addr: Addr,
        event_type: EventType,
        callback: EventCallback,
        on_delete: Option<DeleteCallback>,
    ) -> Result<EventHandle, ScError> {
        if addr.is_empty() {
            return Err(ScError::InvalidParams);
        }
        let segment = self
            .segment_arc(addr.seg)
            .cloned()
            .ok_or(ScError::InvalidParams)?;
        {
            let guard = self.lock_readable(ctx, addr)?;
            guard.pin();
        }
        let pin = ElementPin::adopt(segment, addr.offset, Arc::clone(&self.cache));
        Ok(self
            .events
            .subscribe(ctx, addr, event_type, pin, callback, on_delete))
    }

    /// Tear down a subscription. No callback of it starts afterwards.
    ///
    /// Called from outside any event callback, this also waits for one of its
    /// callbacks still running on another thread. Called from inside a
    /// callback (its own or another event's) it returns without waiting.
    pub fn event_destroy(&self, ctx: &Context, handle: EventHandle) -> Result<(), ScError> {
        self.events.destroy(ctx, handle)
    }

    /// Block until every queued event callback has run.
    pub fn events_flush(&self) {
        self.events.flush();
    }

    pub(crate) fn emit(
        &self,
        ctx: &Context,
        element: Addr,
        element_access: AccessLevels,
        event_type: EventType,
        arc: Addr,
        other: Addr,
    ) {
        self.events
            .emit(ctx, element, element_access, event_type, arc, other);
    }

    pub(crate) fn notify_element_deleted(&self, ctx: &Context, addr: Addr) {
        self.events.notify_element_deleted(ctx, addr);
    }

    #[cfg(test)]
    pub(crate) fn subscriptions(&self, addr: Addr) -> usize {
        self.events.subscriptions(addr)
    }

    #[cfg(test)]
    pub(crate) fn refs(&self, addr: Addr) -> u32 {
        self.segment(addr.seg).map_or(0, |s| s.refs(addr.offset))
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "storage shutdown failed");
        }
    }
}

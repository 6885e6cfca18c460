//! # Iterators
//!
//! Pattern search over arc lists. Each template fixes some positions of a
//! triple `(begin, arc, end)` (F) and leaves the rest to a type filter (A).
//!
//! | Template | Walks |
//! |----------|-------|
//! | `F_A_A`  | outgoing arcs of `begin` |
//! | `A_A_F`  | incoming arcs of `end` |
//! | `F_A_F`  | outgoing arcs of `begin`, ending at `end` |
//! | `A_F_A`  | the single arc itself |
//!
//! ## Concurrency
//!
//! An iterator never holds more than one section lock at a time and never
//! holds one across calls. Fixed elements and the current walk position are
//! pinned instead, so a concurrent deletion defers their slots rather than
//! recycling them under the iterator. When the walk lands on an arc already
//! pending deletion it follows that arc's next pointer without stopping.
//!
//! [`Iterator5`] composes two triple iterators to match an arc together
//! with an attribute arc pointing at it.

mod iterator5;

pub use iterator5::Iterator5;

use crate::context::Context;
use crate::segment::ArcField;
use crate::storage::Storage;
use crate::types::{Addr, ElementState, ScError, ScType};

#[derive(Debug, Clone, Copy)]
enum Template3 {
    FAA {
        begin: Addr,
        arc_type: ScType,
        end_type: ScType,
    },
    AAF {
        begin_type: ScType,
        arc_type: ScType,
        end: Addr,
    },
    FAF {
        begin: Addr,
        arc_type: ScType,
        end: Addr,
    },
    AFA {
        begin_type: ScType,
        arc: Addr,
        end_type: ScType,
    },
}

/// Which list a walking template follows and from where.
#[derive(Debug, Clone, Copy)]
struct Walk {
    fixed: Addr,
    outgoing: bool,
}

impl Template3 {
    fn walk(self) -> Option<Walk> {
        match self {
            Self::FAA { begin, .. } | Self::FAF { begin, .. } => Some(Walk {
                fixed: begin,
                outgoing: true,
            }),
            Self::AAF { end, .. } => Some(Walk {
                fixed: end,
                outgoing: false,
            }),
            Self::AFA { .. } => None,
        }
    }
}

/// What the walk read off one arc while it was locked.
#[derive(Debug, Clone, Copy)]
struct ArcView {
    addr: Addr,
    kind: ScType,
    readable: bool,
    begin: Addr,
    end: Addr,
}

/// Triple iterator. Yields `[begin, arc, end]`.
///
/// ```no_run
/// # use scstore_core::{Iterator3, ScType, Storage};
/// # let storage = Storage::in_memory().expect("store");
/// # let ctx = storage.full_context();
/// # let node = storage.node_new(&ctx, ScType::CONST).expect("node");
/// let it = Iterator3::f_a_a(&storage, &ctx, node, ScType::ARC_POS_CONST_PERM, ScType::UNKNOWN)
///     .expect("iterator");
/// for [_, arc, target] in it {
///     println!("{arc} -> {target}");
/// }
/// ```
#[derive(Debug)]
pub struct Iterator3<'a> {
    storage: &'a Storage,
    ctx: &'a Context,
    template: Template3,
    pinned: Vec<Addr>,
    current: Addr,
    started: bool,
    finished: bool,
    results: [Addr; 3],
}

impl<'a> Iterator3<'a> {
    fn new(
        storage: &'a Storage,
        ctx: &'a Context,
        template: Template3,
        fixed: &[Addr],
    ) -> Result<Self, ScError> {
        let mut it = Self {
            storage,
            ctx,
            template,
            pinned: Vec::with_capacity(fixed.len()),
            current: Addr::EMPTY,
            started: false,
            finished: false,
            results: [Addr::EMPTY; 3],
        };
        for &addr in fixed {
            storage.pin_for_read(ctx, addr)?;
            it.pinned.push(addr);
        }
        Ok(it)
    }

    /// Outgoing arcs of `begin` of `arc_type` whose end matches `end_type`.
    pub fn f_a_a(
        storage: &'a Storage,
        ctx: &'a Context,
        begin: Addr,
        arc_type: ScType,
        end_type: ScType,
    ) -> Result<Self, ScError> {
        let template = Template3::FAA {
            begin,
            arc_type,
            end_type,
        };
        Self::new(storage, ctx, template, &[begin])
    }

    /// Incoming arcs of `end` of `arc_type` whose begin matches `begin_type`.
    pub fn a_a_f(
        storage: &'a Storage,
        ctx: &'a Context,
        begin_type: ScType,
        arc_type: ScType,
        end: Addr,
    ) -> Result<Self, ScError> {
        let template = Template3::AAF {
            begin_type,
            arc_type,
            end,
        };
        Self::new(storage, ctx, template, &[end])
    }

    /// Arcs of `arc_type` from `begin` to `end`.
    pub fn f_a_f(
        storage: &'a Storage,
        ctx: &'a Context,
        begin: Addr,
        arc_type: ScType,
        end: Addr,
    ) -> Result<Self, ScError> {
        let template = Template3::FAF {
            begin,
            arc_type,
            end,
        };
        Self::new(storage, ctx, template, &[begin, end])
    }

    /// The endpoints of `arc`, if they match the two types.
    pub fn a_f_a(
        storage: &'a Storage,
        ctx: &'a Context,
        begin_type: ScType,
        arc: Addr,
        end_type: ScType,
    ) -> Result<Self, ScError> {
        let template = Template3::AFA {
            begin_type,
            arc,
            end_type,
        };
        let it = Self::new(storage, ctx, template, &[arc])?;
        let kind = storage.peek(ctx, arc).map(|(kind, _)| kind);
        if !kind.is_some_and(ScType::is_arc) {
            return Err(ScError::InvalidType);
        }
        Ok(it)
    }

    /// Element at position `idx` of the last result; empty when out of range.
    #[must_use]
    pub fn value(&self, idx: usize) -> Addr {
        self.results.get(idx).copied().unwrap_or(Addr::EMPTY)
    }

    /// Live, readable, and of type `template`.
    fn endpoint_matches(&self, addr: Addr, template: ScType) -> bool {
        self.storage
            .peek(self.ctx, addr)
            .is_some_and(|(kind, access)| template.matches(kind) && self.ctx.can_read(access))
    }

    /// Head of the walked list, or the next pointer of the current position.
    fn next_pointer(&self, walk: Walk) -> Option<Addr> {
        let from = if self.started { self.current } else { walk.fixed };
        let guard = self.storage.lock(self.ctx, from).ok()?;
        let element = guard.element();
        Some(match (self.started, walk.outgoing) {
            (false, true) => element.first_out(),
            (false, false) => element.first_in(),
            (true, true) => element.arc(ArcField::NextOut),
            (true, false) => element.arc(ArcField::NextIn),
        })
    }

    /// Move to the next live arc of the list and pin it. `None` ends the walk.
    fn advance(&mut self, walk: Walk) -> Option<ArcView> {
        let mut candidate = self.next_pointer(walk)?;
        self.started = true;
        loop {
            if candidate.is_empty() {
                return None;
            }
            let guard = self.storage.lock(self.ctx, candidate).ok()?;
            let element = guard.element();
            let kind = element.kind();
            let begin = element.arc(ArcField::Begin);
            let end = element.arc(ArcField::End);
            let anchored = if walk.outgoing { begin } else { end };
            let state = element.state();
            if state == ElementState::Free || !kind.is_arc() || anchored != walk.fixed {
                return None;
            }
            if state == ElementState::PendingDeletion {
                candidate = element.arc(if walk.outgoing {
                    ArcField::NextOut
                } else {
                    ArcField::NextIn
                });
                continue;
            }

            guard.pin();
            let view = ArcView {
                addr: candidate,
                kind,
                readable: self.ctx.can_read(element.access()),
                begin,
                end,
            };
            drop(guard);

            let previous = std::mem::replace(&mut self.current, candidate);
            if !previous.is_empty() {
                self.storage.unpin(self.ctx, previous);
            }
            return Some(view);
        }
    }

    fn accepts(&self, view: &ArcView) -> bool {
        if !view.readable {
            return false;
        }
        match self.template {
            Template3::FAA {
                arc_type, end_type, ..
            } => arc_type.matches(view.kind) && self.endpoint_matches(view.end, end_type),
            Template3::AAF {
                begin_type,
                arc_type,
                ..
            } => arc_type.matches(view.kind) && self.endpoint_matches(view.begin, begin_type),
            Template3::FAF { arc_type, end, .. } => {
                view.end == end
                    && arc_type.matches(view.kind)
                    && self.endpoint_matches(view.end, ScType::UNKNOWN)
            }
            Template3::AFA { .. } => false,
        }
    }

    fn single(&mut self, begin_type: ScType, arc: Addr, end_type: ScType) -> Option<[Addr; 3]> {
        self.finished = true;
        let (begin, end, readable) = {
            let guard = self.storage.lock(self.ctx, arc).ok()?;
            let element = guard.element();
            if !element.is_live() {
                return None;
            }
            (
                element.arc(ArcField::Begin),
                element.arc(ArcField::End),
                self.ctx.can_read(element.access()),
            )
        };
        (readable
            && self.endpoint_matches(begin, begin_type)
            && self.endpoint_matches(end, end_type))
        .then_some([begin, arc, end])
    }
}

impl Iterator for Iterator3<'_> {
    type Item = [Addr; 3];

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let found = match (self.template, self.template.walk()) {
            (
                Template3::AFA {
                    begin_type,
                    arc,
                    end_type,
                },
                _,
            ) => self.single(begin_type, arc, end_type),
            (_, Some(walk)) => loop {
                let Some(view) = self.advance(walk) else {
                    break None;
                };
                if self.accepts(&view) {
                    break Some([view.begin, view.addr, view.end]);
                }
            },
            (_, None) => None,
        };
        match found {
            Some(result) => {
                self.results = result;
                Some(result)
            }
            None => {
                self.finished = true;
                self.results = [Addr::EMPTY; 3];
                None
            }
        }
    }
}

impl Drop for Iterator3<'_> {
    fn drop(&mut self) {
        if !self.current.is_empty() {
            self.storage.unpin(self.ctx, self.current);
        }
        for &addr in &self.pinned {
            self.storage.unpin(self.ctx, addr);
        }
    }
}

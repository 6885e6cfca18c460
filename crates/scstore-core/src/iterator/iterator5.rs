//! Five-element iterator: a main triple plus an attribute arc on its arc.
//!
//! Results are `[begin, arc, end, attr_arc, attr_begin]`, where `attr_arc`
//! goes from `attr_begin` to `arc`.

use super::Iterator3;
use crate::context::Context;
use crate::storage::Storage;
use crate::types::{Addr, ScError, ScType};

/// Where attribute arcs start.
#[derive(Debug, Clone, Copy)]
enum AttrSource {
    Fixed(Addr),
    Typed(ScType),
}

#[derive(Debug)]
pub struct Iterator5<'a> {
    storage: &'a Storage,
    ctx: &'a Context,
    main: Iterator3<'a>,
    attr: Option<Iterator3<'a>>,
    attr_type: ScType,
    attr_source: AttrSource,
    main_result: [Addr; 3],
    results: [Addr; 5],
}

impl<'a> Iterator5<'a> {
    fn new(
        storage: &'a Storage,
        ctx: &'a Context,
        main: Iterator3<'a>,
        attr_type: ScType,
        attr_source: AttrSource,
    ) -> Result<Self, ScError> {
        if let AttrSource::Fixed(addr) = attr_source {
            storage.pin_for_read(ctx, addr)?;
        }
        Ok(Self {
            storage,
            ctx,
            main,
            attr: None,
            attr_type,
            attr_source,
            main_result: [Addr::EMPTY; 3],
            results: [Addr::EMPTY; 5],
        })
    }

    pub fn f_a_a_a_f(
        storage: &'a Storage,
        ctx: &'a Context,
        begin: Addr,
        arc_type: ScType,
        end_type: ScType,
        attr_type: ScType,
        attr_begin: Addr,
    ) -> Result<Self, ScError> {
        let main = Iterator3::f_a_a(storage, ctx, begin, arc_type, end_type)?;
        Self::new(storage, ctx, main, attr_type, AttrSource::Fixed(attr_begin))
    }

    pub fn a_a_f_a_f(
        storage: &'a Storage,
        ctx: &'a Context,
        begin_type: ScType,
        arc_type: ScType,
        end: Addr,
        attr_type: ScType,
        attr_begin: Addr,
    ) -> Result<Self, ScError> {
        let main = Iterator3::a_a_f(storage, ctx, begin_type, arc_type, end)?;
        Self::new(storage, ctx, main, attr_type, AttrSource::Fixed(attr_begin))
    }

    pub fn f_a_f_a_f(
        storage: &'a Storage,
        ctx: &'a Context,
        begin: Addr,
        arc_type: ScType,
        end: Addr,
        attr_type: ScType,
        attr_begin: Addr,
    ) -> Result<Self, ScError> {
        let main = Iterator3::f_a_f(storage, ctx, begin, arc_type, end)?;
        Self::new(storage, ctx, main, attr_type, AttrSource::Fixed(attr_begin))
    }

    pub fn f_a_f_a_a(
        storage: &'a Storage,
        ctx: &'a Context,
        begin: Addr,
        arc_type: ScType,
        end: Addr,
        attr_type: ScType,
        attr_begin_type: ScType,
    ) -> Result<Self, ScError> {
        let main = Iterator3::f_a_f(storage, ctx, begin, arc_type, end)?;
        Self::new(storage, ctx, main, attr_type, AttrSource::Typed(attr_begin_type))
    }

    pub fn f_a_a_a_a(
        storage: &'a Storage,
        ctx: &'a Context,
        begin: Addr,
        arc_type: ScType,
        end_type: ScType,
        attr_type: ScType,
        attr_begin_type: ScType,
    ) -> Result<Self, ScError> {
        let main = Iterator3::f_a_a(storage, ctx, begin, arc_type, end_type)?;
        Self::new(storage, ctx, main, attr_type, AttrSource::Typed(attr_begin_type))
    }

    pub fn a_a_f_a_a(
        storage: &'a Storage,
        ctx: &'a Context,
        begin_type: ScType,
        arc_type: ScType,
        end: Addr,
        attr_type: ScType,
        attr_begin_type: ScType,
    ) -> Result<Self, ScError> {
        let main = Iterator3::a_a_f(storage, ctx, begin_type, arc_type, end)?;
        Self::new(storage, ctx, main, attr_type, AttrSource::Typed(attr_begin_type))
    }

    /// Element at position `idx` of the last result; empty when out of range.
    #[must_use]
    pub fn value(&self, idx: usize) -> Addr {
        self.results.get(idx).copied().unwrap_or(Addr::EMPTY)
    }

    /// Attribute iterator over arcs pointing at `arc`. `None` when `arc`
    /// vanished between the two walks.
    fn attr_iterator(&self, arc: Addr) -> Option<Iterator3<'a>> {
        let it = match self.attr_source {
            AttrSource::Fixed(begin) => {
                Iterator3::f_a_f(self.storage, self.ctx, begin, self.attr_type, arc)
            }
            AttrSource::Typed(begin_type) => {
                Iterator3::a_a_f(self.storage, self.ctx, begin_type, self.attr_type, arc)
            }
        };
        it.ok()
    }
}

impl Iterator for Iterator5<'_> {
    type Item = [Addr; 5];

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(attr) = self.attr.as_mut() {
                if let Some([attr_begin, attr_arc, _]) = attr.next() {
                    let [begin, arc, end] = self.main_result;
                    self.results = [begin, arc, end, attr_arc, attr_begin];
                    return Some(self.results);
                }
                self.attr = None;
            }
            let Some(main) = self.main.next() else {
                self.results = [Addr::EMPTY; 5];
                return None;
            };
            self.main_result = main;
            self.attr = self.attr_iterator(main[1]);
        }
    }
}

impl Drop for Iterator5<'_> {
    fn drop(&mut self) {
        if let AttrSource::Fixed(addr) = self.attr_source {
            self.storage.unpin(self.ctx, addr);
        }
    }
}

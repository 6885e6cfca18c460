//! Arc creation.
//!
//! Lock order: `begin`, `end`, head of `begin`'s outgoing list, head of
//! `end`'s incoming list, each with a bounded `lock_try`. Any failure drops
//! whatever was locked and reports `ScError::Error`; retrying is up to the
//! caller.

use super::Storage;
use crate::context::Context;
use crate::primitives::MAX_STORAGE_LOCK_ATTEMPTS;
use crate::segment::{ArcField, Locked};
use crate::types::{AccessLevels, Addr, EventType, ScError, ScType};

impl Storage {
    /// Create an arc carrying the caller's access levels.
    pub fn arc_new(
        &self,
        ctx: &Context,
        arc_type: ScType,
        begin: Addr,
        end: Addr,
    ) -> Result<Addr, ScError> {
        self.arc_new_ext(ctx, arc_type, begin, end, ctx.access_levels())
    }

    /// Create an arc from `begin` to `end` and prepend it to both endpoint
    /// lists. A type without arc bits becomes a common arc.
    pub fn arc_new_ext(
        &self,
        ctx: &Context,
        arc_type: ScType,
        begin: Addr,
        end: Addr,
        levels: AccessLevels,
    ) -> Result<Addr, ScError> {
        let arc_type = arc_type.strip_internal_flags();
        if arc_type.intersects(ScType::NODE | ScType::LINK) {
            return Err(ScError::InvalidParams);
        }
        let arc_type = if arc_type.is_arc() {
            arc_type
        } else {
            ScType::ARC_COMMON | arc_type
        };
        if begin.is_empty() || end.is_empty() {
            return Err(ScError::InvalidParams);
        }

        let begin_guard = self.lock_endpoint(ctx, begin)?;
        let end_guard = self.lock_endpoint(ctx, end)?;

        let first_out = begin_guard.element().first_out();
        let first_in = end_guard.element().first_in();
        let first_out_guard = self.lock_list_head(ctx, first_out)?;
        let first_in_guard = self.lock_list_head(ctx, first_in)?;

        let arc_guard = self.allocate(ctx)?;
        let arc = arc_guard.addr();
        let element = arc_guard.element();
        element.set_kind(arc_type);
        element.set_access(levels.min(ctx.access_levels()));
        element.set_arc(ArcField::Begin, begin);
        element.set_arc(ArcField::End, end);
        element.set_arc(ArcField::NextOut, first_out);
        element.set_arc(ArcField::PrevOut, Addr::EMPTY);
        element.set_arc(ArcField::NextIn, first_in);
        element.set_arc(ArcField::PrevIn, Addr::EMPTY);

        if let Some(head) = &first_out_guard {
            head.element().set_arc(ArcField::PrevOut, arc);
        }
        if let Some(head) = &first_in_guard {
            head.element().set_arc(ArcField::PrevIn, arc);
        }
        begin_guard.element().set_first_out(arc);
        end_guard.element().set_first_in(arc);

        self.emit(
            ctx,
            begin,
            begin_guard.element().access(),
            EventType::AddOutputArc,
            arc,
            end,
        );
        self.emit(
            ctx,
            end,
            end_guard.element().access(),
            EventType::AddInputArc,
            arc,
            begin,
        );

        drop(arc_guard);
        drop(first_in_guard);
        drop(first_out_guard);
        drop(end_guard);
        drop(begin_guard);
        Ok(arc)
    }

    /// Lock a live arc endpoint the caller may read.
    fn lock_endpoint(&self, ctx: &Context, addr: Addr) -> Result<Locked<'_>, ScError> {
        let guard = self
            .lock_try(ctx, addr, MAX_STORAGE_LOCK_ATTEMPTS)?
            .ok_or(ScError::Error)?;
        let element = guard.element();
        if !element.is_live() {
            return Err(ScError::InvalidState);
        }
        if !ctx.can_read(element.access()) {
            return Err(ScError::NoReadRights);
        }
        Ok(guard)
    }

    fn lock_list_head(&self, ctx: &Context, head: Addr) -> Result<Option<Locked<'_>>, ScError> {
        if head.is_empty() {
            return Ok(None);
        }
        self.lock_try(ctx, head, MAX_STORAGE_LOCK_ATTEMPTS)?
            .ok_or(ScError::Error)
            .map(Some)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn storage() -> Storage {
        Storage::open(StorageConfig {
            max_loaded_segments: 2,
            event_workers: Some(1),
            ..StorageConfig::default()
        })
        .expect("open storage")
    }

    fn arc_fields(storage: &Storage, ctx: &Context, arc: Addr) -> [Addr; 4] {
        let guard = storage.lock(ctx, arc).expect("lock");
        let el = guard.element();
        [
            el.arc(ArcField::PrevOut),
            el.arc(ArcField::NextOut),
            el.arc(ArcField::PrevIn),
            el.arc(ArcField::NextIn),
        ]
    }

    #[test]
    fn new_arcs_are_prepended() {
        let storage = storage();
        let ctx = storage.full_context();
        let a = storage.node_new(&ctx, ScType::CONST).expect("node");
        let b = storage.node_new(&ctx, ScType::CONST).expect("node");
        let first = storage
            .arc_new(&ctx, ScType::ARC_POS_CONST_PERM, a, b)
            .expect("arc");
        let second = storage
            .arc_new(&ctx, ScType::ARC_POS_CONST_PERM, a, b)
            .expect("arc");

        {
            let guard = storage.lock(&ctx, a).expect("lock");
            assert_eq!(guard.element().first_out(), second);
        }
        {
            let guard = storage.lock(&ctx, b).expect("lock");
            assert_eq!(guard.element().first_in(), second);
        }
        assert_eq!(
            arc_fields(&storage, &ctx, second),
            [Addr::EMPTY, first, Addr::EMPTY, first]
        );
        assert_eq!(
            arc_fields(&storage, &ctx, first),
            [second, Addr::EMPTY, second, Addr::EMPTY]
        );
    }

    #[test]
    fn untyped_arc_becomes_common() {
        let storage = storage();
        let ctx = storage.full_context();
        let a = storage.node_new(&ctx, ScType::CONST).expect("node");
        let arc = storage.arc_new(&ctx, ScType::CONST, a, a).expect("loop");
        assert_eq!(
            storage.get_element_type(&ctx, arc).expect("type"),
            ScType::ARC_COMMON_CONST
        );
        assert_eq!(storage.get_arc_info(&ctx, arc).expect("info"), (a, a));
    }

    #[test]
    fn arc_between_arcs() {
        let storage = storage();
        let ctx = storage.full_context();
        let a = storage.node_new(&ctx, ScType::CONST).expect("node");
        let b = storage.node_new(&ctx, ScType::CONST).expect("node");
        let base = storage
            .arc_new(&ctx, ScType::ARC_POS_CONST_PERM, a, b)
            .expect("arc");
        let relation = storage.node_new(&ctx, ScType::NODE_CONST_ROLE).expect("node");
        let attr = storage
            .arc_new(&ctx, ScType::ARC_POS_CONST_PERM, relation, base)
            .expect("arc to arc");
        assert_eq!(storage.get_arc_end(&ctx, attr).expect("end"), base);
    }

    #[test]
    fn invalid_endpoints_are_rejected() {
        let storage = storage();
        let ctx = storage.full_context();
        let a = storage.node_new(&ctx, ScType::CONST).expect("node");
        assert_eq!(
            storage.arc_new(&ctx, ScType::ARC_POS_CONST_PERM, a, Addr::EMPTY),
            Err(ScError::InvalidParams)
        );
        assert_eq!(
            storage.arc_new(&ctx, ScType::NODE, a, a),
            Err(ScError::InvalidParams)
        );
        let gone = storage.node_new(&ctx, ScType::CONST).expect("node");
        storage.element_free(&ctx, gone).expect("free");
        assert_eq!(
            storage.arc_new(&ctx, ScType::ARC_POS_CONST_PERM, a, gone),
            Err(ScError::InvalidState)
        );
    }

    #[test]
    fn contended_endpoint_fails_without_side_effects() {
        let storage = storage();
        let ctx = storage.full_context();
        let other = storage.full_context();
        let a = storage.node_new(&ctx, ScType::CONST).expect("node");
        let b = storage.node_new(&ctx, ScType::CONST).expect("node");

        let held = storage.lock(&other, b).expect("lock");
        assert_eq!(
            storage.arc_new(&ctx, ScType::ARC_POS_CONST_PERM, a, b),
            Err(ScError::Error)
        );
        drop(held);

        let guard = storage.lock(&ctx, a).expect("lock");
        assert!(guard.element().first_out().is_empty());
    }
}

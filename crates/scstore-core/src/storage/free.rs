//! Element deletion.
//!
//! Deleting an element deletes every arc incident to it, recursively (arcs
//! may themselves be endpoints). Runs in three phases under the storage's
//! free lock:
//!
//! 1. Collect the closure breadth-first, locking each element plus every
//!    neighbour a splice will touch, and check write rights. Nothing has
//!    changed yet, so a failure here leaves the graph untouched.
//! 2. Drop link content references and splice every arc out of both lists.
//! 3. Erase unpinned elements; mark pinned ones pending deletion so the last
//!    unpin erases them.
//!
//! Events of the deleted elements are torn down only after all section
//! locks are released, since that may run delete callbacks.

use std::collections::{HashMap, HashSet, VecDeque};

use super::Storage;
use super::link::LinkContent;
use crate::context::Context;
use crate::segment::{ArcField, Element, Locked, corrupted};
use crate::types::{Addr, ElementState, EventType, ScError};

type Held<'a> = HashMap<Addr, Locked<'a>>;

impl Storage {
    /// Delete `addr` and, transitively, every arc that begins or ends at a
    /// deleted element.
    pub fn element_free(&self, ctx: &Context, addr: Addr) -> Result<(), ScError> {
        if addr.is_empty() {
            return Err(ScError::InvalidParams);
        }

        let _free = self.free_lock.lock();
        let deleted = {
            let mut held = Held::new();
            let doomed = self.collect_closure(ctx, addr, &mut held)?;
            for &element in &doomed {
                self.detach(ctx, element, &mut held);
            }
            for &element in &doomed {
                self.release_slot(ctx, element, &held);
            }
            doomed
        };

        for &element in &deleted {
            self.notify_element_deleted(ctx, element);
        }
        tracing::debug!(root = %addr, count = deleted.len(), "elements freed");
        Ok(())
    }

    /// Lock `addr` unless this deletion already holds it.
    fn hold<'a>(
        &'a self,
        ctx: &Context,
        held: &mut Held<'a>,
        addr: Addr,
    ) -> Result<&'a Element, ScError> {
        if let Some(guard) = held.get(&addr) {
            return Ok(guard.element());
        }
        let guard = self.lock(ctx, addr)?;
        let element = guard.element();
        held.insert(addr, guard);
        Ok(element)
    }

    fn hold_linked<'a>(&'a self, ctx: &Context, held: &mut Held<'a>, addr: Addr) -> &'a Element {
        match self.hold(ctx, held, addr) {
            Ok(element) => element,
            Err(e) => corrupted(format_args!("arc list points at {addr}: {e}")),
        }
    }

    /// Phase 1: the deletion set in visiting order.
    fn collect_closure<'a>(
        &'a self,
        ctx: &Context,
        root: Addr,
        held: &mut Held<'a>,
    ) -> Result<Vec<Addr>, ScError> {
        let mut seen = HashSet::new();
        let mut doomed = Vec::new();
        let mut queue = VecDeque::from([root]);

        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            let element = self.hold(ctx, held, current)?;
            if !element.is_live() {
                if current == root {
                    return Err(ScError::InvalidState);
                }
                continue;
            }
            if !ctx.can_write(element.access()) {
                return Err(ScError::NoWriteRights);
            }
            doomed.push(current);

            if element.kind().is_arc() {
                for field in [
                    ArcField::Begin,
                    ArcField::End,
                    ArcField::PrevOut,
                    ArcField::NextOut,
                    ArcField::PrevIn,
                    ArcField::NextIn,
                ] {
                    let neighbour = element.arc(field);
                    if !neighbour.is_empty() {
                        self.hold(ctx, held, neighbour)?;
                    }
                }
            }

            let mut arc = element.first_out();
            while !arc.is_empty() {
                let next = self.hold(ctx, held, arc)?.arc(ArcField::NextOut);
                queue.push_back(arc);
                arc = next;
            }
            let mut arc = element.first_in();
            while !arc.is_empty() {
                let next = self.hold(ctx, held, arc)?.arc(ArcField::NextIn);
                queue.push_back(arc);
                arc = next;
            }
        }
        Ok(doomed)
    }

    /// Phase 2: drop content references and unlink arcs.
    fn detach<'a>(&'a self, ctx: &Context, addr: Addr, held: &mut Held<'a>) {
        let element = self.hold_linked(ctx, held, addr);
        let kind = element.kind();

        if kind.is_link() {
            if let Some(checksum) = LinkContent::read(element).checksum() {
                if let Err(e) = self.content.remove_backref(addr, &checksum) {
                    tracing::warn!(link = %addr, error = %e, "content reference not removed");
                }
            }
            return;
        }
        if !kind.is_arc() {
            return;
        }

        let begin = element.arc(ArcField::Begin);
        let end = element.arc(ArcField::End);
        let begin_el = self.hold_linked(ctx, held, begin);
        let end_el = self.hold_linked(ctx, held, end);

        let prev = element.arc(ArcField::PrevOut);
        let next = element.arc(ArcField::NextOut);
        if prev.is_empty() {
            begin_el.set_first_out(next);
        } else {
            self.hold_linked(ctx, held, prev)
                .set_arc(ArcField::NextOut, next);
        }
        if !next.is_empty() {
            self.hold_linked(ctx, held, next)
                .set_arc(ArcField::PrevOut, prev);
        }

        let prev = element.arc(ArcField::PrevIn);
        let next = element.arc(ArcField::NextIn);
        if prev.is_empty() {
            end_el.set_first_in(next);
        } else {
            self.hold_linked(ctx, held, prev)
                .set_arc(ArcField::NextIn, next);
        }
        if !next.is_empty() {
            self.hold_linked(ctx, held, next)
                .set_arc(ArcField::PrevIn, prev);
        }

        self.emit(
            ctx,
            begin,
            begin_el.access(),
            EventType::RemoveOutputArc,
            addr,
            end,
        );
        self.emit(
            ctx,
            end,
            end_el.access(),
            EventType::RemoveInputArc,
            addr,
            begin,
        );
    }

    /// Phase 3: erase or defer.
    fn release_slot(&self, ctx: &Context, addr: Addr, held: &Held<'_>) {
        let Some(guard) = held.get(&addr) else {
            corrupted(format_args!("deleted element {addr} is not locked"));
        };
        let element = guard.element();
        self.emit(
            ctx,
            addr,
            element.access(),
            EventType::RemoveElement,
            Addr::EMPTY,
            Addr::EMPTY,
        );
        if guard.refs() == 0 {
            guard.erase();
            self.cache_append(ctx, addr.seg);
        } else {
            element.set_state(ElementState::PendingDeletion);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::types::{AccessLevels, ScType};
    use std::time::Duration;

    fn storage() -> Storage {
        Storage::open(StorageConfig {
            max_loaded_segments: 2,
            event_workers: Some(1),
            ..StorageConfig::default()
        })
        .expect("open storage")
    }

    fn out_list(storage: &Storage, ctx: &Context, addr: Addr) -> Vec<Addr> {
        let mut arcs = Vec::new();
        let mut arc = storage.lock(ctx, addr).expect("lock").element().first_out();
        while !arc.is_empty() {
            arcs.push(arc);
            arc = storage
                .lock(ctx, arc)
                .expect("lock")
                .element()
                .arc(ArcField::NextOut);
        }
        arcs
    }

    #[test]
    fn deletion_cascades_through_incident_arcs() {
        let storage = storage();
        let ctx = storage.full_context();
        let a = storage.node_new(&ctx, ScType::CONST).expect("node");
        let b = storage.node_new(&ctx, ScType::CONST).expect("node");
        let c = storage.node_new(&ctx, ScType::CONST).expect("node");
        let arc = storage
            .arc_new(&ctx, ScType::ARC_POS_CONST_PERM, a, b)
            .expect("arc");
        let attr = storage
            .arc_new(&ctx, ScType::ARC_POS_CONST_PERM, c, arc)
            .expect("attr");

        storage.element_free(&ctx, a).expect("free");

        for gone in [a, arc, attr] {
            assert!(!storage.is_element(&ctx, gone));
        }
        assert!(storage.is_element(&ctx, b));
        assert!(storage.is_element(&ctx, c));
        assert!(out_list(&storage, &ctx, c).is_empty());
        assert!(storage.lock(&ctx, b).expect("lock").element().first_in().is_empty());
    }

    #[test]
    fn middle_arc_is_spliced_out() {
        let storage = storage();
        let ctx = storage.full_context();
        let a = storage.node_new(&ctx, ScType::CONST).expect("node");
        let b = storage.node_new(&ctx, ScType::CONST).expect("node");
        let arcs: Vec<Addr> = (0..3)
            .map(|_| {
                storage
                    .arc_new(&ctx, ScType::ARC_POS_CONST_PERM, a, b)
                    .expect("arc")
            })
            .collect();
        assert_eq!(out_list(&storage, &ctx, a), vec![arcs[2], arcs[1], arcs[0]]);

        storage.element_free(&ctx, arcs[1]).expect("free");
        assert_eq!(out_list(&storage, &ctx, a), vec![arcs[2], arcs[0]]);
        let guard = storage.lock(&ctx, arcs[0]).expect("lock");
        assert_eq!(guard.element().arc(ArcField::PrevOut), arcs[2]);
        assert_eq!(guard.element().arc(ArcField::PrevIn), arcs[2]);
    }

    #[test]
    fn protected_arc_blocks_whole_deletion() {
        let storage = storage();
        let admin = storage.full_context();
        let user = storage.context(AccessLevels::new(5, 5));
        let a = storage.node_new(&user, ScType::CONST).expect("node");
        let b = storage.node_new(&user, ScType::CONST).expect("node");
        let mine = storage
            .arc_new(&user, ScType::ARC_POS_CONST_PERM, a, b)
            .expect("arc");
        let guarded = storage
            .arc_new_ext(
                &admin,
                ScType::ARC_POS_CONST_PERM,
                a,
                b,
                AccessLevels::new(5, 9),
            )
            .expect("arc");

        assert_eq!(storage.element_free(&user, a), Err(ScError::NoWriteRights));
        for still in [a, b, mine, guarded] {
            assert!(storage.is_element(&admin, still));
        }
        assert_eq!(out_list(&storage, &admin, a), vec![guarded, mine]);
    }

    #[test]
    fn pinned_element_waits_for_last_unpin() {
        let storage = storage();
        let ctx = storage.full_context();
        let a = storage.node_new(&ctx, ScType::CONST).expect("node");
        storage.pin_for_read(&ctx, a).expect("pin");

        storage.element_free(&ctx, a).expect("free");
        assert!(!storage.is_element(&ctx, a));
        assert_eq!(
            storage.lock(&ctx, a).expect("lock").element().state(),
            ElementState::PendingDeletion
        );
        assert_eq!(storage.get_element_type(&ctx, a), Err(ScError::InvalidState));

        storage.unpin(&ctx, a);
        assert_eq!(
            storage.lock(&ctx, a).expect("lock").element().state(),
            ElementState::Free
        );
    }

    #[test]
    fn double_free_is_invalid_state() {
        let storage = storage();
        let ctx = storage.full_context();
        let a = storage.node_new(&ctx, ScType::CONST).expect("node");
        storage.element_free(&ctx, a).expect("free");
        assert_eq!(storage.element_free(&ctx, a), Err(ScError::InvalidState));
        assert_eq!(
            storage.element_free(&ctx, Addr::EMPTY),
            Err(ScError::InvalidParams)
        );
    }

    #[test]
    fn deleted_link_releases_its_content() {
        let storage = storage();
        let ctx = storage.full_context();
        let link = storage.link_new(&ctx).expect("link");
        storage
            .set_link_content(&ctx, link, &[5u8; 50])
            .expect("content");
        storage.element_free(&ctx, link).expect("free");
        assert!(
            storage
                .find_links_with_content(&ctx, &[5u8; 50])
                .expect("find")
                .is_empty()
        );
    }

    #[test]
    fn deletion_tears_down_subscriptions() {
        let storage = storage();
        let ctx = storage.full_context();
        let a = storage.node_new(&ctx, ScType::CONST).expect("node");
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = storage
            .event_new_with_delete(&ctx, a, EventType::RemoveElement, |_, _| {}, move |addr| {
                tx.send(addr).expect("send");
            })
            .expect("event");

        storage.element_free(&ctx, a).expect("free");
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).expect("delete callback"),
            a
        );
        assert!(handle.is_destroyed());
        assert_eq!(storage.subscriptions(a), 0);
        assert_eq!(
            storage.lock(&ctx, a).expect("lock").element().state(),
            ElementState::Free
        );
    }
}

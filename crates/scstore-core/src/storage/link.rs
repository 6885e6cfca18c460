//! Link content.
//!
//! A link's 32-byte payload slot holds either:
//! - nothing (all zero, `LINK_INLINE` clear): the link has no content;
//! - inline content (`LINK_INLINE` set): byte 0 is the length, the content
//!   follows, up to `MAX_INLINE_CONTENT` bytes;
//! - the checksum of content kept in the content store (`LINK_INLINE` clear).
//!
//! Every link with content, inline or not, has a back-reference in the
//! content store under the checksum of its bytes.

use super::Storage;
use crate::context::Context;
use crate::primitives::{CHECKSUM_LEN, MAX_INLINE_CONTENT};
use crate::segment::Element;
use crate::types::{Addr, Checksum, EventType, ScError, ScType};

/// Decoded view of a link's payload slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkContent {
    Empty,
    Inline(Vec<u8>),
    External(Checksum),
}

impl LinkContent {
    pub(crate) fn read(element: &Element) -> Self {
        let payload = element.payload();
        if element.kind().contains(ScType::LINK_INLINE) {
            let len = usize::from(payload[0]).min(MAX_INLINE_CONTENT);
            return Self::Inline(payload[1..=len].to_vec());
        }
        if payload.iter().all(|&b| b == 0) {
            Self::Empty
        } else {
            Self::External(Checksum(payload))
        }
    }

    /// Checksum under which the link is back-referenced.
    pub(crate) fn checksum(&self) -> Option<Checksum> {
        match self {
            Self::Empty => None,
            Self::Inline(bytes) => Some(Checksum::of(bytes)),
            Self::External(checksum) => Some(*checksum),
        }
    }

    fn write(element: &Element, content: &[u8], checksum: &Checksum) {
        let kind = element.kind();
        if content.len() <= MAX_INLINE_CONTENT {
            let mut payload = [0u8; CHECKSUM_LEN];
            payload[0] = content.len() as u8;
            payload[1..=content.len()].copy_from_slice(content);
            element.set_payload(&payload);
            element.set_kind(kind | ScType::LINK_INLINE);
        } else {
            element.set_payload(checksum.as_bytes());
            element.set_kind(kind.without(ScType::LINK_INLINE));
        }
    }
}

impl Storage {
    /// Replace a link's content. Short content is kept inline, longer content
    /// goes to the content store.
    pub fn set_link_content(
        &self,
        ctx: &Context,
        addr: Addr,
        content: &[u8],
    ) -> Result<(), ScError> {
        let checksum = Checksum::of(content);
        let external = content.len() > MAX_INLINE_CONTENT;

        let guard = self.lock_writable(ctx, addr)?;
        let element = guard.element();
        if !element.kind().is_link() {
            return Err(ScError::InvalidType);
        }

        let old = LinkContent::read(element).checksum();
        if old != Some(checksum) {
            if external {
                self.content.store(&checksum, content)?;
            }
            self.content.add_backref(addr, &checksum)?;
            if let Some(old) = old {
                if let Err(e) = self.content.remove_backref(addr, &old) {
                    tracing::warn!(link = %addr, error = %e, "stale content reference");
                }
            }
        }
        LinkContent::write(element, content, &checksum);

        self.emit(
            ctx,
            addr,
            element.access(),
            EventType::ContentChanged,
            Addr::EMPTY,
            Addr::EMPTY,
        );
        Ok(())
    }

    /// A link's content; empty when it never had any.
    pub fn get_link_content(&self, ctx: &Context, addr: Addr) -> Result<Vec<u8>, ScError> {
        let content = {
            let guard = self.lock_readable(ctx, addr)?;
            let element = guard.element();
            if !element.kind().is_link() {
                return Err(ScError::InvalidType);
            }
            LinkContent::read(element)
        };
        match content {
            LinkContent::Empty => Ok(Vec::new()),
            LinkContent::Inline(bytes) => Ok(bytes),
            LinkContent::External(checksum) => self.content.fetch(&checksum),
        }
    }

    /// Links carrying exactly `content` that the caller may read.
    ///
    /// Each recorded back-reference is checked against the link's current
    /// content under its lock; references to slots that no longer carry the
    /// content are dropped from the store. No matching link at all is an
    /// empty result; matches that are all unreadable are `NotFound`.
    pub fn find_links_with_content(
        &self,
        ctx: &Context,
        content: &[u8],
    ) -> Result<Vec<Addr>, ScError> {
        let checksum = Checksum::of(content);
        let candidates = self.content.find_by_checksum(&checksum)?;
        let mut matched = false;
        let mut found = Vec::with_capacity(candidates.len());
        for addr in candidates {
            let Ok(guard) = self.lock(ctx, addr) else {
                continue;
            };
            let element = guard.element();
            let holds = element.is_live()
                && element.kind().is_link()
                && LinkContent::read(element).checksum() == Some(checksum);
            if !holds {
                tracing::debug!(link = %addr, "dropping stale content reference");
                if let Err(e) = self.content.remove_backref(addr, &checksum) {
                    tracing::warn!(link = %addr, error = %e, "stale content reference");
                }
                continue;
            }
            matched = true;
            if ctx.can_read(element.access()) {
                found.push(addr);
            }
        }
        if matched && found.is_empty() {
            return Err(ScError::NotFound);
        }
        Ok(found)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::content::{ContentStore, MemoryContentStore};
    use crate::types::AccessLevels;

    fn storage() -> Storage {
        Storage::open(StorageConfig {
            max_loaded_segments: 2,
            event_workers: Some(1),
            ..StorageConfig::default()
        })
        .expect("open storage")
    }

    #[test]
    fn fresh_link_has_empty_content() {
        let storage = storage();
        let ctx = storage.full_context();
        let link = storage.link_new(&ctx).expect("link");
        assert!(storage.get_link_content(&ctx, link).expect("content").is_empty());
    }

    #[test]
    fn short_content_stays_inline() {
        let storage = storage();
        let ctx = storage.full_context();
        let link = storage.link_new(&ctx).expect("link");
        storage.set_link_content(&ctx, link, b"hello").expect("set");

        let guard = storage.lock(&ctx, link).expect("lock");
        assert!(guard.element().kind().contains(ScType::LINK_INLINE));
        assert_eq!(
            LinkContent::read(guard.element()),
            LinkContent::Inline(b"hello".to_vec())
        );
        drop(guard);

        assert_eq!(
            storage.get_element_type(&ctx, link).expect("type"),
            ScType::LINK_CONST
        );
        assert_eq!(
            storage.find_links_with_content(&ctx, b"hello").expect("find"),
            vec![link]
        );
    }

    #[test]
    fn long_content_goes_to_store() {
        let storage = storage();
        let ctx = storage.full_context();
        let link = storage.link_new(&ctx).expect("link");
        let content = vec![7u8; MAX_INLINE_CONTENT + 1];
        storage.set_link_content(&ctx, link, &content).expect("set");

        {
            let guard = storage.lock(&ctx, link).expect("lock");
            assert_eq!(
                LinkContent::read(guard.element()),
                LinkContent::External(Checksum::of(&content))
            );
        }
        assert_eq!(storage.get_link_content(&ctx, link).expect("get"), content);
    }

    #[test]
    fn replacing_content_moves_backref() {
        let storage = storage();
        let ctx = storage.full_context();
        let link = storage.link_new(&ctx).expect("link");
        let long = vec![1u8; 64];
        storage.set_link_content(&ctx, link, &long).expect("set");
        storage.set_link_content(&ctx, link, b"short").expect("set");

        assert_eq!(
            storage.find_links_with_content(&ctx, &long).expect("find"),
            Vec::<Addr>::new()
        );
        assert_eq!(
            storage.content().fetch(&Checksum::of(&long)),
            Err(ScError::NotFound)
        );
        assert_eq!(
            storage.find_links_with_content(&ctx, b"short").expect("find"),
            vec![link]
        );

        storage.set_link_content(&ctx, link, b"short").expect("same again");
        assert_eq!(
            storage.find_links_with_content(&ctx, b"short").expect("find"),
            vec![link]
        );
    }

    #[test]
    fn shared_content_is_found_on_every_link() {
        let storage = storage();
        let ctx = storage.full_context();
        let content = vec![9u8; 40];
        let a = storage.link_new(&ctx).expect("link");
        let b = storage.link_new(&ctx).expect("link");
        storage.set_link_content(&ctx, a, &content).expect("set");
        storage.set_link_content(&ctx, b, &content).expect("set");

        let mut found = storage
            .find_links_with_content(&ctx, &content)
            .expect("find");
        found.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(found, expected);
    }

    #[test]
    fn content_on_a_node_is_invalid_type() {
        let storage = storage();
        let ctx = storage.full_context();
        let node = storage.node_new(&ctx, ScType::CONST).expect("node");
        assert_eq!(
            storage.set_link_content(&ctx, node, b"x"),
            Err(ScError::InvalidType)
        );
        assert_eq!(
            storage.get_link_content(&ctx, node),
            Err(ScError::InvalidType)
        );
    }

    #[test]
    fn unreadable_matches_are_not_found() {
        let storage = storage();
        let owner = storage.full_context();
        let link = storage
            .link_new_ext(&owner, ScType::LINK_CONST, AccessLevels::new(9, 9))
            .expect("link");
        storage.set_link_content(&owner, link, b"secret").expect("set");

        let reader = storage.context(AccessLevels::new(2, 2));
        assert_eq!(
            storage.find_links_with_content(&reader, b"secret"),
            Err(ScError::NotFound)
        );
        assert_eq!(
            storage.get_link_content(&reader, link),
            Err(ScError::NoReadRights)
        );
        assert_eq!(
            storage.set_link_content(&reader, link, b"x"),
            Err(ScError::NoWriteRights)
        );
    }

    #[test]
    fn stale_references_are_not_returned() {
        let storage = storage();
        let ctx = storage.full_context();
        let link = storage.link_new(&ctx).expect("link");
        let old = vec![b'x'; 48];
        let new = vec![b'y'; 48];
        storage.set_link_content(&ctx, link, &new).expect("set");
        storage
            .content()
            .add_backref(link, &Checksum::of(&old))
            .expect("leftover ref");

        assert_eq!(
            storage.find_links_with_content(&ctx, &old).expect("find"),
            Vec::<Addr>::new()
        );
        assert!(
            storage
                .content()
                .find_by_checksum(&Checksum::of(&old))
                .expect("refs")
                .is_empty()
        );
        assert_eq!(
            storage.find_links_with_content(&ctx, &new).expect("find"),
            vec![link]
        );
    }

    #[derive(Debug)]
    struct FullDisk(MemoryContentStore);

    impl ContentStore for FullDisk {
        fn store(&self, _: &Checksum, _: &[u8]) -> Result<(), ScError> {
            Err(ScError::Io("no space left".into()))
        }
        fn fetch(&self, checksum: &Checksum) -> Result<Vec<u8>, ScError> {
            self.0.fetch(checksum)
        }
        fn add_backref(&self, addr: Addr, checksum: &Checksum) -> Result<(), ScError> {
            self.0.add_backref(addr, checksum)
        }
        fn remove_backref(&self, addr: Addr, checksum: &Checksum) -> Result<(), ScError> {
            self.0.remove_backref(addr, checksum)
        }
        fn find_by_checksum(&self, checksum: &Checksum) -> Result<Vec<Addr>, ScError> {
            self.0.find_by_checksum(checksum)
        }
        fn clear(&self) -> Result<(), ScError> {
            self.0.clear()
        }
        fn save(&self) -> Result<(), ScError> {
            self.0.save()
        }
    }

    #[test]
    fn failed_store_leaves_no_reference() {
        let storage = Storage::with_content_store(
            StorageConfig {
                event_workers: Some(1),
                ..StorageConfig::default()
            },
            Box::new(FullDisk(MemoryContentStore::new())),
        )
        .expect("open storage");
        let ctx = storage.full_context();
        let link = storage.link_new(&ctx).expect("link");
        storage.set_link_content(&ctx, link, b"short").expect("inline");

        let long = vec![3u8; 64];
        assert!(matches!(
            storage.set_link_content(&ctx, link, &long),
            Err(ScError::Io(_))
        ));
        assert!(
            storage
                .content()
                .find_by_checksum(&Checksum::of(&long))
                .expect("refs")
                .is_empty()
        );
        assert_eq!(storage.get_link_content(&ctx, link).expect("get"), b"short");
        assert_eq!(
            storage.find_links_with_content(&ctx, b"short").expect("find"),
            vec![link]
        );
    }
}

//! # Graph Import
//!
//! A JSON document lists elements in creation order. Each element may carry
//! a local `id`; arcs name their endpoints by those ids, so an arc can only
//! refer to elements listed before it (arcs included).
//!
//! ```json
//! {
//!   "elements": [
//!     { "kind": "node", "id": "apple", "type": ["const", "class"] },
//!     { "kind": "link", "id": "name", "content": "apple" },
//!     { "kind": "arc", "id": "rel", "type": ["const", "pos", "perm"],
//!       "begin": "apple", "end": "name" }
//!   ]
//! }
//! ```

use std::collections::HashMap;

use scstore_core::{Addr, Context, ScType, Storage};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Upper bound on elements in one document.
pub const MAX_IMPORT_ELEMENTS: usize = 10_000_000;

// =============================================================================
// DOCUMENT MODEL
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphDocument {
    pub elements: Vec<ElementSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum ElementSpec {
    Node {
        #[serde(default)]
        id: Option<String>,
        #[serde(default, rename = "type")]
        flags: Vec<String>,
    },
    Link {
        #[serde(default)]
        id: Option<String>,
        #[serde(default, rename = "type")]
        flags: Vec<String>,
        #[serde(default)]
        content: Option<String>,
    },
    Arc {
        #[serde(default)]
        id: Option<String>,
        #[serde(default, rename = "type")]
        flags: Vec<String>,
        begin: String,
        end: String,
    },
}

impl ElementSpec {
    fn id(&self) -> Option<&str> {
        match self {
            Self::Node { id, .. } | Self::Link { id, .. } | Self::Arc { id, .. } => id.as_deref(),
        }
    }
}

/// Counts of created elements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub nodes: usize,
    pub links: usize,
    pub arcs: usize,
}

impl ImportReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.nodes + self.links + self.arcs
    }
}

// =============================================================================
// TYPE NAMES
// =============================================================================

const NODE_FLAGS: &[(&str, ScType)] = &[
    ("const", ScType::CONST),
    ("var", ScType::VAR),
    ("tuple", ScType::NODE_TUPLE),
    ("struct", ScType::NODE_STRUCT),
    ("role", ScType::NODE_ROLE),
    ("norole", ScType::NODE_NOROLE),
    ("class", ScType::NODE_CLASS),
    ("abstract", ScType::NODE_ABSTRACT),
    ("material", ScType::NODE_MATERIAL),
];

const LINK_FLAGS: &[(&str, ScType)] = &[("const", ScType::CONST), ("var", ScType::VAR)];

const ARC_FLAGS: &[(&str, ScType)] = &[
    ("common", ScType::ARC_COMMON),
    ("edge", ScType::EDGE_COMMON),
    ("access", ScType::ARC_ACCESS),
    ("const", ScType::CONST),
    ("var", ScType::VAR),
    ("pos", ScType::ARC_POS),
    ("neg", ScType::ARC_NEG),
    ("fuz", ScType::ARC_FUZ),
    ("temp", ScType::ARC_TEMP),
    ("perm", ScType::ARC_PERM),
];

/// Fold flag names into a type mask using the table for one element kind.
fn parse_flags(table: &[(&str, ScType)], names: &[String]) -> Result<ScType, AppError> {
    names.iter().try_fold(ScType::UNKNOWN, |acc, name| {
        table
            .iter()
            .find(|(known, _)| *known == name.as_str())
            .map(|(_, flag)| acc | *flag)
            .ok_or_else(|| AppError::Import(format!("unknown type flag '{}'", name)))
    })
}

/// Arcs naming only constancy/polarity flags become access arcs.
fn arc_type(names: &[String]) -> Result<ScType, AppError> {
    let ty = parse_flags(ARC_FLAGS, names)?;
    if ty.intersects(ScType::ARC_MASK) || ty == ScType::UNKNOWN {
        Ok(ty)
    } else {
        Ok(ty | ScType::ARC_ACCESS)
    }
}

// =============================================================================
// IMPORT
// =============================================================================

/// Create every element of `doc` in order.
///
/// Elements created before a failure stay in the store.
pub fn import_graph(
    storage: &Storage,
    ctx: &Context,
    doc: &GraphDocument,
) -> Result<ImportReport, AppError> {
    if doc.elements.len() > MAX_IMPORT_ELEMENTS {
        return Err(AppError::Import(format!(
            "element count {} exceeds maximum {}",
            doc.elements.len(),
            MAX_IMPORT_ELEMENTS
        )));
    }

    let mut ids: HashMap<&str, Addr> = HashMap::new();
    let mut report = ImportReport::default();

    for (index, spec) in doc.elements.iter().enumerate() {
        if let Some(id) = spec.id()
            && ids.contains_key(id)
        {
            return Err(AppError::Import(format!("duplicate id '{}'", id)));
        }

        let addr = match spec {
            ElementSpec::Node { flags, .. } => {
                let ty = parse_flags(NODE_FLAGS, flags)?;
                report.nodes += 1;
                storage.node_new(ctx, ty)?
            }
            ElementSpec::Link { flags, content, .. } => {
                let ty = parse_flags(LINK_FLAGS, flags)?;
                let link = storage.link_new_ext(ctx, ty, ctx.access_levels())?;
                if let Some(content) = content {
                    storage.set_link_content(ctx, link, content.as_bytes())?;
                }
                report.links += 1;
                link
            }
            ElementSpec::Arc {
                flags, begin, end, ..
            } => {
                let resolve = |name: &String| {
                    ids.get(name.as_str()).copied().ok_or_else(|| {
                        AppError::Import(format!(
                            "element {} refers to unknown id '{}'",
                            index, name
                        ))
                    })
                };
                let (begin, end) = (resolve(begin)?, resolve(end)?);
                let arc = storage.arc_new(ctx, arc_type(flags)?, begin, end)?;
                report.arcs += 1;
                arc
            }
        };

        if let Some(id) = spec.id() {
            ids.insert(id, addr);
        }
    }

    tracing::info!(
        nodes = report.nodes,
        links = report.links,
        arcs = report.arcs,
        "graph imported"
    );
    Ok(report)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use scstore_core::Iterator3;

    fn parse(json: &str) -> GraphDocument {
        serde_json::from_str(json).expect("valid document")
    }

    #[test]
    fn flags_fold_into_a_mask() {
        let names = vec!["const".to_string(), "class".to_string()];
        assert_eq!(
            parse_flags(NODE_FLAGS, &names).expect("flags"),
            ScType::CONST | ScType::NODE_CLASS
        );
        assert!(parse_flags(LINK_FLAGS, &["class".to_string()]).is_err());
    }

    #[test]
    fn polarity_only_arcs_are_access_arcs() {
        let names = ["const", "pos", "perm"].map(String::from);
        assert_eq!(arc_type(&names).expect("type"), ScType::ARC_POS_CONST_PERM);
        assert_eq!(arc_type(&[]).expect("type"), ScType::UNKNOWN);
        assert_eq!(
            arc_type(&["common".to_string()]).expect("type"),
            ScType::ARC_COMMON
        );
    }

    #[test]
    fn document_is_created_in_order() {
        let storage = Storage::in_memory().expect("storage");
        let ctx = storage.full_context();
        let doc = parse(
            r#"{"elements": [
                {"kind": "node", "id": "apple", "type": ["const", "class"]},
                {"kind": "link", "id": "name", "content": "apple"},
                {"kind": "arc", "id": "rel", "type": ["const", "pos", "perm"],
                 "begin": "apple", "end": "name"},
                {"kind": "node", "id": "attr", "type": ["const", "role"]},
                {"kind": "arc", "begin": "attr", "end": "rel"}
            ]}"#,
        );

        let report = import_graph(&storage, &ctx, &doc).expect("import");
        assert_eq!(
            report,
            ImportReport {
                nodes: 2,
                links: 1,
                arcs: 2
            }
        );
        assert_eq!(report.total(), 5);

        let links = storage
            .find_links_with_content(&ctx, b"apple")
            .expect("find");
        assert_eq!(links.len(), 1);

        let incoming: Vec<[Addr; 3]> =
            Iterator3::a_a_f(&storage, &ctx, ScType::NODE, ScType::UNKNOWN, links[0])
                .expect("iterator")
                .collect();
        assert_eq!(incoming.len(), 1);
        let [apple, rel, _] = incoming[0];
        assert_eq!(
            storage.get_element_type(&ctx, apple).expect("type"),
            ScType::NODE_CONST_CLASS
        );

        let attrs: Vec<[Addr; 3]> =
            Iterator3::a_a_f(&storage, &ctx, ScType::NODE, ScType::ARC_COMMON, rel)
                .expect("iterator")
                .collect();
        assert_eq!(attrs.len(), 1);
    }

    #[test]
    fn unknown_references_fail() {
        let storage = Storage::in_memory().expect("storage");
        let ctx = storage.full_context();
        let doc = parse(
            r#"{"elements": [
                {"kind": "node", "id": "a"},
                {"kind": "arc", "begin": "a", "end": "b"}
            ]}"#,
        );
        let err = import_graph(&storage, &ctx, &doc).expect_err("dangling end");
        assert!(matches!(err, AppError::Import(ref msg) if msg.contains("'b'")));
    }

    #[test]
    fn duplicate_ids_fail() {
        let storage = Storage::in_memory().expect("storage");
        let ctx = storage.full_context();
        let doc = parse(
            r#"{"elements": [
                {"kind": "node", "id": "a"},
                {"kind": "link", "id": "a"}
            ]}"#,
        );
        let err = import_graph(&storage, &ctx, &doc).expect_err("duplicate");
        assert!(matches!(err, AppError::Import(_)));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<GraphDocument, _> =
            serde_json::from_str(r#"{"elements": [{"kind": "node", "colour": "red"}]}"#);
        assert!(result.is_err());
    }
}

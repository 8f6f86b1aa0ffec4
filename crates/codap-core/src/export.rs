//! # Persisted Form
//!
//! The serializable shape of a data context: an ordered list of collection
//! specs (name, parent link, attribute definitions), each carrying its case
//! records (id, parent id, attribute → value map) in display order.
//!
//! IDs are preserved by a round trip through this form. They are not
//! preserved across an undo of a delete, which recreates cases.
//!
//! This module only converts between live contexts and specs. Encoding is
//! done by `serde_json` in the app, or by `formats` for the binary snapshot.

use crate::attribute::Attribute;
use crate::case::Case;
use crate::collection::Collection;
use crate::data_context::DataContext;
use crate::primitives::{FORMAT_VERSION, MAX_HIERARCHY_DEPTH};
use crate::registry::ContextRegistry;
use crate::{AttributeId, CaseId, CodapError, CollectionId, DataContextId, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// SPEC TYPES
// =============================================================================

/// One persisted case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub id: CaseId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<CaseId>,
    #[serde(default)]
    pub values: BTreeMap<AttributeId, Value>,
}

/// One persisted collection with its cases in display order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub id: CollectionId,
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<CollectionId>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub cases: Vec<CaseRecord>,
}

/// One persisted data context. Collections are parent-most first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSpec {
    pub id: DataContextId,
    pub name: String,
    #[serde(default)]
    pub title: String,
    /// Allocator state, so new IDs never collide with persisted ones.
    #[serde(default)]
    pub next_id: u64,
    #[serde(default)]
    pub collections: Vec<CollectionSpec>,
}

/// Every context of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSpec {
    pub version: u8,
    #[serde(default)]
    pub contexts: Vec<ContextSpec>,
}

impl Default for DocumentSpec {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION,
            contexts: Vec::new(),
        }
    }
}

// =============================================================================
// EXPORT
// =============================================================================

/// Snapshot a live context.
#[must_use]
pub fn export_context(ctx: &DataContext) -> ContextSpec {
    let collections = ctx
        .collections()
        .iter()
        .map(|collection| CollectionSpec {
            id: collection.id(),
            name: collection.name().to_string(),
            title: collection.title().to_string(),
            parent: collection.parent_id(),
            attributes: collection.attributes().to_vec(),
            cases: collection
                .cases()
                .map(|case| CaseRecord {
                    id: case.id(),
                    parent: case.parent(),
                    values: case.values().clone(),
                })
                .collect(),
        })
        .collect();

    ContextSpec {
        id: ctx.id(),
        name: ctx.name().to_string(),
        title: ctx.title().to_string(),
        next_id: ctx.next_id(),
        collections,
    }
}

/// Snapshot every context of a registry.
#[must_use]
pub fn export_document(contexts: &ContextRegistry) -> DocumentSpec {
    DocumentSpec {
        version: FORMAT_VERSION,
        contexts: contexts.iter().map(export_context).collect(),
    }
}

// =============================================================================
// IMPORT
// =============================================================================

/// Rebuild a live context, keeping every persisted ID.
///
/// Rejects documents whose collection chain is not linear, whose case
/// parents are not in the parent collection, or that reuse an ID.
pub fn import_context(spec: ContextSpec) -> Result<DataContext, CodapError> {
    if spec.collections.len() > MAX_HIERARCHY_DEPTH {
        return Err(CodapError::DeserializationError(format!(
            "{} collections exceed the hierarchy limit",
            spec.collections.len()
        )));
    }

    let mut ctx = DataContext::new(spec.id, spec.name);
    if !spec.title.is_empty() {
        ctx.set_title(spec.title);
    }

    let mut seen = BTreeSet::new();
    let mut previous: Option<CollectionId> = None;
    for collection_spec in spec.collections {
        if collection_spec.parent != previous {
            return Err(CodapError::DeserializationError(format!(
                "collection '{}' breaks the parent chain",
                collection_spec.name
            )));
        }
        if !seen.insert(collection_spec.id.0) {
            return Err(CodapError::DeserializationError(format!(
                "duplicate id {}",
                collection_spec.id
            )));
        }

        let mut collection =
            Collection::new(collection_spec.id, collection_spec.name, collection_spec.parent);
        if !collection_spec.title.is_empty() {
            collection.set_title(collection_spec.title);
        }
        for attribute in collection_spec.attributes {
            if !seen.insert(attribute.id.0) {
                return Err(CodapError::DeserializationError(format!(
                    "duplicate id {}",
                    attribute.id
                )));
            }
            collection.add_attribute(attribute, None);
        }
        let attribute_ids = collection.attribute_ids();
        let collection_id = collection.id();
        ctx.restore_collection(collection);

        for record in collection_spec.cases {
            if !seen.insert(record.id.0) {
                return Err(CodapError::DeserializationError(format!(
                    "duplicate id {}",
                    record.id
                )));
            }
            let mut case = Case::new(
                record.id,
                collection_id,
                record.parent,
                attribute_ids.iter().copied(),
            );
            for (attribute, value) in record.values {
                if attribute_ids.contains(&attribute) {
                    case.set_value(attribute, value);
                } else {
                    tracing::warn!(case = %record.id, "dropping value for unknown attribute {}", attribute);
                }
            }
            ctx.restore_case(case)?;
        }
        previous = Some(collection_id);
    }

    ctx.reserve_ids(spec.next_id);
    // A freshly loaded context has nothing unsaved.
    ctx.take_dirty();
    Ok(ctx)
}

/// Rebuild a registry from a document.
pub fn import_document(spec: DocumentSpec) -> Result<ContextRegistry, CodapError> {
    if spec.version != FORMAT_VERSION {
        return Err(CodapError::DeserializationError(format!(
            "unsupported document version {} (expected {})",
            spec.version, FORMAT_VERSION
        )));
    }
    let mut registry = ContextRegistry::new();
    for context in spec.contexts {
        let ctx = import_context(context)?;
        registry.insert(ctx);
    }
    Ok(registry)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::AttributeSpec;
    use crate::change::{CaseSpec, ChangeRequest};

    fn sample() -> DataContext {
        let mut ctx = DataContext::new(DataContextId(3), "Mammals");
        ctx.apply_change(ChangeRequest::CreateCollection {
            name: "Families".to_string(),
            title: Some("Family".to_string()),
            parent: None,
            attributes: vec![AttributeSpec::named("surname")],
            attribute_order: vec![],
        });
        ctx.apply_change(ChangeRequest::CreateCollection {
            name: "People".to_string(),
            title: None,
            parent: Some("Families".into()),
            attributes: vec![AttributeSpec::named("age").with_formula("2 * 1")],
            attribute_order: vec![],
        });
        let f = ctx
            .apply_change(ChangeRequest::CreateCase {
                collection: Some("Families".into()),
                case: CaseSpec::root(vec![Value::from("Smith")]),
            })
            .case_id
            .expect("family");
        ctx.apply_change(ChangeRequest::CreateCases {
            collection: None,
            cases: vec![
                CaseSpec::child(f, vec![Value::from(30)]),
                CaseSpec::child(f, vec![Value::from(true)]).at(0),
            ],
        });
        ctx
    }

    #[test]
    fn round_trip_preserves_ids_order_and_values() {
        let ctx = sample();
        let spec = export_context(&ctx);
        let restored = import_context(spec.clone()).expect("import");

        assert_eq!(export_context(&restored), spec);
        assert_eq!(restored.case_count(), ctx.case_count());
        assert_eq!(restored.collections()[0].title(), "Family");

        let people = &restored.collections()[1];
        assert_eq!(people.case_ids(), ctx.collections()[1].case_ids());
        let parent = people.case_at(0).and_then(Case::parent).expect("parent");
        assert_eq!(restored.case(parent).expect("parent").children().len(), 2);
    }

    #[test]
    fn imported_context_continues_allocation() {
        let ctx = sample();
        let max_id = ctx.all_case_ids().into_iter().map(|c| c.0).max().unwrap_or(0);
        let mut restored = import_context(export_context(&ctx)).expect("import");
        assert!(!restored.take_dirty());

        let result = restored.apply_change(ChangeRequest::CreateCase {
            collection: Some("Families".into()),
            case: CaseSpec::root(vec![Value::from("Jones")]),
        });
        assert!(result.case_id.expect("created").0 > max_id);
    }

    #[test]
    fn broken_chain_is_rejected() {
        let mut spec = export_context(&sample());
        spec.collections[1].parent = None;
        assert!(import_context(spec).is_err());
    }

    #[test]
    fn parent_in_wrong_collection_is_rejected() {
        let mut spec = export_context(&sample());
        let child = spec.collections[1].cases[0].id;
        spec.collections[1].cases[1].parent = Some(child);
        assert!(import_context(spec).is_err());
    }

    #[test]
    fn orphan_in_child_collection_is_rejected() {
        let mut spec = export_context(&sample());
        spec.collections[1].cases[0].parent = None;
        assert!(matches!(
            import_context(spec),
            Err(CodapError::InvalidParent(None))
        ));
    }

    #[test]
    fn parent_on_root_case_is_rejected() {
        let mut spec = export_context(&sample());
        let other = spec.collections[0].cases[0].id;
        spec.collections[0].cases[0].parent = Some(other);
        assert!(import_context(spec).is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut spec = export_context(&sample());
        let dup = spec.collections[0].cases[0].id;
        spec.collections[1].cases[0].id = dup;
        assert!(import_context(spec).is_err());
    }

    #[test]
    fn document_round_trip_through_registry() {
        let mut registry = ContextRegistry::new();
        registry.insert(sample());
        let spec = export_document(&registry);
        let restored = import_document(spec.clone()).expect("import");
        assert_eq!(export_document(&restored), spec);

        let mut wrong = spec;
        wrong.version = 99;
        assert!(import_document(wrong).is_err());
    }
}

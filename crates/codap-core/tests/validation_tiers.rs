//! # Validation Tier Tests (T0-T4)
//!
//! End-to-end scenarios over the public API. If ANY tier fails, the engine
//! is INVALID.
//!
//! ## Tiers
//! - T0: Hierarchy construction
//! - T1: Change log and notification deferral
//! - T2: Selection
//! - T3: Undo round trips
//! - T4: Row index and persistence

use codap_core::{
    AttributeSpec, CaseId, CaseSpec, CaseTableRowIndex, ChangeRequest, CollectionRef, DataContext,
    DataContextId, Document, Notification, Value, command_for_change,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Families (surname) -> People (name, age). F1 = Smith with A, B.
struct Families {
    ctx: DataContext,
    f1: CaseId,
    a: CaseId,
    b: CaseId,
}

fn families() -> Families {
    let mut ctx = DataContext::new(DataContextId(1), "Households");
    ctx.apply_change(ChangeRequest::CreateCollection {
        name: "Families".to_string(),
        title: None,
        parent: None,
        attributes: vec![AttributeSpec::named("surname")],
        attribute_order: vec![],
    });
    ctx.apply_change(ChangeRequest::CreateCollection {
        name: "People".to_string(),
        title: None,
        parent: Some("Families".into()),
        attributes: vec![AttributeSpec::named("name"), AttributeSpec::named("age")],
        attribute_order: vec![],
    });
    let f1 = ctx
        .apply_change(ChangeRequest::CreateCase {
            collection: Some("Families".into()),
            case: CaseSpec::root(vec![Value::from("Smith")]),
        })
        .case_id
        .expect("family");
    let people = ctx.apply_change(ChangeRequest::CreateCases {
        collection: Some("People".into()),
        cases: vec![
            CaseSpec::named(
                Some(f1),
                BTreeMap::from([
                    ("name".to_string(), Value::from("Ann")),
                    ("age".to_string(), Value::from(41)),
                ]),
            ),
            CaseSpec::named(
                Some(f1),
                BTreeMap::from([
                    ("name".to_string(), Value::from("Bob")),
                    ("age".to_string(), Value::from(12)),
                ]),
            ),
        ],
    });
    assert!(people.success);
    Families {
        ctx,
        f1,
        a: people.case_ids[0],
        b: people.case_ids[1],
    }
}

fn people_id(ctx: &DataContext) -> codap_core::CollectionId {
    ctx.collection_by_name("People").expect("people").id()
}

// =============================================================================
// TIER T0: HIERARCHY CONSTRUCTION
// =============================================================================

mod t0_hierarchy {
    use super::*;

    /// T0.1: Child cases are linked to their parent exactly once.
    #[test]
    fn parent_links_are_bidirectional() {
        let Families { ctx, f1, a, b } = families();
        let parent = ctx.case(f1).expect("f1");
        assert_eq!(parent.children(), &[a, b]);
        for child in [a, b] {
            let case = ctx.case(child).expect("child");
            assert_eq!(case.parent(), Some(f1));
            assert_eq!(
                ctx.child_collection(parent.collection()).map(|c| c.id()),
                Some(case.collection())
            );
        }
    }

    /// T0.2: A parent that does not exist rejects the case and adds nothing.
    #[test]
    fn missing_parent_is_rejected() {
        let Families { mut ctx, .. } = families();
        let before = ctx.case_count();
        let result = ctx.apply_change(ChangeRequest::CreateCases {
            collection: Some("People".into()),
            cases: vec![CaseSpec::child(CaseId(999), vec![Value::from("Ghost")])],
        });
        assert!(!result.success);
        assert!(result.case_ids.is_empty());
        assert_eq!(ctx.case_count(), before);
    }

    /// T0.3: Children inherit the parent's same-named values.
    #[test]
    fn inherited_values_follow_parent() {
        let Families { ctx, a, .. } = families();
        let values = ctx.case_values_by_name(a).expect("values");
        assert_eq!(values.get("surname"), Some(&Value::from("Smith")));
        assert_eq!(values.get("age"), Some(&Value::from(41)));
    }

    /// T0.4: Deleting a parent removes its whole subtree.
    #[test]
    fn cascade_delete_removes_subtree() {
        let Families { mut ctx, f1, a, b } = families();
        let result = ctx.apply_change(ChangeRequest::DeleteCases { cases: vec![f1] });
        assert!(result.success);
        assert_eq!(result.deleted_case_ids.len(), 3);
        for id in [f1, a, b] {
            assert!(ctx.case(id).is_none());
        }
        assert_eq!(ctx.case_count(), 0);
    }

    /// T0.5: A collection that is not child-most cannot take a new child.
    #[test]
    fn collection_chain_stays_linear() {
        let Families { mut ctx, .. } = families();
        let result = ctx.apply_change(ChangeRequest::CreateCollection {
            name: "Pets".to_string(),
            title: None,
            parent: Some(CollectionRef::Name("Families".to_string())),
            attributes: vec![],
            attribute_order: vec![],
        });
        assert!(!result.success);
        assert_eq!(ctx.collections().len(), 2);
    }
}

// =============================================================================
// TIER T1: CHANGE LOG AND NOTIFICATION DEFERRAL
// =============================================================================

mod t1_change_log {
    use super::*;

    /// T1.1: Every applied change is logged and counted, failures included.
    #[test]
    fn change_count_tracks_log() {
        let Families { mut ctx, .. } = families();
        let start = ctx.change_count();
        ctx.apply_change(ChangeRequest::DeleteCases {
            cases: vec![CaseId(12_345)],
        });
        ctx.apply_change(ChangeRequest::ResetCollections);
        assert_eq!(ctx.change_count(), start + 2);
        assert_eq!(ctx.changes().len() as u64, ctx.change_count());
        assert_eq!(ctx.new_changes(start).len(), 2);
    }

    /// T1.2: Observers hear nothing until the end of the turn.
    #[test]
    fn notifications_are_deferred() {
        let Families { mut ctx, a, .. } = families();
        ctx.flush_notifications();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        ctx.subscribe(move |n: &Notification| sink.lock().expect("lock").push(n.clone()));

        let people = people_id(&ctx);
        let age = ctx.attribute_by_name("age").expect("age").id;
        ctx.apply_change(ChangeRequest::UpdateCases {
            collection: Some(CollectionRef::Id(people)),
            cases: vec![a],
            values: vec![vec![Value::from(42)]],
            attribute_ids: Some(vec![age]),
        });
        assert!(seen.lock().expect("lock").is_empty());

        ctx.flush_notifications();
        let seen = seen.lock().expect("lock");
        assert!(seen.contains(&Notification::CaseValuesChanged {
            context: ctx.id(),
            case: a
        }));
        assert!(seen.iter().any(|n| matches!(
            n,
            Notification::ChangeCountChanged { change_count, .. } if *change_count == ctx.change_count()
        )));
    }

    /// T1.3: A destroyed context refuses changes and has no observers left.
    #[test]
    fn destroyed_context_is_inert() {
        let Families { mut ctx, .. } = families();
        ctx.set_invariant_mode(codap_core::InvariantMode::Log);
        ctx.destroy();
        let count = ctx.change_count();
        let result = ctx.apply_change(ChangeRequest::ResetCollections);
        assert!(!result.success);
        assert_eq!(ctx.change_count(), count);
        assert!(ctx.collections().is_empty());
    }
}

// =============================================================================
// TIER T2: SELECTION
// =============================================================================

mod t2_selection {
    use super::*;

    fn select(ctx: &mut DataContext, cases: Vec<CaseId>, extend: bool) {
        let result = ctx.apply_change(ChangeRequest::SelectCases {
            cases: Some(cases),
            select: true,
            extend,
            descendants: false,
        });
        assert!(result.success);
    }

    /// T2.1: Extending adds to the existing selection.
    #[test]
    fn extend_accumulates() {
        let Families { mut ctx, a, b, .. } = families();
        let people = people_id(&ctx);

        select(&mut ctx, vec![a], false);
        assert_eq!(ctx.selection(people).map(|s| s.len()), Some(1));
        select(&mut ctx, vec![b], true);
        let selection = ctx.selection(people).expect("selection");
        assert!(selection.contains(&a) && selection.contains(&b));
    }

    /// T2.2: One call touching two collections keeps both; a later
    /// non-extending call on one collection clears the other.
    #[test]
    fn extend_is_per_collection_per_call() {
        let Families { mut ctx, f1, a, .. } = families();
        let families_id = ctx.collection_by_name("Families").expect("families").id();
        let people = people_id(&ctx);

        select(&mut ctx, vec![f1, a], false);
        assert!(ctx.is_selected(f1));
        assert!(ctx.is_selected(a));

        select(&mut ctx, vec![f1], false);
        assert_eq!(ctx.selection(families_id).map(|s| s.len()), Some(1));
        assert_eq!(ctx.selection(people).map(|s| s.len()), Some(0));
    }

    /// T2.3: Selecting a parent with descendants selects its children.
    #[test]
    fn descendants_cascade() {
        let Families { mut ctx, f1, a, b } = families();
        ctx.apply_change(ChangeRequest::SelectCases {
            cases: Some(vec![f1]),
            select: true,
            extend: false,
            descendants: true,
        });
        assert!(ctx.is_selected(a) && ctx.is_selected(b));
    }

    /// T2.4: Only a net membership flip counts as a selection change.
    #[test]
    fn reselecting_is_not_a_selection_change() {
        let Families { mut ctx, a, .. } = families();
        select(&mut ctx, vec![a], false);
        let count = ctx.selection_change_count();
        select(&mut ctx, vec![a], true);
        assert_eq!(ctx.selection_change_count(), count);
    }
}

// =============================================================================
// TIER T3: UNDO ROUND TRIPS
// =============================================================================

mod t3_undo {
    use super::*;

    fn document() -> (Document, DataContextId, CaseId, CaseId) {
        let Families { ctx, f1, a, .. } = families();
        let spec = codap_core::DocumentSpec {
            contexts: vec![codap_core::export_context(&ctx)],
            ..codap_core::DocumentSpec::default()
        };
        let doc = Document::from_spec(spec, 100).expect("restore");
        let id = doc.resolve("Households").expect("context");
        (doc, id, f1, a)
    }

    /// Visible state: (collection, parent row, values by name) in display order.
    fn visible(ctx: &DataContext) -> Vec<(String, Option<usize>, BTreeMap<String, Value>)> {
        let mut rows = Vec::new();
        for collection in ctx.collections() {
            for case in collection.cases() {
                let parent_row = case.parent().and_then(|p| {
                    ctx.parent_collection(collection.id())
                        .and_then(|pc| pc.case_index(p))
                });
                rows.push((
                    collection.name().to_string(),
                    parent_row,
                    ctx.case_values_by_name(case.id()).expect("values"),
                ));
            }
        }
        rows
    }

    /// T3.1: Delete then undo restores an equivalent visible state.
    #[test]
    fn delete_undo_is_value_equivalent() {
        let (mut doc, id, f1, _) = document();
        let before = visible(doc.context(id).expect("ctx"));

        let command = command_for_change(id, ChangeRequest::DeleteCases { cases: vec![f1] })
            .expect("undoable");
        doc.execute(command).expect("delete");
        assert_eq!(doc.context(id).expect("ctx").case_count(), 0);

        doc.undo().expect("undo");
        let ctx = doc.context(id).expect("ctx");
        assert_eq!(visible(ctx), before);
        assert!(ctx.case(f1).is_none(), "undo recreates cases with fresh IDs");

        doc.redo().expect("redo");
        assert_eq!(doc.context(id).expect("ctx").case_count(), 0);
    }

    /// T3.2: Update then undo restores the old values.
    #[test]
    fn update_undo_restores_values() {
        let (mut doc, id, _, a) = document();
        let before = visible(doc.context(id).expect("ctx"));
        let people = people_id(doc.context(id).expect("ctx"));

        let command = command_for_change(
            id,
            ChangeRequest::UpdateCases {
                collection: Some(CollectionRef::Id(people)),
                cases: vec![a],
                values: vec![vec![Value::from("Smith"), Value::from("Anne"), Value::from(42)]],
                attribute_ids: None,
            },
        )
        .expect("undoable");
        doc.execute(command).expect("update");
        assert_ne!(visible(doc.context(id).expect("ctx")), before);

        assert_eq!(doc.undo().expect("undo"), "Undo edit 1 case");
        assert_eq!(visible(doc.context(id).expect("ctx")), before);
    }

    /// T3.3: Deleting an attribute and undoing restores column and values.
    #[test]
    fn delete_attribute_undo_restores_column() {
        let (mut doc, id, _, _) = document();
        let before = visible(doc.context(id).expect("ctx"));
        let order = |doc: &Document| -> Vec<String> {
            doc.context(id)
                .and_then(|c| c.collection_by_name("People"))
                .map(|c| c.attributes().iter().map(|a| a.name.clone()).collect())
                .unwrap_or_default()
        };
        let columns = order(&doc);

        let command = command_for_change(
            id,
            ChangeRequest::DeleteAttributes {
                collection: "People".into(),
                attributes: vec![codap_core::AttributeRef::Name("name".to_string())],
            },
        )
        .expect("undoable");
        doc.execute(command).expect("delete attribute");
        assert!(!order(&doc).contains(&"name".to_string()));

        doc.undo().expect("undo");
        assert_eq!(order(&doc), columns);
        assert_eq!(visible(doc.context(id).expect("ctx")), before);
    }
}

// =============================================================================
// TIER T4: ROW INDEX AND PERSISTENCE
// =============================================================================

mod t4_rows_and_persistence {
    use super::*;

    /// T4.1: Collapsing a parent folds its children into one row.
    #[test]
    fn collapse_round_trip() {
        let Families { mut ctx, f1, .. } = families();
        let c3 = ctx
            .apply_change(ChangeRequest::CreateCase {
                collection: Some("People".into()),
                case: CaseSpec::child(f1, vec![Value::from("Cal")]),
            })
            .case_id
            .expect("c3");
        let children = ctx.case(f1).expect("f1").children().to_vec();
        assert_eq!(children.last(), Some(&c3));

        let mut index = CaseTableRowIndex::new(people_id(&ctx));
        index.refresh(&ctx);
        assert_eq!(index.get_length(), 3);

        assert!(index.collapse_group(&ctx, f1));
        assert_eq!(index.get_length(), 1);
        assert_eq!(index.get_item(0), Some(f1));

        assert!(index.expand_group(&ctx, f1));
        assert_eq!(index.get_length(), 3);
        for (row, child) in children.iter().enumerate() {
            assert_eq!(index.get_item(row), Some(*child));
        }
    }

    /// T4.2: The index catches up with changes made after it was built.
    #[test]
    fn sync_follows_change_count() {
        let Families { mut ctx, a, .. } = families();
        let mut index = CaseTableRowIndex::new(people_id(&ctx));
        index.refresh(&ctx);
        assert!(!index.sync(&ctx));

        ctx.apply_change(ChangeRequest::DeleteCases { cases: vec![a] });
        assert!(index.sync(&ctx));
        assert_eq!(index.get_length(), 1);
        assert_eq!(index.get_row_by_id(a), None);
    }

    /// T4.3: JSON and binary round trips preserve every ID.
    #[test]
    fn persisted_forms_preserve_ids() {
        let Families { ctx, f1, a, b } = families();
        let spec = codap_core::DocumentSpec {
            contexts: vec![codap_core::export_context(&ctx)],
            ..codap_core::DocumentSpec::default()
        };

        let json = serde_json::to_string(&spec).expect("json");
        let from_json: codap_core::DocumentSpec = serde_json::from_str(&json).expect("parse");
        assert_eq!(from_json, spec);

        let bytes = codap_core::document_to_bytes(&spec).expect("encode");
        let from_bytes = codap_core::document_from_bytes(&bytes).expect("decode");
        let doc = Document::from_spec(from_bytes, 100).expect("restore");

        let restored = doc.context(ctx.id()).expect("context");
        for id in [f1, a, b] {
            assert_eq!(restored.case(id), ctx.case(id));
        }
    }
}

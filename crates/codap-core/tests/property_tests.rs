//! # Property-Based Tests
//!
//! Structural invariants of the case hierarchy under random change
//! sequences.

use codap_core::{
    AttributeSpec, CaseId, CaseSpec, CaseTableRowIndex, ChangeRequest, DataContext, DataContextId,
    Value,
};
use proptest::collection::vec;
use proptest::prelude::*;
use std::collections::BTreeSet;

/// Three levels: Regions -> Towns -> Streets.
fn three_levels() -> DataContext {
    let mut ctx = DataContext::new(DataContextId(1), "Atlas");
    for (name, parent) in [
        ("Regions", None),
        ("Towns", Some("Regions")),
        ("Streets", Some("Towns")),
    ] {
        let result = ctx.apply_change(ChangeRequest::CreateCollection {
            name: name.to_string(),
            title: None,
            parent: parent.map(Into::into),
            attributes: vec![AttributeSpec::named(name.to_lowercase())],
            attribute_order: vec![],
        });
        assert!(result.success);
    }
    ctx
}

/// Grow a tree: `shape[i]` is the number of towns under region i, and every
/// town gets `streets` streets.
fn populate(ctx: &mut DataContext, shape: &[usize], streets: usize) -> Vec<CaseId> {
    let mut regions = Vec::new();
    for (r, towns) in shape.iter().enumerate() {
        let region = ctx
            .apply_change(ChangeRequest::CreateCase {
                collection: Some("Regions".into()),
                case: CaseSpec::root(vec![Value::from(format!("r{}", r))]),
            })
            .case_id
            .expect("region");
        regions.push(region);
        let town_ids = ctx
            .apply_change(ChangeRequest::CreateCases {
                collection: Some("Towns".into()),
                cases: (0..*towns)
                    .map(|t| CaseSpec::child(region, vec![Value::from(format!("t{}", t))]))
                    .collect(),
            })
            .case_ids;
        for town in town_ids {
            ctx.apply_change(ChangeRequest::CreateCases {
                collection: Some("Streets".into()),
                cases: (0..streets)
                    .map(|s| CaseSpec::child(town, vec![Value::from(s as i32)]))
                    .collect(),
            });
        }
    }
    regions
}

/// Every parent link is mirrored exactly once and points one level up.
fn assert_hierarchy(ctx: &DataContext) -> Result<(), TestCaseError> {
    for collection in ctx.collections() {
        for case in collection.cases() {
            prop_assert_eq!(case.collection(), collection.id());
            match case.parent() {
                Some(parent_id) => {
                    let parent = ctx.case(parent_id);
                    prop_assert!(parent.is_some(), "dangling parent {}", parent_id);
                    let parent = parent.expect("checked");
                    let links = parent.children().iter().filter(|c| **c == case.id()).count();
                    prop_assert_eq!(links, 1);
                    prop_assert_eq!(
                        ctx.child_collection(parent.collection()).map(|c| c.id()),
                        Some(collection.id())
                    );
                }
                None => prop_assert!(collection.parent_id().is_none()),
            }
            for child in case.children() {
                prop_assert!(ctx.case(*child).is_some(), "dangling child {}", child);
            }
        }
    }
    Ok(())
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    /// N non-complete changes bump the count by exactly N.
    #[test]
    fn change_count_is_monotonic(kinds in vec(0u8..4, 1..40)) {
        let mut ctx = three_levels();
        populate(&mut ctx, &[1], 1);
        let start = ctx.change_count();

        for (i, kind) in kinds.iter().enumerate() {
            let request = match kind {
                0 => ChangeRequest::CreateCase {
                    collection: Some("Regions".into()),
                    case: CaseSpec::root(vec![Value::from(i as i32)]),
                },
                1 => ChangeRequest::SelectCases {
                    cases: None,
                    select: i % 2 == 0,
                    extend: false,
                    descendants: true,
                },
                2 => ChangeRequest::DeleteCases { cases: vec![CaseId(1_000_000)] },
                _ => ChangeRequest::ResetCollections,
            };
            let before = ctx.change_count();
            ctx.apply_change(request);
            prop_assert_eq!(ctx.change_count(), before + 1);
        }

        prop_assert_eq!(ctx.change_count(), start + kinds.len() as u64);
        prop_assert_eq!(ctx.changes().len() as u64, ctx.change_count());
    }

    /// Random creation and deletion never leaves a broken hierarchy.
    #[test]
    fn hierarchy_integrity_survives_deletes(
        shape in vec(0usize..4, 1..5),
        streets in 0usize..4,
        picks in vec(any::<prop::sample::Index>(), 0..6),
    ) {
        let mut ctx = three_levels();
        populate(&mut ctx, &shape, streets);
        assert_hierarchy(&ctx)?;

        for pick in picks {
            let ids = ctx.all_case_ids();
            if ids.is_empty() {
                break;
            }
            let victim = ids[pick.index(ids.len())];
            ctx.apply_change(ChangeRequest::DeleteCases { cases: vec![victim] });
            prop_assert!(ctx.case(victim).is_none());
            assert_hierarchy(&ctx)?;
        }
    }

    /// Deleting a case removes it and exactly its K descendants.
    #[test]
    fn cascade_delete_is_complete(
        shape in vec(1usize..4, 1..4),
        streets in 0usize..4,
        pick in any::<prop::sample::Index>(),
    ) {
        let mut ctx = three_levels();
        let regions = populate(&mut ctx, &shape, streets);
        let region = regions[pick.index(regions.len())];

        let subtree: BTreeSet<CaseId> = ctx.descendants(region).into_iter().collect();
        let before = ctx.case_count();

        let result = ctx.apply_change(ChangeRequest::DeleteCases { cases: vec![region] });
        prop_assert!(result.success);
        prop_assert_eq!(result.deleted_case_ids.len(), subtree.len() + 1);
        prop_assert_eq!(ctx.case_count(), before - subtree.len() - 1);
        for id in &subtree {
            prop_assert!(ctx.case(*id).is_none());
        }
        assert_hierarchy(&ctx)?;
    }

    /// Collapsing any parent-level case and expanding it again is a no-op.
    #[test]
    fn collapse_expand_restores_rows(
        shape in vec(1usize..4, 1..4),
        streets in 1usize..4,
        pick in any::<prop::sample::Index>(),
    ) {
        let mut ctx = three_levels();
        let regions = populate(&mut ctx, &shape, streets);
        let streets_id = ctx.child_most_collection().expect("streets").id();

        let mut index = CaseTableRowIndex::new(streets_id);
        index.refresh(&ctx);
        let rows = index.rows().to_vec();
        prop_assert_eq!(rows.len(), ctx.collection(streets_id).map(|c| c.case_count()).unwrap_or(0));

        let region = regions[pick.index(regions.len())];
        let hidden = ctx.descendants(region).into_iter()
            .filter(|id| ctx.case_collection(*id) == Some(streets_id))
            .count();
        prop_assert!(index.collapse_group(&ctx, region));
        prop_assert_eq!(index.get_length(), rows.len() - hidden + 1);
        prop_assert!(index.get_row_by_id(region).is_some());

        prop_assert!(index.expand_group(&ctx, region));
        prop_assert_eq!(index.rows(), rows.as_slice());
        for (row, id) in rows.iter().enumerate() {
            prop_assert_eq!(index.get_row_by_id(*id), Some(row));
        }
    }
}

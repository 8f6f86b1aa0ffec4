//! # Case-Table Row Index
//!
//! A linear row→case mapping over one collection, as seen by a table view.
//!
//! A row is either a case of the target collection or a collapsed ancestor
//! standing in for its whole subtree. Collapse state is a view concern and
//! lives here, not on the cases.
//!
//! The index pulls from its data context: `sync` compares the context's
//! `change_count` against the count seen at the last refresh and rebuilds
//! only when it moved.

use crate::data_context::DataContext;
use crate::diagnostics::invariant_violation;
use crate::notify::{Notice, NotificationBus, SubscriptionId};
use crate::primitives::MAX_HIERARCHY_DEPTH;
use crate::{CaseId, CollectionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What the row index tells the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RowIndexEvent {
    /// The number of rows differs from the previous refresh.
    RowCountChanged { old: usize, new: usize },
}

impl Notice for RowIndexEvent {}

/// Row index for one collection of one data context.
#[derive(Debug)]
pub struct CaseTableRowIndex {
    collection: CollectionId,
    collapsed: BTreeSet<CaseId>,
    rows: Vec<CaseId>,
    row_by_id: BTreeMap<CaseId, usize>,
    suspend_depth: usize,
    refresh_pending: bool,
    synced_change_count: Option<u64>,
    events: NotificationBus<RowIndexEvent>,
}

impl CaseTableRowIndex {
    #[must_use]
    pub fn new(collection: CollectionId) -> Self {
        Self {
            collection,
            collapsed: BTreeSet::new(),
            rows: Vec::new(),
            row_by_id: BTreeMap::new(),
            suspend_depth: 0,
            refresh_pending: false,
            synced_change_count: None,
            events: NotificationBus::new(),
        }
    }

    #[must_use]
    pub fn collection(&self) -> CollectionId {
        self.collection
    }

    pub fn subscribe(
        &mut self,
        handler: impl FnMut(&RowIndexEvent) + Send + 'static,
    ) -> SubscriptionId {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    // =========================================================================
    // REFRESH
    // =========================================================================

    /// Rebuild the row mapping, or mark it pending while suspended.
    pub fn refresh(&mut self, ctx: &DataContext) {
        if self.suspend_depth > 0 {
            self.refresh_pending = true;
            return;
        }

        let chain = ctx.collection_chain_to(self.collection);
        let mut rows = Vec::new();
        if let Some(root) = chain.first().and_then(|id| ctx.collection(*id)) {
            let mut visited = BTreeSet::new();
            for case in root.case_ids() {
                self.visit(ctx, *case, 0, &chain, &mut visited, &mut rows);
            }
        }

        let old = self.rows.len();
        self.row_by_id = rows.iter().enumerate().map(|(row, id)| (*id, row)).collect();
        self.rows = rows;
        self.synced_change_count = Some(ctx.change_count());

        if old != self.rows.len() {
            self.events.post(RowIndexEvent::RowCountChanged {
                old,
                new: self.rows.len(),
            });
        }
        self.events.flush();
    }

    fn visit(
        &self,
        ctx: &DataContext,
        case: CaseId,
        level: usize,
        chain: &[CollectionId],
        visited: &mut BTreeSet<CaseId>,
        rows: &mut Vec<CaseId>,
    ) {
        if level >= MAX_HIERARCHY_DEPTH || !visited.insert(case) {
            invariant_violation(
                ctx.invariant_mode(),
                "CaseTableRowIndex::refresh",
                &format!("cycle or runaway depth at case {}", case),
            );
            return;
        }
        // Target level, or a collapsed ancestor: one row, stop descending.
        if level + 1 >= chain.len() || self.collapsed.contains(&case) {
            rows.push(case);
            return;
        }
        let Some(children) = ctx.case(case).map(|c| c.children().to_vec()) else {
            return;
        };
        for child in children {
            self.visit(ctx, child, level + 1, chain, visited, rows);
        }
    }

    /// Refresh if the context changed since the last refresh.
    ///
    /// Collapsed markers for cases that no longer exist are dropped.
    /// Returns `true` when a refresh (or a pending one) was triggered.
    pub fn sync(&mut self, ctx: &DataContext) -> bool {
        if self.synced_change_count == Some(ctx.change_count()) {
            return false;
        }
        self.collapsed.retain(|id| ctx.case(*id).is_some());
        self.refresh(ctx);
        true
    }

    // =========================================================================
    // SUSPENSION
    // =========================================================================

    /// Defer refreshes until the matching `end_update`. Nests.
    pub fn begin_update(&mut self) {
        self.suspend_depth += 1;
    }

    /// Only the outermost `end_update` performs the deferred refresh.
    pub fn end_update(&mut self, ctx: &DataContext) {
        if self.suspend_depth == 0 {
            invariant_violation(
                ctx.invariant_mode(),
                "CaseTableRowIndex::end_update",
                "end_update without begin_update",
            );
            return;
        }
        self.suspend_depth -= 1;
        if self.suspend_depth == 0 && self.refresh_pending {
            self.refresh_pending = false;
            self.refresh(ctx);
        }
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspend_depth > 0
    }

    // =========================================================================
    // ROW API
    // =========================================================================

    #[must_use]
    pub fn get_length(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn get_item(&self, row: usize) -> Option<CaseId> {
        self.rows.get(row).copied()
    }

    /// Row of a case; `None` means "not currently visible".
    #[must_use]
    pub fn get_row_by_id(&self, case: CaseId) -> Option<usize> {
        self.row_by_id.get(&case).copied()
    }

    /// Every row, top to bottom.
    #[must_use]
    pub fn rows(&self) -> &[CaseId] {
        &self.rows
    }

    // =========================================================================
    // COLLAPSE / EXPAND
    // =========================================================================

    /// Whether `case` lives in a strict ancestor of the indexed collection.
    fn is_ancestor_case(&self, ctx: &DataContext, case: CaseId) -> bool {
        let Some(collection) = ctx.case_collection(case) else {
            return false;
        };
        collection != self.collection && ctx.collection_chain_to(self.collection).contains(&collection)
    }

    /// Collapse an ancestor case into a single row. Returns `true` if the
    /// case was not already collapsed.
    pub fn collapse_group(&mut self, ctx: &DataContext, case: CaseId) -> bool {
        if !self.is_ancestor_case(ctx, case) || !self.collapsed.insert(case) {
            return false;
        }
        self.refresh(ctx);
        true
    }

    /// Expand a collapsed case. Returns `true` if it was collapsed.
    pub fn expand_group(&mut self, ctx: &DataContext, case: CaseId) -> bool {
        if !self.collapsed.remove(&case) {
            return false;
        }
        self.refresh(ctx);
        true
    }

    #[must_use]
    pub fn is_group_collapsed(&self, case: CaseId) -> bool {
        self.collapsed.contains(&case)
    }

    #[must_use]
    pub fn collapsed_cases(&self) -> &BTreeSet<CaseId> {
        &self.collapsed
    }

    /// Collapse every case of the collection directly above this one.
    ///
    /// Returns the number of newly collapsed cases. One refresh at the end.
    pub fn collapse_all(&mut self, ctx: &DataContext) -> usize {
        let Some(parent) = ctx.parent_collection(self.collection) else {
            return 0;
        };
        let parents: Vec<CaseId> = parent.case_ids().to_vec();
        self.begin_update();
        let mut count = 0;
        for case in parents {
            if self.collapse_group(ctx, case) {
                count += 1;
            }
        }
        self.end_update(ctx);
        count
    }

    /// Expand everything. Returns the number of cases expanded.
    pub fn expand_all(&mut self, ctx: &DataContext) -> usize {
        let count = self.collapsed.len();
        self.collapsed.clear();
        self.refresh(ctx);
        count
    }
}

// =============================================================================
// TESTS
// =============================================================================

//! # Cases Controller
//!
//! The ordered, observable sequence of a collection's cases together with
//! that collection's selection set.
//!
//! Selection calls take whole groups of cases so that one grouped call
//! produces one net result, not one per case.

use crate::CaseId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Display order plus selection for one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasesController {
    order: Vec<CaseId>,
    selection: BTreeSet<CaseId>,
}

impl CasesController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Case IDs in display order.
    #[must_use]
    pub fn order(&self) -> &[CaseId] {
        &self.order
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<CaseId> {
        self.order.get(index).copied()
    }

    /// Display position of a case.
    #[must_use]
    pub fn index_of(&self, case: CaseId) -> Option<usize> {
        self.order.iter().position(|c| *c == case)
    }

    /// Insert at `index` (clamped to the end). Returns the actual position.
    pub fn insert(&mut self, index: Option<usize>, case: CaseId) -> usize {
        let position = index.unwrap_or(self.order.len()).min(self.order.len());
        self.order.insert(position, case);
        position
    }

    /// Remove a case from the order and the selection.
    pub fn remove(&mut self, case: CaseId) -> bool {
        self.selection.remove(&case);
        let before = self.order.len();
        self.order.retain(|c| *c != case);
        before != self.order.len()
    }

    pub fn clear(&mut self) -> bool {
        let had_selection = !self.selection.is_empty();
        self.order.clear();
        self.selection.clear();
        had_selection
    }

    // =========================================================================
    // SELECTION
    // =========================================================================

    #[must_use]
    pub fn selection(&self) -> &BTreeSet<CaseId> {
        &self.selection
    }

    #[must_use]
    pub fn is_selected(&self, case: CaseId) -> bool {
        self.selection.contains(&case)
    }

    /// Selected cases in display order.
    #[must_use]
    pub fn selected_in_order(&self) -> Vec<CaseId> {
        self.order
            .iter()
            .copied()
            .filter(|c| self.selection.contains(c))
            .collect()
    }

    /// Select a group of cases.
    ///
    /// Without `extend`, the group replaces the current selection. Returns
    /// `true` when any case's membership flipped.
    pub fn select(&mut self, cases: &[CaseId], extend: bool) -> bool {
        let group: BTreeSet<CaseId> = cases.iter().copied().collect();
        if extend {
            let before = self.selection.len();
            self.selection.extend(group);
            return before != self.selection.len();
        }
        if self.selection == group {
            return false;
        }
        self.selection = group;
        true
    }

    /// Deselect a group of cases. Returns `true` when any membership flipped.
    pub fn deselect(&mut self, cases: &[CaseId]) -> bool {
        let mut flipped = false;
        for case in cases {
            flipped |= self.selection.remove(case);
        }
        flipped
    }

    /// Clear the selection. Returns `true` when it was not already empty.
    pub fn clear_selection(&mut self) -> bool {
        let flipped = !self.selection.is_empty();
        self.selection.clear();
        flipped
    }
}

// =============================================================================
// TESTS
// =============================================================================

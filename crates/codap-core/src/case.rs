//! # Case
//!
//! A single row of data belonging to exactly one collection.
//!
//! Parent and child links are IDs resolved through the owning
//! `DataContext`, never pointers. A case's value map always carries exactly
//! the attribute IDs of its collection; the collection keeps that in sync
//! as attributes come and go.

use crate::{AttributeId, CaseId, CollectionId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One data record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    id: CaseId,
    collection: CollectionId,
    parent: Option<CaseId>,
    children: Vec<CaseId>,
    values: BTreeMap<AttributeId, Value>,
    #[serde(skip)]
    batch_depth: u32,
    #[serde(skip)]
    batch_dirty: bool,
}

impl Case {
    /// Create a case with every value missing.
    #[must_use]
    pub fn new(
        id: CaseId,
        collection: CollectionId,
        parent: Option<CaseId>,
        attributes: impl IntoIterator<Item = AttributeId>,
    ) -> Self {
        Self {
            id,
            collection,
            parent,
            children: Vec::new(),
            values: attributes.into_iter().map(|a| (a, Value::Missing)).collect(),
            batch_depth: 0,
            batch_dirty: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> CaseId {
        self.id
    }

    #[must_use]
    pub fn collection(&self) -> CollectionId {
        self.collection
    }

    #[must_use]
    pub fn parent(&self) -> Option<CaseId> {
        self.parent
    }

    /// Child cases in display order.
    #[must_use]
    pub fn children(&self) -> &[CaseId] {
        &self.children
    }

    /// Value of one attribute. `None` when the attribute is not part of the
    /// collection.
    #[must_use]
    pub fn value(&self, attribute: AttributeId) -> Option<&Value> {
        self.values.get(&attribute)
    }

    /// All values keyed by attribute ID.
    #[must_use]
    pub fn values(&self) -> &BTreeMap<AttributeId, Value> {
        &self.values
    }

    /// Values in the given attribute order; unknown attributes read as missing.
    #[must_use]
    pub fn values_in_order(&self, order: &[AttributeId]) -> Vec<Value> {
        order
            .iter()
            .map(|a| self.values.get(a).cloned().unwrap_or_default())
            .collect()
    }

    /// Set one value. Returns `true` when the stored value actually changed.
    ///
    /// Writes to attributes that are not part of the collection are ignored.
    pub fn set_value(&mut self, attribute: AttributeId, value: Value) -> bool {
        match self.values.get_mut(&attribute) {
            Some(slot) if *slot != value => {
                *slot = value;
                if self.batch_depth > 0 {
                    self.batch_dirty = true;
                }
                true
            }
            _ => false,
        }
    }

    /// Open a value batch. Batches nest.
    pub fn begin_value_changes(&mut self) {
        self.batch_depth = self.batch_depth.saturating_add(1);
    }

    /// Close a value batch.
    ///
    /// Returns `true` when the outermost batch closed and at least one value
    /// changed inside it; that is the moment observers are told.
    pub fn end_value_changes(&mut self) -> bool {
        if self.batch_depth == 0 {
            return false;
        }
        self.batch_depth -= 1;
        if self.batch_depth == 0 {
            return std::mem::take(&mut self.batch_dirty);
        }
        false
    }

    /// Whether a value batch is open.
    #[must_use]
    pub fn in_value_batch(&self) -> bool {
        self.batch_depth > 0
    }

    pub(crate) fn insert_child(&mut self, position: usize, child: CaseId) {
        let position = position.min(self.children.len());
        self.children.insert(position, child);
    }

    pub(crate) fn remove_child(&mut self, child: CaseId) -> bool {
        let before = self.children.len();
        self.children.retain(|c| *c != child);
        before != self.children.len()
    }

    pub(crate) fn add_attribute(&mut self, attribute: AttributeId) {
        self.values.entry(attribute).or_insert(Value::Missing);
    }

    pub(crate) fn remove_attribute(&mut self, attribute: AttributeId) -> Option<Value> {
        self.values.remove(&attribute)
    }
}

// =============================================================================
// TESTS
// =============================================================================

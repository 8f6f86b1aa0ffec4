//! # Collection
//!
//! One level of a data context's linear parent→child chain: an ordered set
//! of cases sharing the same attributes.
//!
//! The collection owns its cases outright (a `BTreeMap` keyed by ID) and a
//! `CasesController` holding display order and selection. Links to the
//! neighbouring collections are IDs resolved through the data context.

use crate::attribute::{Attribute, AttributeRef, AttributeSpec};
use crate::case::Case;
use crate::cases_controller::CasesController;
use crate::{AttributeId, CaseId, CollectionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An ordered, same-schema set of cases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    id: CollectionId,
    name: String,
    title: String,
    parent: Option<CollectionId>,
    child: Option<CollectionId>,
    attributes: Vec<Attribute>,
    cases: BTreeMap<CaseId, Case>,
    controller: CasesController,
}

impl Collection {
    /// Create an empty collection.
    #[must_use]
    pub fn new(id: CollectionId, name: impl Into<String>, parent: Option<CollectionId>) -> Self {
        let name = name.into();
        Self {
            id,
            title: name.clone(),
            name,
            parent,
            child: None,
            attributes: Vec::new(),
            cases: BTreeMap::new(),
            controller: CasesController::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> CollectionId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
    }

    /// The parent collection, if this is not the root.
    #[must_use]
    pub fn parent_id(&self) -> Option<CollectionId> {
        self.parent
    }

    /// The child collection, if this is not the child-most.
    #[must_use]
    pub fn child_id(&self) -> Option<CollectionId> {
        self.child
    }

    pub(crate) fn set_child(&mut self, child: Option<CollectionId>) {
        self.child = child;
    }

    // =========================================================================
    // ATTRIBUTES
    // =========================================================================

    /// Attributes in display order.
    #[must_use]
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    #[must_use]
    pub fn attribute_ids(&self) -> Vec<AttributeId> {
        self.attributes.iter().map(|a| a.id).collect()
    }

    #[must_use]
    pub fn attribute(&self, id: AttributeId) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.id == id)
    }

    #[must_use]
    pub fn attribute_by_name(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Position of an attribute in display order.
    #[must_use]
    pub fn attribute_position(&self, id: AttributeId) -> Option<usize> {
        self.attributes.iter().position(|a| a.id == id)
    }

    /// Resolve a reference by ID or by name.
    #[must_use]
    pub fn resolve_attribute(&self, reference: &AttributeRef) -> Option<AttributeId> {
        match reference {
            AttributeRef::Id(id) => self.attribute(*id).map(|a| a.id),
            AttributeRef::Name(name) => self.attribute_by_name(name).map(|a| a.id),
        }
    }

    /// Resolve a spec: its `id` first, then its `name`.
    #[must_use]
    pub fn resolve_spec(&self, spec: &AttributeSpec) -> Option<AttributeId> {
        spec.id
            .and_then(|id| self.attribute(id))
            .or_else(|| spec.name.as_deref().and_then(|n| self.attribute_by_name(n)))
            .map(|a| a.id)
    }

    pub(crate) fn attribute_mut(&mut self, id: AttributeId) -> Option<&mut Attribute> {
        self.attributes.iter_mut().find(|a| a.id == id)
    }

    pub(crate) fn attributes_mut(&mut self) -> impl Iterator<Item = &mut Attribute> {
        self.attributes.iter_mut()
    }

    /// Add an attribute at `position` (clamped; `None` appends).
    ///
    /// Every existing case gains a missing value for it.
    pub(crate) fn add_attribute(&mut self, attribute: Attribute, position: Option<usize>) {
        let id = attribute.id;
        let position = position
            .unwrap_or(self.attributes.len())
            .min(self.attributes.len());
        self.attributes.insert(position, attribute);
        for case in self.cases.values_mut() {
            case.add_attribute(id);
        }
    }

    /// Remove an attribute and drop its key from every case.
    ///
    /// Returns the former display position and definition.
    pub(crate) fn remove_attribute(&mut self, id: AttributeId) -> Option<(usize, Attribute)> {
        let position = self.attribute_position(id)?;
        let attribute = self.attributes.remove(position);
        for case in self.cases.values_mut() {
            case.remove_attribute(id);
        }
        Some((position, attribute))
    }

    /// Reorder attributes so that `names` come first, in that order.
    ///
    /// Attributes not named keep their relative order after the named ones;
    /// unknown names are ignored.
    pub(crate) fn reorder_attributes(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        let mut remaining = std::mem::take(&mut self.attributes);
        let mut ordered = Vec::with_capacity(remaining.len());
        for name in names {
            if let Some(pos) = remaining.iter().position(|a| &a.name == name) {
                ordered.push(remaining.remove(pos));
            }
        }
        ordered.append(&mut remaining);
        self.attributes = ordered;
    }

    // =========================================================================
    // CASES
    // =========================================================================

    #[must_use]
    pub fn case(&self, id: CaseId) -> Option<&Case> {
        self.cases.get(&id)
    }

    pub(crate) fn case_mut(&mut self, id: CaseId) -> Option<&mut Case> {
        self.cases.get_mut(&id)
    }

    #[must_use]
    pub fn contains_case(&self, id: CaseId) -> bool {
        self.cases.contains_key(&id)
    }

    #[must_use]
    pub fn case_count(&self) -> usize {
        self.controller.len()
    }

    /// Case at a display position.
    #[must_use]
    pub fn case_at(&self, index: usize) -> Option<&Case> {
        self.controller.get(index).and_then(|id| self.cases.get(&id))
    }

    /// Display position of a case.
    #[must_use]
    pub fn case_index(&self, id: CaseId) -> Option<usize> {
        self.controller.index_of(id)
    }

    /// Case IDs in display order.
    #[must_use]
    pub fn case_ids(&self) -> &[CaseId] {
        self.controller.order()
    }

    /// Cases in display order.
    pub fn cases(&self) -> impl Iterator<Item = &Case> {
        self.controller
            .order()
            .iter()
            .filter_map(|id| self.cases.get(id))
    }

    /// Cases whose parent is `parent`, in display order.
    pub fn cases_with_parent(&self, parent: Option<CaseId>) -> impl Iterator<Item = &Case> {
        self.cases().filter(move |c| c.parent() == parent)
    }

    /// Insert a case at a display position. Returns the actual position.
    pub(crate) fn insert_case(&mut self, case: Case, index: Option<usize>) -> usize {
        let id = case.id();
        self.cases.insert(id, case);
        self.controller.insert(index, id)
    }

    pub(crate) fn remove_case(&mut self, id: CaseId) -> Option<Case> {
        self.controller.remove(id);
        self.cases.remove(&id)
    }

    // =========================================================================
    // SELECTION
    // =========================================================================

    #[must_use]
    pub fn cases_controller(&self) -> &CasesController {
        &self.controller
    }

    pub(crate) fn cases_controller_mut(&mut self) -> &mut CasesController {
        &mut self.controller
    }

    /// Selected cases in display order.
    #[must_use]
    pub fn selected_cases(&self) -> Vec<CaseId> {
        self.controller.selected_in_order()
    }

    /// Drop every case and attribute. Returns `true` if a selection was lost.
    pub(crate) fn clear(&mut self) -> bool {
        self.cases.clear();
        self.attributes.clear();
        self.controller.clear()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    fn people() -> Collection {
        let mut c = Collection::new(CollectionId(1), "People", None);
        c.add_attribute(Attribute::new(AttributeId(2), "name"), None);
        c.add_attribute(Attribute::new(AttributeId(3), "age"), None);
        c
    }

    #[test]
    fn new_collection_titles_after_name() {
        let c = Collection::new(CollectionId(1), "People", Some(CollectionId(0)));
        assert_eq!(c.title(), "People");
        assert_eq!(c.parent_id(), Some(CollectionId(0)));
        assert_eq!(c.child_id(), None);
    }

    #[test]
    fn adding_attribute_extends_existing_cases() {
        let mut c = people();
        let case = Case::new(CaseId(10), c.id(), None, c.attribute_ids());
        c.insert_case(case, None);

        c.add_attribute(Attribute::new(AttributeId(4), "height"), Some(1));

        assert_eq!(
            c.attribute_ids(),
            vec![AttributeId(2), AttributeId(4), AttributeId(3)]
        );
        let case = c.case(CaseId(10)).expect("case");
        assert_eq!(case.value(AttributeId(4)), Some(&Value::Missing));
        assert_eq!(case.values().len(), 3);
    }

    #[test]
    fn removing_attribute_drops_case_keys() {
        let mut c = people();
        c.insert_case(Case::new(CaseId(10), c.id(), None, c.attribute_ids()), None);

        let (position, removed) = c.remove_attribute(AttributeId(2)).expect("removed");
        assert_eq!(position, 0);
        assert_eq!(removed.name, "name");
        assert_eq!(c.case(CaseId(10)).expect("case").values().len(), 1);
        assert!(c.remove_attribute(AttributeId(2)).is_none());
    }

    #[test]
    fn reorder_puts_named_first() {
        let mut c = people();
        c.add_attribute(Attribute::new(AttributeId(4), "height"), None);
        c.reorder_attributes(&["height".to_string(), "missing".to_string()]);
        let names: Vec<_> = c.attributes().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["height", "name", "age"]);
    }

    #[test]
    fn resolve_prefers_id_then_name() {
        let c = people();
        assert_eq!(
            c.resolve_attribute(&AttributeRef::Id(AttributeId(3))),
            Some(AttributeId(3))
        );
        assert_eq!(c.resolve_attribute(&"name".into()), Some(AttributeId(2)));
        assert_eq!(c.resolve_attribute(&"nope".into()), None);

        let spec = AttributeSpec {
            id: Some(AttributeId(99)),
            name: Some("age".to_string()),
            ..AttributeSpec::default()
        };
        assert_eq!(c.resolve_spec(&spec), Some(AttributeId(3)));
    }

    #[test]
    fn case_positions_follow_display_order() {
        let mut c = people();
        let ids = c.attribute_ids();
        c.insert_case(Case::new(CaseId(10), c.id(), None, ids.clone()), None);
        c.insert_case(Case::new(CaseId(11), c.id(), None, ids), Some(0));

        assert_eq!(c.case_at(0).map(Case::id), Some(CaseId(11)));
        assert_eq!(c.case_index(CaseId(10)), Some(1));
        assert!(c.remove_case(CaseId(11)).is_some());
        assert_eq!(c.case_count(), 1);
    }
}

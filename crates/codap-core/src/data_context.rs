//! # Data Context
//!
//! The coordinating unit for one hierarchical dataset.
//!
//! A `DataContext` owns its collections in strict parent→child order and is
//! the single entry point for mutating them: every change goes through
//! `apply_change`, which dispatches by operation, appends a `ChangeRecord`
//! to the log and bumps `change_count` by exactly one.
//!
//! ## Arena Model
//!
//! Cases live inside their collection's table. The context keeps a
//! `case_index` (case → collection) so that parent/child IDs resolve in
//! `O(log n)` without pointers between cases.
//!
//! ## Notification Timing
//!
//! Handlers only `post` to the notification bus. Observers hear about a
//! change when the owner calls `flush_notifications()` at the end of the
//! turn, by which time every mutation of the operation is in place.

use crate::attribute::{Attribute, AttributeRef, AttributeSpec};
use crate::case::Case;
use crate::change::{
    CaseSpec, CaseValues, Change, ChangeRecord, ChangeRequest, ChangeResult, CollectionRef,
    Operation,
};
use crate::collection::Collection;
use crate::diagnostics::{InvariantMode, invariant_violation};
use crate::notify::{Notification, NotificationBus, SubscriptionId};
use crate::primitives::{MAX_HIERARCHY_DEPTH, MAX_NAME_LENGTH};
use crate::{AttributeId, CaseId, CodapError, CollectionId, DataContextId, IdAllocator, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Owner of one hierarchical dataset.
#[derive(Debug)]
pub struct DataContext {
    id: DataContextId,
    name: String,
    title: String,
    ids: IdAllocator,
    /// Parent-most first, child-most last.
    collections: Vec<Collection>,
    case_index: BTreeMap<CaseId, CollectionId>,
    changes: Vec<ChangeRecord>,
    change_count: u64,
    selection_change_count: u64,
    bus: NotificationBus<Notification>,
    dirty: bool,
    destroyed: bool,
    invariant_mode: InvariantMode,
}

impl DataContext {
    /// Create an empty, alive data context.
    #[must_use]
    pub fn new(id: DataContextId, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id,
            title: name.clone(),
            name,
            ids: IdAllocator::new(),
            collections: Vec::new(),
            case_index: BTreeMap::new(),
            changes: Vec::new(),
            change_count: 0,
            selection_change_count: 0,
            bus: NotificationBus::new(),
            dirty: false,
            destroyed: false,
            invariant_mode: InvariantMode::default(),
        }
    }

    #[must_use]
    pub fn id(&self) -> DataContextId {
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

    #[must_use]
    pub fn invariant_mode(&self) -> InvariantMode {
        self.invariant_mode
    }

    pub fn set_invariant_mode(&mut self, mode: InvariantMode) {
        self.invariant_mode = mode;
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// The next raw ID the allocator would hand out.
    #[must_use]
    pub fn next_id(&self) -> u64 {
        self.ids.peek()
    }

    // =========================================================================
    // READ API: COLLECTIONS
    // =========================================================================

    /// Collections, parent-most first.
    #[must_use]
    pub fn collections(&self) -> &[Collection] {
        &self.collections
    }

    #[must_use]
    pub fn collection(&self, id: CollectionId) -> Option<&Collection> {
        self.collections.iter().find(|c| c.id() == id)
    }

    #[must_use]
    pub fn collection_by_name(&self, name: &str) -> Option<&Collection> {
        self.collections.iter().find(|c| c.name() == name)
    }

    #[must_use]
    pub fn resolve_collection(&self, reference: &CollectionRef) -> Option<CollectionId> {
        match reference {
            CollectionRef::Id(id) => self.collection(*id).map(Collection::id),
            CollectionRef::Name(name) => self.collection_by_name(name).map(Collection::id),
        }
    }

    #[must_use]
    pub fn root_collection(&self) -> Option<&Collection> {
        self.collections.first()
    }

    #[must_use]
    pub fn child_most_collection(&self) -> Option<&Collection> {
        self.collections.last()
    }

    #[must_use]
    pub fn parent_collection(&self, id: CollectionId) -> Option<&Collection> {
        self.collection(id)?
            .parent_id()
            .and_then(|p| self.collection(p))
    }

    #[must_use]
    pub fn child_collection(&self, id: CollectionId) -> Option<&Collection> {
        self.collection(id)?
            .child_id()
            .and_then(|c| self.collection(c))
    }

    /// Collection IDs from the root down to `target`, inclusive.
    ///
    /// Empty when `target` is not part of this context.
    #[must_use]
    pub fn collection_chain_to(&self, target: CollectionId) -> Vec<CollectionId> {
        match self.collections.iter().position(|c| c.id() == target) {
            Some(pos) => self.collections[..=pos].iter().map(Collection::id).collect(),
            None => Vec::new(),
        }
    }

    fn collection_mut(&mut self, id: CollectionId) -> Option<&mut Collection> {
        self.collections.iter_mut().find(|c| c.id() == id)
    }

    // =========================================================================
    // READ API: CASES & ATTRIBUTES
    // =========================================================================

    #[must_use]
    pub fn case(&self, id: CaseId) -> Option<&Case> {
        let collection = self.case_index.get(&id)?;
        self.collection(*collection)?.case(id)
    }

    fn case_mut(&mut self, id: CaseId) -> Option<&mut Case> {
        let collection = *self.case_index.get(&id)?;
        self.collection_mut(collection)?.case_mut(id)
    }

    /// The collection that owns a case.
    #[must_use]
    pub fn case_collection(&self, id: CaseId) -> Option<CollectionId> {
        self.case_index.get(&id).copied()
    }

    /// Total number of cases across all collections.
    #[must_use]
    pub fn case_count(&self) -> usize {
        self.case_index.len()
    }

    /// Every case ID, collection by collection, in display order.
    #[must_use]
    pub fn all_case_ids(&self) -> Vec<CaseId> {
        self.collections
            .iter()
            .flat_map(|c| c.case_ids().iter().copied())
            .collect()
    }

    #[must_use]
    pub fn attribute(&self, id: AttributeId) -> Option<&Attribute> {
        self.collections.iter().find_map(|c| c.attribute(id))
    }

    /// The collection that owns an attribute.
    #[must_use]
    pub fn attribute_collection(&self, id: AttributeId) -> Option<CollectionId> {
        self.collections
            .iter()
            .find(|c| c.attribute(id).is_some())
            .map(Collection::id)
    }

    /// First attribute with `name`, searching parent-most first.
    #[must_use]
    pub fn attribute_by_name(&self, name: &str) -> Option<&Attribute> {
        self.collections
            .iter()
            .find_map(|c| c.attribute_by_name(name))
    }

    /// A case's values keyed by attribute name.
    #[must_use]
    pub fn case_values_by_name(&self, id: CaseId) -> Option<BTreeMap<String, Value>> {
        let collection = self.collection(self.case_collection(id)?)?;
        let case = collection.case(id)?;
        Some(
            collection
                .attributes()
                .iter()
                .map(|a| (a.name.clone(), case.value(a.id).cloned().unwrap_or_default()))
                .collect(),
        )
    }

    /// Every descendant of `id` in pre-order (parents before children).
    ///
    /// Bounded by `MAX_HIERARCHY_DEPTH` and a visited set.
    #[must_use]
    pub fn descendants(&self, id: CaseId) -> Vec<CaseId> {
        let mut out = Vec::new();
        let mut visited = BTreeSet::from([id]);
        self.collect_descendants(id, 0, &mut visited, &mut out);
        out
    }

    fn collect_descendants(
        &self,
        id: CaseId,
        depth: usize,
        visited: &mut BTreeSet<CaseId>,
        out: &mut Vec<CaseId>,
    ) {
        if depth >= MAX_HIERARCHY_DEPTH {
            invariant_violation(
                self.invariant_mode,
                "DataContext::descendants",
                &format!("case hierarchy deeper than {} at {}", MAX_HIERARCHY_DEPTH, id),
            );
            return;
        }
        let Some(case) = self.case(id) else {
            return;
        };
        for child in case.children() {
            if !visited.insert(*child) {
                invariant_violation(
                    self.invariant_mode,
                    "DataContext::descendants",
                    &format!("cycle through case {}", child),
                );
                continue;
            }
            out.push(*child);
            self.collect_descendants(*child, depth + 1, visited, out);
        }
    }

    // =========================================================================
    // READ API: SELECTION
    // =========================================================================

    #[must_use]
    pub fn selection(&self, collection: CollectionId) -> Option<&BTreeSet<CaseId>> {
        self.collection(collection)
            .map(|c| c.cases_controller().selection())
    }

    #[must_use]
    pub fn is_selected(&self, case: CaseId) -> bool {
        self.case_collection(case)
            .and_then(|c| self.collection(c))
            .is_some_and(|c| c.cases_controller().is_selected(case))
    }

    // =========================================================================
    // CHANGE-NOTIFICATION API
    // =========================================================================

    /// Number of changes applied so far; a cache-validity token.
    #[must_use]
    pub fn change_count(&self) -> u64 {
        self.change_count
    }

    /// Number of net-effective selection changes so far.
    #[must_use]
    pub fn selection_change_count(&self) -> u64 {
        self.selection_change_count
    }

    /// The full change log.
    #[must_use]
    pub fn changes(&self) -> &[ChangeRecord] {
        &self.changes
    }

    #[must_use]
    pub fn last_change(&self) -> Option<&ChangeRecord> {
        self.changes.last()
    }

    /// Changes applied after an observer last saw `since`.
    #[must_use]
    pub fn new_changes(&self, since: u64) -> &[ChangeRecord] {
        let start = (since as usize).min(self.changes.len());
        &self.changes[start..]
    }

    pub fn subscribe(
        &mut self,
        handler: impl FnMut(&Notification) + Send + 'static,
    ) -> SubscriptionId {
        self.bus.subscribe(handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Notices posted during this turn and not yet delivered.
    #[must_use]
    pub fn pending_notifications(&self) -> &[Notification] {
        self.bus.pending()
    }

    /// End of turn: deliver queued notices. Returns how many were delivered.
    pub fn flush_notifications(&mut self) -> usize {
        self.bus.flush()
    }

    /// Whether persisted state changed since the last call; resets the flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Tear down every collection and case and drop every observer.
    ///
    /// Observers receive `ContextDestroyed` before they are dropped.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        tracing::debug!(context = %self.id, "destroying data context");
        for collection in &mut self.collections {
            collection.clear();
        }
        self.collections.clear();
        self.case_index.clear();
        self.destroyed = true;
        self.bus
            .post(Notification::ContextDestroyed { context: self.id });
        self.bus.flush();
        self.bus.clear();
    }

    // =========================================================================
    // MUTATION ENTRY POINT
    // =========================================================================

    /// Apply one change. The only way to mutate a data context.
    pub fn apply_change(&mut self, change: impl Into<Change>) -> ChangeResult {
        let change = change.into();
        if self.destroyed {
            invariant_violation(
                self.invariant_mode,
                "DataContext::apply_change",
                &format!("{} applied to destroyed context {}", change.operation(), self.id),
            );
            return ChangeResult::failure(CodapError::ContextDestroyed(self.id).to_string());
        }

        let (result, operation) = if change.is_complete {
            (ChangeResult::success(), change.operation())
        } else {
            self.perform_change(&change.request)
        };

        self.change_count += 1;
        tracing::debug!(
            context = %self.id,
            operation = %operation,
            success = result.success,
            change_count = self.change_count,
            "applied change"
        );
        self.changes.push(ChangeRecord {
            sequence: self.change_count,
            operation,
            is_complete: change.is_complete,
            request: change.request,
            result: result.clone(),
        });

        if result.success && operation.dirties_document() {
            self.dirty = true;
            self.bus
                .post(Notification::DocumentDirtied { context: self.id });
        }
        self.bus.post(Notification::ChangeCountChanged {
            context: self.id,
            change_count: self.change_count,
        });
        result
    }

    fn perform_change(&mut self, request: &ChangeRequest) -> (ChangeResult, Operation) {
        let requested = request.operation();
        let result = match request {
            ChangeRequest::CreateCollection {
                name,
                title,
                parent,
                attributes,
                attribute_order,
            } => self.do_create_collection(
                name,
                title.as_deref(),
                parent.as_ref(),
                attributes,
                attribute_order,
            ),
            ChangeRequest::CreateCase { collection, case } => {
                self.do_create_cases(collection.as_ref(), std::slice::from_ref(case))
            }
            ChangeRequest::CreateCases { collection, cases } => {
                self.do_create_cases(collection.as_ref(), cases)
            }
            ChangeRequest::UpdateCases {
                cases,
                values,
                attribute_ids,
                ..
            } => self.do_update_cases(cases, values, attribute_ids.as_deref()),
            ChangeRequest::DeleteCases { cases } => self.do_delete_cases(cases),
            ChangeRequest::SelectCases {
                cases,
                select,
                extend,
                descendants,
            } => self.do_select_cases(cases.as_deref(), *select, *extend, *descendants),
            ChangeRequest::CreateAttributes {
                collection,
                attributes,
                position,
            } => {
                let result = self.do_create_attributes(collection, attributes, *position);
                // The log records what happened, not what was asked for.
                if !result.did_create_attribute {
                    return (result, Operation::UpdateAttributes);
                }
                result
            }
            ChangeRequest::UpdateAttributes {
                collection,
                attributes,
            } => self.do_update_attributes(collection, attributes),
            ChangeRequest::DeleteAttributes {
                collection,
                attributes,
            } => self.do_delete_attributes(collection, attributes),
            ChangeRequest::ResetCollections => self.do_reset_collections(),
        };
        (result, requested)
    }

    // =========================================================================
    // createCollection
    // =========================================================================

    fn do_create_collection(
        &mut self,
        name: &str,
        title: Option<&str>,
        parent: Option<&CollectionRef>,
        attributes: &[AttributeSpec],
        attribute_order: &[String],
    ) -> ChangeResult {
        if name.is_empty() || name.len() > MAX_NAME_LENGTH {
            tracing::warn!(context = %self.id, "createCollection: invalid name {:?}", name);
            return ChangeResult::failure(format!("invalid collection name {:?}", name));
        }

        // Find-or-create: an existing collection only gains missing attributes.
        if let Some(existing) = self.collection_by_name(name).map(Collection::id) {
            let mut attr_ids = Vec::new();
            for spec in attributes {
                if let Some(id) = self.add_attribute_from_spec(existing, spec, None) {
                    attr_ids.push(id);
                }
            }
            if let Some(collection) = self.collection_mut(existing) {
                collection.reorder_attributes(attribute_order);
                attr_ids = collection.attribute_ids();
            }
            return ChangeResult {
                success: true,
                collection_id: Some(existing),
                attr_ids,
                ..ChangeResult::default()
            };
        }

        // The chain is linear: a new collection always hangs below the
        // current child-most one.
        let child_most = self.child_most_collection().map(Collection::id);
        let parent_id = match parent {
            Some(reference) => match self.resolve_collection(reference) {
                Some(id) if Some(id) == child_most => Some(id),
                Some(_) => {
                    tracing::warn!(
                        context = %self.id,
                        "createCollection: parent {} is not the child-most collection",
                        reference
                    );
                    return ChangeResult::failure(format!(
                        "parent collection {} already has a child",
                        reference
                    ));
                }
                None => {
                    return ChangeResult::failure(
                        CodapError::CollectionNotFound(reference.to_string()).to_string(),
                    );
                }
            },
            None => child_most,
        };

        let id = self.ids.collection_id();
        let mut collection = Collection::new(id, name, parent_id);
        if let Some(title) = title {
            collection.set_title(title);
        }

        // Inherited definitions are copies with their own IDs.
        if let Some(parent_id) = parent_id {
            let inherited: Vec<Attribute> = self
                .collection(parent_id)
                .map(|p| p.attributes().to_vec())
                .unwrap_or_default();
            for attribute in inherited {
                let copy = attribute.copy_with_id(self.ids.attribute_id());
                collection.add_attribute(copy, None);
            }
        }
        self.collections.push(collection);
        if let Some(parent_id) = parent_id {
            if let Some(parent) = self.collection_mut(parent_id) {
                parent.set_child(Some(id));
            }
        }

        for spec in attributes {
            self.add_attribute_from_spec(id, spec, None);
        }
        let attr_ids = match self.collection_mut(id) {
            Some(collection) => {
                collection.reorder_attributes(attribute_order);
                collection.attribute_ids()
            }
            None => Vec::new(),
        };

        self.bus.post(Notification::CollectionChanged {
            context: self.id,
            collection: id,
        });
        ChangeResult {
            success: true,
            collection_id: Some(id),
            attr_ids,
            ..ChangeResult::default()
        }
    }

    /// Add (or update in place, when the name already exists) one attribute.
    fn add_attribute_from_spec(
        &mut self,
        collection: CollectionId,
        spec: &AttributeSpec,
        position: Option<usize>,
    ) -> Option<AttributeId> {
        let existing = self.collection(collection)?.resolve_spec(spec);
        if let Some(id) = existing {
            self.collection_mut(collection)?
                .attribute_mut(id)?
                .apply_spec(spec);
            return Some(id);
        }
        let name = spec.name.as_deref().unwrap_or_default();
        if name.is_empty() || name.len() > MAX_NAME_LENGTH {
            tracing::warn!(context = %self.id, "attribute spec without a valid name skipped");
            return None;
        }
        let id = self.ids.attribute_id();
        self.collection_mut(collection)?
            .add_attribute(Attribute::from_spec(id, spec), position);
        Some(id)
    }

    // =========================================================================
    // createCase / createCases
    // =========================================================================

    fn do_create_cases(
        &mut self,
        collection: Option<&CollectionRef>,
        specs: &[CaseSpec],
    ) -> ChangeResult {
        let target = match collection {
            Some(reference) => self.resolve_collection(reference),
            None => self.child_most_collection().map(Collection::id),
        };
        let Some(target) = target else {
            let what = collection.map_or_else(|| "<child-most>".to_string(), ToString::to_string);
            tracing::warn!(context = %self.id, "createCases: unknown collection {}", what);
            return ChangeResult::failure(CodapError::CollectionNotFound(what).to_string());
        };

        let mut created = Vec::with_capacity(specs.len());
        for spec in specs {
            match self.create_one_case(target, spec) {
                Ok(id) => created.push(id),
                Err(e) => {
                    tracing::warn!(context = %self.id, collection = %target, "createCases: skipped case: {}", e);
                }
            }
        }

        if created.is_empty() {
            return ChangeResult::failure("no cases created");
        }
        self.bus.post(Notification::CollectionChanged {
            context: self.id,
            collection: target,
        });
        ChangeResult {
            success: true,
            case_id: created.first().copied(),
            case_ids: created,
            collection_id: Some(target),
            ..ChangeResult::default()
        }
    }

    fn create_one_case(&mut self, target: CollectionId, spec: &CaseSpec) -> Result<CaseId, CodapError> {
        let collection = self
            .collection(target)
            .ok_or_else(|| CodapError::CollectionNotFound(target.to_string()))?;
        let parent_collection = collection.parent_id();

        // Parent must be a live case of exactly the parent collection.
        match (parent_collection, spec.parent) {
            (Some(expected), Some(parent)) => {
                if self.case_index.get(&parent) != Some(&expected) {
                    return Err(CodapError::InvalidParent(Some(parent)));
                }
            }
            (Some(_), None) => return Err(CodapError::InvalidParent(None)),
            (None, Some(parent)) => return Err(CodapError::InvalidParent(Some(parent))),
            (None, None) => {}
        }

        let assignments = self.initial_values(target, spec);
        let attribute_ids = collection.attribute_ids();

        let id = self.ids.case_id();
        let mut case = Case::new(id, target, spec.parent, attribute_ids);
        for (attribute, value) in assignments {
            case.set_value(attribute, value);
        }

        let Some(collection) = self.collection_mut(target) else {
            return Err(CodapError::CollectionNotFound(target.to_string()));
        };
        let position = collection.insert_case(case, spec.index);
        self.case_index.insert(id, target);

        if let Some(parent) = spec.parent {
            // Siblings stay in display order.
            let sibling_position = match (self.case(parent), self.collection(target)) {
                (Some(p), Some(c)) => p
                    .children()
                    .iter()
                    .filter(|sib| c.case_index(**sib).is_some_and(|i| i < position))
                    .count(),
                _ => 0,
            };
            if let Some(p) = self.case_mut(parent) {
                p.insert_child(sibling_position, id);
            }
        }
        Ok(id)
    }

    /// Work out the initial value of every attribute for a new case.
    ///
    /// Attributes that share a name with an attribute of the parent
    /// collection are inherited copies and take the parent case's value. The
    /// remaining attributes take the supplied values: positionally, or by
    /// name. When the inherited copies lead the attribute list (the layout
    /// `createCollection` produces), positional assignment is exactly "the
    /// parent's values followed by the supplied values".
    fn initial_values(&self, target: CollectionId, spec: &CaseSpec) -> Vec<(AttributeId, Value)> {
        let Some(collection) = self.collection(target) else {
            return Vec::new();
        };
        let parent_values: BTreeMap<String, Value> = spec
            .parent
            .and_then(|p| self.case_values_by_name(p))
            .unwrap_or_default();

        let mut assignments = Vec::new();
        let mut own = Vec::new();
        for attribute in collection.attributes() {
            match parent_values.get(&attribute.name) {
                Some(value) => assignments.push((attribute.id, value.clone())),
                None => own.push(attribute),
            }
        }

        match &spec.values {
            CaseValues::Positional(values) => {
                assignments.extend(own.iter().map(|a| a.id).zip(values.iter().cloned()));
            }
            CaseValues::Named(values) => {
                for attribute in collection.attributes() {
                    if let Some(value) = values.get(&attribute.name) {
                        assignments.push((attribute.id, value.clone()));
                    }
                }
            }
        }
        assignments
    }

    // =========================================================================
    // updateCases
    // =========================================================================

    fn do_update_cases(
        &mut self,
        cases: &[CaseId],
        values: &[Vec<Value>],
        attribute_ids: Option<&[AttributeId]>,
    ) -> ChangeResult {
        let mut updated = Vec::new();
        for (case_index, case_id) in cases.iter().enumerate() {
            let Some(collection) = self.case_collection(*case_id).and_then(|c| self.collection(c))
            else {
                tracing::warn!(context = %self.id, "updateCases: unknown case {}", case_id);
                continue;
            };

            let pairs: Vec<(AttributeId, Value)> = match attribute_ids {
                // Full positional vector per case.
                None => match values.get(case_index) {
                    Some(row) => collection
                        .attribute_ids()
                        .into_iter()
                        .zip(row.iter().cloned())
                        .collect(),
                    None => {
                        tracing::warn!(context = %self.id, "updateCases: no values for case {}", case_id);
                        continue;
                    }
                },
                // Attribute-major: values[attribute][case].
                Some(attrs) => attrs
                    .iter()
                    .enumerate()
                    .filter(|(_, a)| collection.attribute(**a).is_some())
                    .filter_map(|(ai, a)| {
                        values
                            .get(ai)
                            .and_then(|column| column.get(case_index))
                            .map(|v| (*a, v.clone()))
                    })
                    .collect(),
            };

            if pairs.is_empty() {
                tracing::warn!(context = %self.id, "updateCases: nothing to write for case {}", case_id);
                continue;
            }
            if self.write_case_values(*case_id, &pairs, 0) {
                updated.push(*case_id);
            }
        }

        if updated.is_empty() {
            return ChangeResult::failure("no cases updated");
        }
        ChangeResult {
            success: true,
            case_ids: updated,
            ..ChangeResult::default()
        }
    }

    /// Write values inside one value batch, then push same-named attribute
    /// values down to the case's children.
    ///
    /// Returns `false` only when the case does not exist.
    fn write_case_values(
        &mut self,
        case_id: CaseId,
        pairs: &[(AttributeId, Value)],
        depth: usize,
    ) -> bool {
        let Some(collection_id) = self.case_collection(case_id) else {
            return false;
        };
        let context = self.id;
        let Some(collection) = self.collection_mut(collection_id) else {
            return false;
        };
        let named: Vec<(AttributeId, String, Value)> = pairs
            .iter()
            .filter_map(|(a, v)| {
                collection
                    .attribute(*a)
                    .map(|attr| (*a, attr.name.clone(), v.clone()))
            })
            .collect();
        let child_collection = collection.child_id();
        let Some(case) = collection.case_mut(case_id) else {
            return false;
        };

        case.begin_value_changes();
        for (attribute, _, value) in &named {
            case.set_value(*attribute, value.clone());
        }
        let changed = case.end_value_changes();
        let children = case.children().to_vec();

        if changed {
            self.bus.post(Notification::CaseValuesChanged {
                context,
                case: case_id,
            });
        }

        let Some(child_collection) = child_collection else {
            return true;
        };
        if children.is_empty() || depth + 1 >= MAX_HIERARCHY_DEPTH {
            return true;
        }
        let child_pairs: Vec<(AttributeId, Value)> = match self.collection(child_collection) {
            Some(child) => named
                .iter()
                .filter_map(|(_, name, value)| {
                    child.attribute_by_name(name).map(|a| (a.id, value.clone()))
                })
                .collect(),
            None => Vec::new(),
        };
        if !child_pairs.is_empty() {
            for child in children {
                self.write_case_values(child, &child_pairs, depth + 1);
            }
        }
        true
    }

    // =========================================================================
    // deleteCases
    // =========================================================================

    fn do_delete_cases(&mut self, cases: &[CaseId]) -> ChangeResult {
        let mut deleted = Vec::new();
        let mut roots = Vec::new();
        let mut affected = BTreeSet::new();
        let mut selection_flipped = false;

        for id in cases {
            if !self.case_index.contains_key(id) {
                tracing::warn!(context = %self.id, "deleteCases: unknown case {}", id);
                continue;
            }
            let mut visited = BTreeSet::new();
            self.delete_subtree(
                *id,
                0,
                &mut visited,
                &mut deleted,
                &mut affected,
                &mut selection_flipped,
            );
            roots.push(*id);
        }

        if roots.is_empty() {
            return ChangeResult::failure("no cases deleted");
        }
        for collection in affected {
            self.bus.post(Notification::CollectionChanged {
                context: self.id,
                collection,
            });
        }
        if selection_flipped {
            self.bump_selection_count();
        }
        ChangeResult {
            success: true,
            case_id: roots.first().copied(),
            case_ids: roots,
            deleted_case_ids: deleted,
            ..ChangeResult::default()
        }
    }

    /// Children first, then the case itself, so no list is mutated while a
    /// caller is still walking it.
    fn delete_subtree(
        &mut self,
        id: CaseId,
        depth: usize,
        visited: &mut BTreeSet<CaseId>,
        deleted: &mut Vec<CaseId>,
        affected: &mut BTreeSet<CollectionId>,
        selection_flipped: &mut bool,
    ) {
        if depth >= MAX_HIERARCHY_DEPTH || !visited.insert(id) {
            invariant_violation(
                self.invariant_mode,
                "DataContext::delete_subtree",
                &format!("cycle or runaway depth at case {}", id),
            );
            return;
        }
        let children = self
            .case(id)
            .map(|c| c.children().to_vec())
            .unwrap_or_default();
        for child in children {
            self.delete_subtree(child, depth + 1, visited, deleted, affected, selection_flipped);
        }

        let Some(collection_id) = self.case_index.remove(&id) else {
            return;
        };
        let Some(collection) = self.collection_mut(collection_id) else {
            return;
        };
        *selection_flipped |= collection.cases_controller().is_selected(id);
        let Some(case) = collection.remove_case(id) else {
            return;
        };
        if let Some(parent) = case.parent() {
            if let Some(p) = self.case_mut(parent) {
                p.remove_child(id);
            }
        }
        deleted.push(id);
        affected.insert(collection_id);
    }

    // =========================================================================
    // selectCases
    // =========================================================================

    fn do_select_cases(
        &mut self,
        cases: Option<&[CaseId]>,
        select: bool,
        extend: bool,
        descendants: bool,
    ) -> ChangeResult {
        let targets: Vec<CaseId> = match cases {
            Some(cases) => cases.to_vec(),
            None => self.all_case_ids(),
        };

        // One group per owning collection, in first-touch order.
        let mut groups: Vec<(CollectionId, Vec<CaseId>)> = Vec::new();
        let mut resolved = 0usize;
        for id in &targets {
            let Some(collection) = self.case_collection(*id) else {
                tracing::warn!(context = %self.id, "selectCases: unknown case {}", id);
                continue;
            };
            resolved += 1;
            let mut members = vec![(collection, *id)];
            if descendants {
                members.extend(
                    self.descendants(*id)
                        .into_iter()
                        .filter_map(|d| self.case_collection(d).map(|c| (c, d))),
                );
            }
            for (collection, case) in members {
                match groups.iter_mut().find(|(c, _)| *c == collection) {
                    Some((_, group)) => group.push(case),
                    None => groups.push((collection, vec![case])),
                }
            }
        }

        if resolved == 0 && !targets.is_empty() {
            return ChangeResult::failure("no known cases to select");
        }

        // Each collection gets exactly one grouped call: the caller's
        // `extend` governs that first touch, and everything else bound for
        // the same collection rides along in it instead of replacing it.
        let mut flipped = false;
        let mut touched = BTreeSet::new();
        for (collection_id, group) in &groups {
            touched.insert(*collection_id);
            if let Some(collection) = self.collection_mut(*collection_id) {
                let controller = collection.cases_controller_mut();
                flipped |= if select {
                    controller.select(group, extend)
                } else {
                    controller.deselect(group)
                };
            }
        }

        // Without `extend`, every collection the call did not reach is
        // cleared, for selection and deselection alike.
        if !extend {
            for collection in &mut self.collections {
                if !touched.contains(&collection.id()) {
                    flipped |= collection.cases_controller_mut().clear_selection();
                }
            }
        }

        if flipped {
            self.bump_selection_count();
        }
        ChangeResult {
            success: true,
            case_ids: targets,
            selection_changed: flipped,
            ..ChangeResult::default()
        }
    }

    fn bump_selection_count(&mut self) {
        self.selection_change_count += 1;
        self.bus.post(Notification::SelectionCountChanged {
            context: self.id,
            selection_change_count: self.selection_change_count,
        });
    }

    // =========================================================================
    // createAttributes / updateAttributes / deleteAttributes
    // =========================================================================

    fn do_create_attributes(
        &mut self,
        collection: &CollectionRef,
        specs: &[AttributeSpec],
        position: Option<usize>,
    ) -> ChangeResult {
        let Some(collection_id) = self.resolve_collection(collection) else {
            return ChangeResult::failure(
                CodapError::CollectionNotFound(collection.to_string()).to_string(),
            );
        };

        let mut attr_ids = Vec::new();
        let mut created = false;
        let mut created_names = Vec::new();
        let mut new_count = 0usize;
        for spec in specs {
            let existing = self
                .collection(collection_id)
                .and_then(|c| c.resolve_spec(spec));
            match existing {
                Some(id) => {
                    if self.update_attribute(collection_id, id, spec) {
                        attr_ids.push(id);
                    }
                }
                None => {
                    let at = position.map(|p| p + new_count);
                    if let Some(id) = self.add_attribute_from_spec(collection_id, spec, at) {
                        created = true;
                        new_count += 1;
                        attr_ids.push(id);
                        if let Some(attribute) = self.attribute(id) {
                            created_names.push(attribute.name.clone());
                        }
                    }
                }
            }
        }

        if attr_ids.is_empty() {
            return ChangeResult::failure("no attributes created");
        }
        if created {
            self.resolve_formula_errors(&created_names);
            self.bus.post(Notification::CollectionChanged {
                context: self.id,
                collection: collection_id,
            });
        }
        ChangeResult {
            success: true,
            collection_id: Some(collection_id),
            attr_ids,
            did_create_attribute: created,
            ..ChangeResult::default()
        }
    }

    fn do_update_attributes(
        &mut self,
        collection: &CollectionRef,
        specs: &[AttributeSpec],
    ) -> ChangeResult {
        let Some(collection_id) = self.resolve_collection(collection) else {
            return ChangeResult::failure(
                CodapError::CollectionNotFound(collection.to_string()).to_string(),
            );
        };

        let mut attr_ids = Vec::new();
        for spec in specs {
            let existing = self
                .collection(collection_id)
                .and_then(|c| c.resolve_spec(spec));
            match existing {
                Some(id) => {
                    if self.update_attribute(collection_id, id, spec) {
                        attr_ids.push(id);
                    }
                }
                None => {
                    tracing::warn!(context = %self.id, "updateAttributes: unknown attribute {:?}", spec.name);
                }
            }
        }

        if attr_ids.is_empty() {
            return ChangeResult::failure("no attributes updated");
        }
        ChangeResult {
            success: true,
            collection_id: Some(collection_id),
            attr_ids,
            ..ChangeResult::default()
        }
    }

    /// Clear formula errors raised for a deleted attribute that `names` now
    /// provides again.
    fn resolve_formula_errors(&mut self, names: &[String]) {
        let mut resolved = 0usize;
        for collection in &mut self.collections {
            for attribute in collection.attributes_mut() {
                let restored = attribute.formula_error.as_deref().is_some_and(|error| {
                    names
                        .iter()
                        .any(|n| error == deleted_reference_error(n))
                });
                if restored {
                    attribute.formula_error = None;
                    resolved += 1;
                }
            }
        }
        if resolved > 0 {
            tracing::debug!(context = %self.id, resolved, "formula references restored");
        }
    }

    /// Apply a spec to an existing attribute, refusing renames that would
    /// collide with a sibling.
    fn update_attribute(
        &mut self,
        collection_id: CollectionId,
        id: AttributeId,
        spec: &AttributeSpec,
    ) -> bool {
        let Some(collection) = self.collection_mut(collection_id) else {
            return false;
        };
        if let Some(name) = &spec.name {
            if name.is_empty() || name.len() > MAX_NAME_LENGTH {
                tracing::warn!("attribute rename to {:?} rejected: invalid name", name);
                return false;
            }
            if collection
                .attribute_by_name(name)
                .is_some_and(|other| other.id != id)
            {
                tracing::warn!("attribute rename to {:?} rejected: name in use", name);
                return false;
            }
        }
        let mut spec = spec.clone();
        spec.id = None;
        match collection.attribute_mut(id) {
            Some(attribute) => {
                attribute.apply_spec(&spec);
                true
            }
            None => false,
        }
    }

    fn do_delete_attributes(
        &mut self,
        collection: &CollectionRef,
        attributes: &[AttributeRef],
    ) -> ChangeResult {
        let Some(collection_id) = self.resolve_collection(collection) else {
            return ChangeResult::failure(
                CodapError::CollectionNotFound(collection.to_string()).to_string(),
            );
        };

        let mut removed_ids = Vec::new();
        let mut removed_names = Vec::new();
        for reference in attributes {
            let resolved = self
                .collection(collection_id)
                .and_then(|c| c.resolve_attribute(reference));
            let Some(id) = resolved else {
                tracing::warn!(context = %self.id, "deleteAttributes: unknown attribute {:?}", reference);
                continue;
            };
            if let Some((_, attribute)) = self
                .collection_mut(collection_id)
                .and_then(|c| c.remove_attribute(id))
            {
                removed_ids.push(id);
                removed_names.push(attribute.name);
            }
        }

        if removed_ids.is_empty() {
            return ChangeResult::failure("no attributes deleted");
        }

        // Formulas that named a deleted attribute can no longer evaluate.
        let mut invalidated = Vec::new();
        for collection in &mut self.collections {
            for attribute in collection.attributes_mut() {
                if let Some(name) = removed_names
                    .iter()
                    .find(|n| attribute.formula_references(n))
                {
                    attribute.formula_error = Some(deleted_reference_error(name));
                    invalidated.push(attribute.id);
                }
            }
        }

        self.bus.post(Notification::CollectionChanged {
            context: self.id,
            collection: collection_id,
        });
        ChangeResult {
            success: true,
            collection_id: Some(collection_id),
            attr_ids: removed_ids,
            invalidated_attr_ids: invalidated,
            ..ChangeResult::default()
        }
    }

    // =========================================================================
    // resetCollections
    // =========================================================================

    fn do_reset_collections(&mut self) -> ChangeResult {
        let mut lost_selection = false;
        for collection in &mut self.collections {
            lost_selection |= collection.clear();
            self.bus.post(Notification::CollectionChanged {
                context: self.id,
                collection: collection.id(),
            });
        }
        self.collections.clear();
        self.case_index.clear();
        if lost_selection {
            self.bump_selection_count();
        }
        ChangeResult::success()
    }

    // =========================================================================
    // RESTORE (persisted form)
    // =========================================================================

    /// Append a fully built collection with its original IDs.
    ///
    /// Used when rebuilding a context from its persisted form; the caller
    /// guarantees chain order.
    pub(crate) fn restore_collection(&mut self, collection: Collection) {
        self.ids.observe(collection.id().0);
        for attribute in collection.attributes() {
            self.ids.observe(attribute.id.0);
        }
        if let Some(parent) = collection.parent_id() {
            let id = collection.id();
            if let Some(p) = self.collection_mut(parent) {
                p.set_child(Some(id));
            }
        }
        self.collections.push(collection);
    }

    /// Append a case with its original ID at the end of its collection.
    pub(crate) fn restore_case(&mut self, case: Case) -> Result<(), CodapError> {
        let id = case.id();
        let collection_id = case.collection();
        // Same hierarchy rule as createCase: a case has a parent exactly
        // when its collection does, and the parent lives one level up.
        let expected = self.collection(collection_id).and_then(Collection::parent_id);
        match (case.parent(), expected) {
            (None, None) => {}
            (Some(parent), Some(_)) if self.case_collection(parent) == expected => {}
            (parent, _) => return Err(CodapError::InvalidParent(parent)),
        }
        if self.case_index.contains_key(&id) {
            return Err(CodapError::DeserializationError(format!(
                "duplicate case id {}",
                id
            )));
        }
        let collection = self
            .collection_mut(collection_id)
            .ok_or_else(|| CodapError::CollectionNotFound(collection_id.to_string()))?;
        let parent = case.parent();
        collection.insert_case(case, None);
        self.case_index.insert(id, collection_id);
        self.ids.observe(id.0);
        if let Some(parent) = parent {
            if let Some(p) = self.case_mut(parent) {
                let end = p.children().len();
                p.insert_child(end, id);
            }
        }
        Ok(())
    }

    /// Continue ID allocation after `next` (persisted allocator state).
    pub(crate) fn reserve_ids(&mut self, next: u64) {
        self.ids.observe(next.saturating_sub(1));
    }
}

fn deleted_reference_error(name: &str) -> String {
    format!("reference to deleted attribute '{}'", name)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::CaseSpec;
    use std::sync::{Arc, Mutex};

    /// Families (root) → People (child) with F1 { A, B } and F2 { C }.
    struct Fixture {
        ctx: DataContext,
        families: CollectionId,
        people: CollectionId,
        f1: CaseId,
        f2: CaseId,
        a: CaseId,
        b: CaseId,
        c: CaseId,
    }

    fn fixture() -> Fixture {
        let mut ctx = DataContext::new(DataContextId(1), "Mammals");
        let families = ctx
            .apply_change(ChangeRequest::CreateCollection {
                name: "Families".to_string(),
                title: None,
                parent: None,
                attributes: vec![AttributeSpec::named("surname")],
                attribute_order: vec![],
            })
            .collection_id
            .expect("families");
        let people = ctx
            .apply_change(ChangeRequest::CreateCollection {
                name: "People".to_string(),
                title: None,
                parent: Some(CollectionRef::Id(families)),
                attributes: vec![AttributeSpec::named("name"), AttributeSpec::named("age")],
                attribute_order: vec![],
            })
            .collection_id
            .expect("people");

        let roots = ctx.apply_change(ChangeRequest::CreateCases {
            collection: Some(CollectionRef::Id(families)),
            cases: vec![
                CaseSpec::root(vec![Value::from("Smith")]),
                CaseSpec::root(vec![Value::from("Jones")]),
            ],
        });
        let (f1, f2) = (roots.case_ids[0], roots.case_ids[1]);

        let kids = ctx.apply_change(ChangeRequest::CreateCases {
            collection: None,
            cases: vec![
                CaseSpec::child(f1, vec![Value::from("A"), Value::from(30)]),
                CaseSpec::child(f1, vec![Value::from("B"), Value::from(8)]),
                CaseSpec::child(f2, vec![Value::from("C"), Value::from(50)]),
            ],
        });
        let (a, b, c) = (kids.case_ids[0], kids.case_ids[1], kids.case_ids[2]);

        Fixture {
            ctx,
            families,
            people,
            f1,
            f2,
            a,
            b,
            c,
        }
    }

    fn select(cases: Vec<CaseId>, extend: bool) -> ChangeRequest {
        ChangeRequest::SelectCases {
            cases: Some(cases),
            select: true,
            extend,
            descendants: true,
        }
    }

    #[test]
    fn child_collection_copies_parent_attributes_first() {
        let fx = fixture();
        let people = fx.ctx.collection(fx.people).expect("people");
        let names: Vec<_> = people.attributes().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["surname", "name", "age"]);

        let parent_attr = fx.ctx.collection(fx.families).expect("families").attributes()[0].id;
        assert_ne!(people.attributes()[0].id, parent_attr);
        assert_eq!(fx.ctx.child_collection(fx.families).map(Collection::id), Some(fx.people));
        assert_eq!(fx.ctx.parent_collection(fx.people).map(Collection::id), Some(fx.families));
    }

    #[test]
    fn child_values_are_parent_values_then_own() {
        let fx = fixture();
        let values = fx.ctx.case_values_by_name(fx.a).expect("values");
        assert_eq!(values["surname"], Value::from("Smith"));
        assert_eq!(values["name"], Value::from("A"));
        assert_eq!(values["age"], Value::from(30));
    }

    #[test]
    fn hierarchy_links_are_consistent() {
        let fx = fixture();
        let f1 = fx.ctx.case(fx.f1).expect("f1");
        assert_eq!(f1.children(), &[fx.a, fx.b]);
        assert_eq!(fx.ctx.case(fx.a).and_then(Case::parent), Some(fx.f1));
        assert_eq!(fx.ctx.case_collection(fx.c), Some(fx.people));
        assert_eq!(fx.ctx.case_count(), 5);
    }

    #[test]
    fn create_collection_is_find_or_create() {
        let mut fx = fixture();
        let again = fx.ctx.apply_change(ChangeRequest::CreateCollection {
            name: "Families".to_string(),
            title: None,
            parent: None,
            attributes: vec![AttributeSpec::named("city")],
            attribute_order: vec!["city".to_string()],
        });
        assert!(again.success);
        assert_eq!(again.collection_id, Some(fx.families));
        assert_eq!(fx.ctx.collections().len(), 2);

        let families = fx.ctx.collection(fx.families).expect("families");
        assert_eq!(families.attributes()[0].name, "city");
        let f1 = families.case(fx.f1).expect("f1");
        assert_eq!(f1.values().len(), 2);
    }

    #[test]
    fn create_collection_rejects_branching() {
        let mut fx = fixture();
        let result = fx.ctx.apply_change(ChangeRequest::CreateCollection {
            name: "Pets".to_string(),
            title: None,
            parent: Some(CollectionRef::Id(fx.families)),
            attributes: vec![],
            attribute_order: vec![],
        });
        assert!(!result.success);
        assert_eq!(fx.ctx.collections().len(), 2);
    }

    #[test]
    fn invalid_parent_is_skipped_not_fatal() {
        let mut fx = fixture();
        let before = fx.ctx.collection(fx.people).expect("people").case_count();

        let result = fx.ctx.apply_change(ChangeRequest::CreateCases {
            collection: Some("People".into()),
            cases: vec![
                CaseSpec::child(CaseId(999), vec![Value::from("X")]),
                CaseSpec::child(fx.f2, vec![Value::from("D")]),
            ],
        });

        assert!(result.success);
        assert_eq!(result.case_ids.len(), 1);
        assert_eq!(
            fx.ctx.collection(fx.people).expect("people").case_count(),
            before + 1
        );
    }

    #[test]
    fn parent_in_wrong_collection_is_rejected() {
        let mut fx = fixture();
        let result = fx.ctx.apply_change(ChangeRequest::CreateCase {
            collection: Some("People".into()),
            case: CaseSpec::child(fx.a, vec![]),
        });
        assert!(!result.success);

        let result = fx.ctx.apply_change(ChangeRequest::CreateCase {
            collection: Some("Families".into()),
            case: CaseSpec::child(fx.f1, vec![]),
        });
        assert!(!result.success);
    }

    #[test]
    fn explicit_index_keeps_siblings_in_display_order() {
        let mut fx = fixture();
        let result = fx.ctx.apply_change(ChangeRequest::CreateCase {
            collection: None,
            case: CaseSpec::child(fx.f1, vec![Value::from("Z")]).at(0),
        });
        let z = result.case_id.expect("created");

        let people = fx.ctx.collection(fx.people).expect("people");
        assert_eq!(people.case_ids()[0], z);
        assert_eq!(fx.ctx.case(fx.f1).expect("f1").children(), &[z, fx.a, fx.b]);
    }

    #[test]
    fn named_values_fill_inherited_from_parent() {
        let mut fx = fixture();
        let mut values = BTreeMap::new();
        values.insert("age".to_string(), Value::from(1));
        let result = fx.ctx.apply_change(ChangeRequest::CreateCase {
            collection: None,
            case: CaseSpec::named(Some(fx.f2), values),
        });
        let id = result.case_id.expect("created");
        let values = fx.ctx.case_values_by_name(id).expect("values");
        assert_eq!(values["surname"], Value::from("Jones"));
        assert_eq!(values["name"], Value::Missing);
        assert_eq!(values["age"], Value::from(1));
    }

    #[test]
    fn update_positional_replaces_vector() {
        let mut fx = fixture();
        let result = fx.ctx.apply_change(ChangeRequest::UpdateCases {
            collection: None,
            cases: vec![fx.a],
            values: vec![vec![Value::from("Smith"), Value::from("Al"), Value::from(31)]],
            attribute_ids: None,
        });
        assert!(result.success);
        let values = fx.ctx.case_values_by_name(fx.a).expect("values");
        assert_eq!(values["name"], Value::from("Al"));
        assert_eq!(values["age"], Value::from(31));
    }

    #[test]
    fn update_by_attribute_is_attribute_major_and_batched() {
        let mut fx = fixture();
        let people = fx.ctx.collection(fx.people).expect("people");
        let name = people.attribute_by_name("name").expect("name").id;
        let age = people.attribute_by_name("age").expect("age").id;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        fx.ctx.flush_notifications();
        fx.ctx.subscribe(move |n| sink.lock().expect("lock").push(n.clone()));

        let result = fx.ctx.apply_change(ChangeRequest::UpdateCases {
            collection: None,
            cases: vec![fx.a, fx.b],
            values: vec![
                vec![Value::from("A2"), Value::from("B2")],
                vec![Value::from(1), Value::from(2)],
            ],
            attribute_ids: Some(vec![name, age]),
        });
        assert!(result.success);
        assert_eq!(fx.ctx.case(fx.b).and_then(|c| c.value(age)), Some(&Value::from(2)));

        fx.ctx.flush_notifications();
        let value_notices = seen
            .lock()
            .expect("lock")
            .iter()
            .filter(|n| matches!(n, Notification::CaseValuesChanged { .. }))
            .count();
        assert_eq!(value_notices, 2);
    }

    #[test]
    fn parent_update_propagates_to_same_named_child_attribute() {
        let mut fx = fixture();
        let surname = fx
            .ctx
            .collection(fx.families)
            .and_then(|c| c.attribute_by_name("surname"))
            .expect("surname")
            .id;

        fx.ctx.apply_change(ChangeRequest::UpdateCases {
            collection: None,
            cases: vec![fx.f1],
            values: vec![vec![Value::from("Smyth")]],
            attribute_ids: Some(vec![surname]),
        });

        for child in [fx.a, fx.b] {
            let values = fx.ctx.case_values_by_name(child).expect("values");
            assert_eq!(values["surname"], Value::from("Smyth"));
        }
        let c_values = fx.ctx.case_values_by_name(fx.c).expect("values");
        assert_eq!(c_values["surname"], Value::from("Jones"));
    }

    #[test]
    fn delete_cascades_and_unlinks() {
        let mut fx = fixture();
        let result = fx.ctx.apply_change(ChangeRequest::DeleteCases { cases: vec![fx.f1] });

        assert!(result.success);
        assert_eq!(result.deleted_case_ids, vec![fx.a, fx.b, fx.f1]);
        assert_eq!(fx.ctx.case_count(), 2);
        assert!(fx.ctx.case(fx.a).is_none());
        assert_eq!(fx.ctx.collection(fx.people).expect("people").case_count(), 1);
    }

    #[test]
    fn deleting_child_removes_parent_reference() {
        let mut fx = fixture();
        fx.ctx.apply_change(ChangeRequest::DeleteCases { cases: vec![fx.a] });
        assert_eq!(fx.ctx.case(fx.f1).expect("f1").children(), &[fx.b]);
    }

    #[test]
    fn deleting_selected_case_counts_as_selection_change() {
        let mut fx = fixture();
        fx.ctx.apply_change(select(vec![fx.a], false));
        let before = fx.ctx.selection_change_count();
        fx.ctx.apply_change(ChangeRequest::DeleteCases { cases: vec![fx.a] });
        assert_eq!(fx.ctx.selection_change_count(), before + 1);
    }

    #[test]
    fn select_then_extend_scenario() {
        let mut fx = fixture();
        fx.ctx.apply_change(select(vec![fx.a], false));
        assert_eq!(fx.ctx.selection(fx.people).expect("sel").len(), 1);

        fx.ctx.apply_change(select(vec![fx.b], true));
        let selection: Vec<_> = fx.ctx.selection(fx.people).expect("sel").iter().copied().collect();
        assert_eq!(selection, vec![fx.a, fx.b]);
    }

    #[test]
    fn selecting_parent_selects_subtree() {
        let mut fx = fixture();
        fx.ctx.apply_change(select(vec![fx.f1], false));
        assert!(fx.ctx.is_selected(fx.f1));
        assert!(fx.ctx.is_selected(fx.a));
        assert!(fx.ctx.is_selected(fx.b));
        assert!(!fx.ctx.is_selected(fx.c));
    }

    #[test]
    fn fresh_selection_in_child_clears_parent_collection() {
        let mut fx = fixture();
        fx.ctx.apply_change(select(vec![fx.f2], false));
        assert!(fx.ctx.is_selected(fx.f2));

        fx.ctx.apply_change(select(vec![fx.a], false));
        assert!(!fx.ctx.is_selected(fx.f2));
        assert!(fx.ctx.is_selected(fx.a));
    }

    #[test]
    fn non_extending_deselect_clears_untouched_collections() {
        let mut fx = fixture();
        fx.ctx.apply_change(ChangeRequest::SelectCases {
            cases: Some(vec![fx.f2]),
            select: true,
            extend: false,
            descendants: false,
        });
        assert!(fx.ctx.is_selected(fx.f2));

        let result = fx.ctx.apply_change(ChangeRequest::SelectCases {
            cases: Some(vec![fx.a]),
            select: false,
            extend: false,
            descendants: true,
        });
        assert!(result.selection_changed);
        assert!(!fx.ctx.is_selected(fx.f2));
        assert!(fx.ctx.selection(fx.families).expect("sel").is_empty());
    }

    #[test]
    fn extending_deselect_leaves_other_collections() {
        let mut fx = fixture();
        fx.ctx.apply_change(ChangeRequest::SelectCases {
            cases: Some(vec![fx.f2]),
            select: true,
            extend: false,
            descendants: false,
        });
        fx.ctx.apply_change(ChangeRequest::SelectCases {
            cases: Some(vec![fx.a]),
            select: false,
            extend: true,
            descendants: true,
        });
        assert!(fx.ctx.is_selected(fx.f2));
    }

    #[test]
    fn deselect_cascades_and_noop_does_not_count() {
        let mut fx = fixture();
        fx.ctx.apply_change(select(vec![fx.f1], false));
        let count = fx.ctx.selection_change_count();

        let result = fx.ctx.apply_change(select(vec![fx.f1], false));
        assert!(!result.selection_changed);
        assert_eq!(fx.ctx.selection_change_count(), count);

        fx.ctx.apply_change(ChangeRequest::SelectCases {
            cases: Some(vec![fx.f1]),
            select: false,
            extend: false,
            descendants: true,
        });
        assert!(!fx.ctx.is_selected(fx.a));
        assert_eq!(fx.ctx.selection_change_count(), count + 1);
    }

    #[test]
    fn select_all_and_deselect_all() {
        let mut fx = fixture();
        fx.ctx.apply_change(ChangeRequest::SelectCases {
            cases: None,
            select: true,
            extend: false,
            descendants: true,
        });
        assert_eq!(fx.ctx.selection(fx.people).expect("sel").len(), 3);

        fx.ctx.apply_change(ChangeRequest::SelectCases {
            cases: None,
            select: false,
            extend: false,
            descendants: true,
        });
        assert!(fx.ctx.selection(fx.families).expect("sel").is_empty());
    }

    #[test]
    fn selection_does_not_dirty_document() {
        let mut fx = fixture();
        fx.ctx.take_dirty();
        fx.ctx.apply_change(select(vec![fx.a], false));
        assert!(!fx.ctx.take_dirty());

        fx.ctx.apply_change(ChangeRequest::DeleteCases { cases: vec![fx.c] });
        assert!(fx.ctx.take_dirty());
    }

    #[test]
    fn create_attributes_rewrites_to_update_when_nothing_new() {
        let mut fx = fixture();
        let result = fx.ctx.apply_change(ChangeRequest::CreateAttributes {
            collection: "People".into(),
            attributes: vec![AttributeSpec::named("age").with_type(crate::AttributeType::Numeric)],
            position: None,
        });
        assert!(result.success);
        assert!(!result.did_create_attribute);
        assert_eq!(
            fx.ctx.last_change().map(|c| c.operation),
            Some(Operation::UpdateAttributes)
        );

        let result = fx.ctx.apply_change(ChangeRequest::CreateAttributes {
            collection: "People".into(),
            attributes: vec![AttributeSpec::named("height")],
            position: Some(1),
        });
        assert!(result.did_create_attribute);
        assert_eq!(
            fx.ctx.last_change().map(|c| c.operation),
            Some(Operation::CreateAttributes)
        );
        let height = result.attr_ids[0];
        assert_eq!(fx.ctx.case(fx.a).and_then(|c| c.value(height)), Some(&Value::Missing));
        let people = fx.ctx.collection(fx.people).expect("people");
        assert_eq!(people.attribute_position(height), Some(1));
    }

    #[test]
    fn update_attributes_refuses_colliding_rename() {
        let mut fx = fixture();
        let result = fx.ctx.apply_change(ChangeRequest::UpdateAttributes {
            collection: "People".into(),
            attributes: vec![AttributeSpec {
                id: fx.ctx.attribute_by_name("age").map(|a| a.id),
                name: Some("name".to_string()),
                ..AttributeSpec::default()
            }],
        });
        assert!(!result.success);
    }

    #[test]
    fn delete_attribute_drops_values_and_invalidates_formulas() {
        let mut fx = fixture();
        fx.ctx.apply_change(ChangeRequest::CreateAttributes {
            collection: "People".into(),
            attributes: vec![AttributeSpec::named("decades").with_formula("age / 10")],
            position: None,
        });

        let result = fx.ctx.apply_change(ChangeRequest::DeleteAttributes {
            collection: "People".into(),
            attributes: vec!["age".into()],
        });
        assert!(result.success);
        assert_eq!(result.invalidated_attr_ids.len(), 1);

        let decades = fx.ctx.attribute(result.invalidated_attr_ids[0]).expect("decades");
        assert!(decades.formula_error.is_some());
        assert_eq!(fx.ctx.case(fx.a).expect("a").values().len(), 3);
    }

    #[test]
    fn recreating_attribute_clears_formula_errors_it_caused() {
        let mut fx = fixture();
        fx.ctx.apply_change(ChangeRequest::CreateAttributes {
            collection: "People".into(),
            attributes: vec![AttributeSpec::named("decades").with_formula("age / 10")],
            position: None,
        });
        let result = fx.ctx.apply_change(ChangeRequest::DeleteAttributes {
            collection: "People".into(),
            attributes: vec!["age".into()],
        });
        let decades = result.invalidated_attr_ids[0];

        fx.ctx.apply_change(ChangeRequest::CreateAttributes {
            collection: "People".into(),
            attributes: vec![AttributeSpec::named("weight")],
            position: None,
        });
        assert!(fx.ctx.attribute(decades).expect("decades").formula_error.is_some());

        fx.ctx.apply_change(ChangeRequest::CreateAttributes {
            collection: "People".into(),
            attributes: vec![AttributeSpec::named("age")],
            position: None,
        });
        assert!(fx.ctx.attribute(decades).expect("decades").formula_error.is_none());
    }

    #[test]
    fn reset_destroys_everything_but_keeps_counting() {
        let mut fx = fixture();
        let before = fx.ctx.change_count();
        let result = fx.ctx.apply_change(ChangeRequest::ResetCollections);
        assert!(result.success);
        assert!(fx.ctx.collections().is_empty());
        assert_eq!(fx.ctx.case_count(), 0);
        assert_eq!(fx.ctx.change_count(), before + 1);
    }

    #[test]
    fn complete_changes_are_logged_not_applied() {
        let mut fx = fixture();
        let before = fx.ctx.case_count();
        let result = fx.ctx.apply_change(Change::completed(ChangeRequest::DeleteCases {
            cases: vec![fx.f1],
        }));
        assert!(result.success);
        assert_eq!(fx.ctx.case_count(), before);
        assert!(fx.ctx.last_change().is_some_and(|c| c.is_complete));
    }

    #[test]
    fn change_log_tracks_count_and_new_changes() {
        let mut fx = fixture();
        let seen = fx.ctx.change_count();
        assert_eq!(fx.ctx.changes().len() as u64, seen);

        fx.ctx.apply_change(select(vec![fx.a], false));
        fx.ctx.apply_change(ChangeRequest::DeleteCases { cases: vec![CaseId(12345)] });

        let fresh = fx.ctx.new_changes(seen);
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh[0].operation, Operation::SelectCases);
        assert!(!fresh[1].result.success);
        assert_eq!(fx.ctx.new_changes(999).len(), 0);
    }

    #[test]
    fn notifications_wait_for_end_of_turn() {
        let mut fx = fixture();
        fx.ctx.flush_notifications();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        fx.ctx.subscribe(move |n| sink.lock().expect("lock").push(n.clone()));

        fx.ctx.apply_change(select(vec![fx.a], false));
        fx.ctx.apply_change(select(vec![fx.b], true));
        assert!(seen.lock().expect("lock").is_empty());

        fx.ctx.flush_notifications();
        let seen = seen.lock().expect("lock");
        let counts: Vec<_> = seen
            .iter()
            .filter_map(|n| match n {
                Notification::ChangeCountChanged { change_count, .. } => Some(*change_count),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![fx.ctx.change_count()]);
    }

    #[test]
    fn destroyed_context_refuses_changes_in_log_mode() {
        let mut fx = fixture();
        fx.ctx.set_invariant_mode(InvariantMode::Log);
        fx.ctx.destroy();
        let before = fx.ctx.change_count();

        let result = fx.ctx.apply_change(ChangeRequest::ResetCollections);
        assert!(!result.success);
        assert_eq!(fx.ctx.change_count(), before);
        assert!(fx.ctx.is_destroyed());
        assert!(fx.ctx.collections().is_empty());
    }

    #[test]
    fn descendants_are_pre_order() {
        let fx = fixture();
        assert_eq!(fx.ctx.descendants(fx.f1), vec![fx.a, fx.b]);
        assert!(fx.ctx.descendants(fx.c).is_empty());
        assert_eq!(fx.ctx.collection_chain_to(fx.people), vec![fx.families, fx.people]);
    }
}

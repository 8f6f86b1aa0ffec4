//! # Change Commands
//!
//! Undoable wrappers around `DataContext::apply_change`.
//!
//! Each command records what it needs to reverse itself while it executes
//! (case values, positions, attribute definitions) and performs its undo
//! through ordinary change requests, so undo is logged and counted like any
//! other change.
//!
//! Cases recreated by an undo receive fresh IDs. Commands that must refer to
//! them again (a redo of a delete) carry an old→new remap.

use crate::attribute::{AttributeRef, AttributeSpec};
use crate::change::{CaseSpec, ChangeRequest, ChangeResult, CollectionRef, Operation};
use crate::data_context::DataContext;
use crate::registry::ContextRegistry;
use crate::undo::Command;
use crate::{AttributeId, CaseId, CodapError, CollectionId, DataContextId, Value};
use std::collections::BTreeMap;

/// Apply a request and turn `success: false` into an error.
fn apply(
    contexts: &mut ContextRegistry,
    context: DataContextId,
    request: ChangeRequest,
) -> Result<ChangeResult, CodapError> {
    let operation = request.operation();
    let result = contexts.require_mut(context)?.apply_change(request);
    if result.success {
        Ok(result)
    } else {
        Err(CodapError::ChangeFailed(format!(
            "{}: {}",
            operation,
            result.message.as_deref().unwrap_or("no effect")
        )))
    }
}

fn remapped(remap: &BTreeMap<CaseId, CaseId>, id: CaseId) -> CaseId {
    remap.get(&id).copied().unwrap_or(id)
}

fn plural(n: usize, one: &str, many: &str) -> String {
    if n == 1 {
        format!("1 {}", one)
    } else {
        format!("{} {}", n, many)
    }
}

// =============================================================================
// CREATE CASES
// =============================================================================

/// Create one or more cases; undo deletes them.
#[derive(Debug)]
pub struct CreateCasesCommand {
    context: DataContextId,
    collection: Option<CollectionRef>,
    cases: Vec<CaseSpec>,
    created: Vec<CaseId>,
    remap: BTreeMap<CaseId, CaseId>,
}

impl CreateCasesCommand {
    #[must_use]
    pub fn new(
        context: DataContextId,
        collection: Option<CollectionRef>,
        cases: Vec<CaseSpec>,
    ) -> Self {
        Self {
            context,
            collection,
            cases,
            created: Vec::new(),
            remap: BTreeMap::new(),
        }
    }

    /// IDs produced by the most recent execution.
    #[must_use]
    pub fn created(&self) -> &[CaseId] {
        &self.created
    }
}

impl Command for CreateCasesCommand {
    fn name(&self) -> &'static str {
        Operation::CreateCases.as_str()
    }

    fn context(&self) -> DataContextId {
        self.context
    }

    fn description(&self) -> String {
        format!("create {}", plural(self.cases.len(), "case", "cases"))
    }

    fn log(&self) -> Option<String> {
        Some(format!("Created cases {:?}", self.created))
    }

    fn execute(&mut self, contexts: &mut ContextRegistry) -> Result<ChangeResult, CodapError> {
        let result = apply(
            contexts,
            self.context,
            ChangeRequest::CreateCases {
                collection: self.collection.clone(),
                cases: self.cases.clone(),
            },
        )?;
        // A redo brings the same rows back under new IDs.
        self.remap = if self.created.len() == result.case_ids.len() {
            self.created
                .iter()
                .copied()
                .zip(result.case_ids.iter().copied())
                .collect()
        } else {
            BTreeMap::new()
        };
        self.created.clone_from(&result.case_ids);
        Ok(result)
    }

    fn undo(&mut self, contexts: &mut ContextRegistry) -> Result<(), CodapError> {
        self.remap.clear();
        apply(
            contexts,
            self.context,
            ChangeRequest::DeleteCases {
                cases: self.created.clone(),
            },
        )
        .map(|_| ())
    }

    fn case_remap(&self) -> Option<&BTreeMap<CaseId, CaseId>> {
        Some(&self.remap)
    }

    fn remap_cases(&mut self, remap: &BTreeMap<CaseId, CaseId>) {
        for id in &mut self.created {
            *id = remapped(remap, *id);
        }
        for spec in &mut self.cases {
            spec.parent = spec.parent.map(|p| remapped(remap, p));
        }
    }
}

// =============================================================================
// DELETE CASES
// =============================================================================

/// Everything needed to recreate one deleted case.
#[derive(Debug, Clone, PartialEq)]
struct CaseSnapshot {
    id: CaseId,
    collection: CollectionId,
    /// Position of the collection in the chain; parents sort first.
    level: usize,
    index: usize,
    parent: Option<CaseId>,
    values: BTreeMap<String, Value>,
    selected: bool,
}

fn snapshot_subtree(ctx: &DataContext, root: CaseId, out: &mut Vec<CaseSnapshot>) {
    let mut ids = vec![root];
    ids.extend(ctx.descendants(root));
    for id in ids {
        if out.iter().any(|s| s.id == id) {
            continue;
        }
        let Some(case) = ctx.case(id) else {
            continue;
        };
        let collection = case.collection();
        out.push(CaseSnapshot {
            id,
            collection,
            level: ctx.collection_chain_to(collection).len(),
            index: ctx
                .collection(collection)
                .and_then(|c| c.case_index(id))
                .unwrap_or_default(),
            parent: case.parent(),
            values: ctx.case_values_by_name(id).unwrap_or_default(),
            selected: ctx.is_selected(id),
        });
    }
}

/// Delete cases with their subtrees; undo recreates them in place.
#[derive(Debug)]
pub struct DeleteCasesCommand {
    context: DataContextId,
    cases: Vec<CaseId>,
    snapshot: Vec<CaseSnapshot>,
    remap: BTreeMap<CaseId, CaseId>,
}

impl DeleteCasesCommand {
    #[must_use]
    pub fn new(context: DataContextId, cases: Vec<CaseId>) -> Self {
        Self {
            context,
            cases,
            snapshot: Vec::new(),
            remap: BTreeMap::new(),
        }
    }

    /// The IDs this command currently targets (remapped after an undo).
    #[must_use]
    pub fn cases(&self) -> &[CaseId] {
        &self.cases
    }

}

impl Command for DeleteCasesCommand {
    fn name(&self) -> &'static str {
        Operation::DeleteCases.as_str()
    }

    fn context(&self) -> DataContextId {
        self.context
    }

    fn description(&self) -> String {
        format!("delete {}", plural(self.cases.len(), "case", "cases"))
    }

    fn log(&self) -> Option<String> {
        Some(format!("Deleted {} cases", self.snapshot.len()))
    }

    fn execute(&mut self, contexts: &mut ContextRegistry) -> Result<ChangeResult, CodapError> {
        self.remap.clear();
        let ctx = contexts.require_mut(self.context)?;
        let mut snapshot = Vec::new();
        for root in &self.cases {
            snapshot_subtree(ctx, *root, &mut snapshot);
        }
        // Parent collections first, then ascending display position, so
        // re-insertion at the recorded index restores the original order.
        snapshot.sort_by_key(|s| (s.level, s.index));
        self.snapshot = snapshot;

        apply(
            contexts,
            self.context,
            ChangeRequest::DeleteCases {
                cases: self.cases.clone(),
            },
        )
    }

    fn undo(&mut self, contexts: &mut ContextRegistry) -> Result<(), CodapError> {
        let mut remap = BTreeMap::new();
        let mut reselect = Vec::new();
        for snap in &self.snapshot {
            let parent = snap.parent.map(|p| remapped(&remap, p));
            let result = apply(
                contexts,
                self.context,
                ChangeRequest::CreateCase {
                    collection: Some(CollectionRef::Id(snap.collection)),
                    case: CaseSpec::named(parent, snap.values.clone()).at(snap.index),
                },
            )?;
            let new_id = result
                .case_id
                .ok_or_else(|| CodapError::ChangeFailed("createCase returned no id".to_string()))?;
            remap.insert(snap.id, new_id);
            if snap.selected {
                reselect.push(new_id);
            }
        }

        if !reselect.is_empty() {
            apply(
                contexts,
                self.context,
                ChangeRequest::SelectCases {
                    cases: Some(reselect),
                    select: true,
                    extend: true,
                    descendants: false,
                },
            )?;
        }

        self.cases = self.cases.iter().map(|id| remapped(&remap, *id)).collect();
        tracing::debug!(context = %self.context, remapped = remap.len(), "restored deleted cases");
        self.remap = remap;
        Ok(())
    }

    fn case_remap(&self) -> Option<&BTreeMap<CaseId, CaseId>> {
        Some(&self.remap)
    }

    fn remap_cases(&mut self, remap: &BTreeMap<CaseId, CaseId>) {
        for id in &mut self.cases {
            *id = remapped(remap, *id);
        }
        // Parents outside the deleted subtree may have been recreated too.
        for snap in &mut self.snapshot {
            snap.id = remapped(remap, snap.id);
            snap.parent = snap.parent.map(|p| remapped(remap, p));
        }
    }
}

// =============================================================================
// UPDATE CASES
// =============================================================================

/// Update case values; undo writes the previous values back.
#[derive(Debug)]
pub struct UpdateCasesCommand {
    context: DataContextId,
    collection: Option<CollectionRef>,
    cases: Vec<CaseId>,
    values: Vec<Vec<Value>>,
    attribute_ids: Option<Vec<AttributeId>>,
    before: Vec<(CaseId, BTreeMap<AttributeId, Value>)>,
}

impl UpdateCasesCommand {
    #[must_use]
    pub fn new(
        context: DataContextId,
        collection: Option<CollectionRef>,
        cases: Vec<CaseId>,
        values: Vec<Vec<Value>>,
        attribute_ids: Option<Vec<AttributeId>>,
    ) -> Self {
        Self {
            context,
            collection,
            cases,
            values,
            attribute_ids,
            before: Vec::new(),
        }
    }
}

impl Command for UpdateCasesCommand {
    fn name(&self) -> &'static str {
        Operation::UpdateCases.as_str()
    }

    fn context(&self) -> DataContextId {
        self.context
    }

    fn description(&self) -> String {
        format!("edit {}", plural(self.cases.len(), "case", "cases"))
    }

    fn execute(&mut self, contexts: &mut ContextRegistry) -> Result<ChangeResult, CodapError> {
        let ctx = contexts.require_mut(self.context)?;
        // Updates propagate to same-named attributes below, so the whole
        // subtree is captured, parents before children.
        let mut before = Vec::new();
        for id in &self.cases {
            let mut ids = vec![*id];
            ids.extend(ctx.descendants(*id));
            for case_id in ids {
                if let Some(case) = ctx.case(case_id) {
                    before.push((case_id, case.values().clone()));
                }
            }
        }
        self.before = before;

        apply(
            contexts,
            self.context,
            ChangeRequest::UpdateCases {
                collection: self.collection.clone(),
                cases: self.cases.clone(),
                values: self.values.clone(),
                attribute_ids: self.attribute_ids.clone(),
            },
        )
    }

    fn undo(&mut self, contexts: &mut ContextRegistry) -> Result<(), CodapError> {
        for (case_id, values) in &self.before {
            let attribute_ids: Vec<AttributeId> = values.keys().copied().collect();
            let columns: Vec<Vec<Value>> = values.values().map(|v| vec![v.clone()]).collect();
            if attribute_ids.is_empty() {
                continue;
            }
            apply(
                contexts,
                self.context,
                ChangeRequest::UpdateCases {
                    collection: None,
                    cases: vec![*case_id],
                    values: columns,
                    attribute_ids: Some(attribute_ids),
                },
            )?;
        }
        Ok(())
    }

    fn remap_cases(&mut self, remap: &BTreeMap<CaseId, CaseId>) {
        for id in &mut self.cases {
            *id = remapped(remap, *id);
        }
        for (id, _) in &mut self.before {
            *id = remapped(remap, *id);
        }
    }
}

// =============================================================================
// SELECT CASES
// =============================================================================

/// Change the selection; undo restores every collection's prior selection.
#[derive(Debug)]
pub struct SelectCasesCommand {
    context: DataContextId,
    cases: Option<Vec<CaseId>>,
    select: bool,
    extend: bool,
    descendants: bool,
    before: Vec<CaseId>,
}

impl SelectCasesCommand {
    #[must_use]
    pub fn new(
        context: DataContextId,
        cases: Option<Vec<CaseId>>,
        select: bool,
        extend: bool,
        descendants: bool,
    ) -> Self {
        Self {
            context,
            cases,
            select,
            extend,
            descendants,
            before: Vec::new(),
        }
    }
}

impl Command for SelectCasesCommand {
    fn name(&self) -> &'static str {
        Operation::SelectCases.as_str()
    }

    fn context(&self) -> DataContextId {
        self.context
    }

    fn description(&self) -> String {
        if self.select {
            "select cases".to_string()
        } else {
            "deselect cases".to_string()
        }
    }

    fn execute(&mut self, contexts: &mut ContextRegistry) -> Result<ChangeResult, CodapError> {
        let ctx = contexts.require_mut(self.context)?;
        self.before = ctx
            .collections()
            .iter()
            .flat_map(|c| c.selected_cases())
            .collect();

        apply(
            contexts,
            self.context,
            ChangeRequest::SelectCases {
                cases: self.cases.clone(),
                select: self.select,
                extend: self.extend,
                descendants: self.descendants,
            },
        )
    }

    fn undo(&mut self, contexts: &mut ContextRegistry) -> Result<(), CodapError> {
        // A non-extending select replaces touched collections and clears the
        // rest, which is exactly "restore the previous sets".
        apply(
            contexts,
            self.context,
            ChangeRequest::SelectCases {
                cases: Some(self.before.clone()),
                select: true,
                extend: false,
                descendants: false,
            },
        )
        .map(|_| ())
    }

    fn remap_cases(&mut self, remap: &BTreeMap<CaseId, CaseId>) {
        if let Some(cases) = &mut self.cases {
            for id in cases.iter_mut() {
                *id = remapped(remap, *id);
            }
        }
        for id in &mut self.before {
            *id = remapped(remap, *id);
        }
    }
}

// =============================================================================
// ATTRIBUTE COMMANDS
// =============================================================================

fn attribute_snapshots(
    ctx: &DataContext,
    collection: &CollectionRef,
    specs: &[AttributeSpec],
) -> Vec<AttributeSpec> {
    let Some(collection) = ctx
        .resolve_collection(collection)
        .and_then(|id| ctx.collection(id))
    else {
        return Vec::new();
    };
    specs
        .iter()
        .filter_map(|spec| collection.resolve_spec(spec))
        .filter_map(|id| collection.attribute(id))
        .map(|a| a.to_spec())
        .collect()
}

/// Create attributes; undo deletes the new ones and restores updated ones.
#[derive(Debug)]
pub struct CreateAttributesCommand {
    context: DataContextId,
    collection: CollectionRef,
    attributes: Vec<AttributeSpec>,
    position: Option<usize>,
    created: Vec<AttributeId>,
    before: Vec<AttributeSpec>,
}

impl CreateAttributesCommand {
    #[must_use]
    pub fn new(
        context: DataContextId,
        collection: CollectionRef,
        attributes: Vec<AttributeSpec>,
        position: Option<usize>,
    ) -> Self {
        Self {
            context,
            collection,
            attributes,
            position,
            created: Vec::new(),
            before: Vec::new(),
        }
    }
}

impl Command for CreateAttributesCommand {
    fn name(&self) -> &'static str {
        Operation::CreateAttributes.as_str()
    }

    fn context(&self) -> DataContextId {
        self.context
    }

    fn description(&self) -> String {
        format!(
            "create {}",
            plural(self.attributes.len(), "attribute", "attributes")
        )
    }

    fn execute(&mut self, contexts: &mut ContextRegistry) -> Result<ChangeResult, CodapError> {
        let ctx = contexts.require_mut(self.context)?;
        self.before = attribute_snapshots(ctx, &self.collection, &self.attributes);

        let result = apply(
            contexts,
            self.context,
            ChangeRequest::CreateAttributes {
                collection: self.collection.clone(),
                attributes: self.attributes.clone(),
                position: self.position,
            },
        )?;
        self.created = result
            .attr_ids
            .iter()
            .copied()
            .filter(|id| !self.before.iter().any(|s| s.id == Some(*id)))
            .collect();
        Ok(result)
    }

    fn undo(&mut self, contexts: &mut ContextRegistry) -> Result<(), CodapError> {
        if !self.created.is_empty() {
            apply(
                contexts,
                self.context,
                ChangeRequest::DeleteAttributes {
                    collection: self.collection.clone(),
                    attributes: self.created.iter().copied().map(AttributeRef::Id).collect(),
                },
            )?;
        }
        if !self.before.is_empty() {
            apply(
                contexts,
                self.context,
                ChangeRequest::UpdateAttributes {
                    collection: self.collection.clone(),
                    attributes: self.before.clone(),
                },
            )?;
        }
        Ok(())
    }
}

/// Update attribute properties; undo re-applies the previous definitions.
#[derive(Debug)]
pub struct UpdateAttributesCommand {
    context: DataContextId,
    collection: CollectionRef,
    attributes: Vec<AttributeSpec>,
    before: Vec<AttributeSpec>,
}

impl UpdateAttributesCommand {
    #[must_use]
    pub fn new(
        context: DataContextId,
        collection: CollectionRef,
        attributes: Vec<AttributeSpec>,
    ) -> Self {
        Self {
            context,
            collection,
            attributes,
            before: Vec::new(),
        }
    }
}

impl Command for UpdateAttributesCommand {
    fn name(&self) -> &'static str {
        Operation::UpdateAttributes.as_str()
    }

    fn context(&self) -> DataContextId {
        self.context
    }

    fn description(&self) -> String {
        format!(
            "edit {}",
            plural(self.attributes.len(), "attribute", "attributes")
        )
    }

    fn execute(&mut self, contexts: &mut ContextRegistry) -> Result<ChangeResult, CodapError> {
        let ctx = contexts.require_mut(self.context)?;
        self.before = attribute_snapshots(ctx, &self.collection, &self.attributes);
        apply(
            contexts,
            self.context,
            ChangeRequest::UpdateAttributes {
                collection: self.collection.clone(),
                attributes: self.attributes.clone(),
            },
        )
    }

    fn undo(&mut self, contexts: &mut ContextRegistry) -> Result<(), CodapError> {
        apply(
            contexts,
            self.context,
            ChangeRequest::UpdateAttributes {
                collection: self.collection.clone(),
                attributes: self.before.clone(),
            },
        )
        .map(|_| ())
    }
}

/// A deleted attribute: definition, column position and every case's value.
#[derive(Debug, Clone, PartialEq)]
struct RemovedAttribute {
    position: usize,
    spec: AttributeSpec,
    values: Vec<(CaseId, Value)>,
}

/// Delete attributes; undo recreates them in place with their values.
#[derive(Debug)]
pub struct DeleteAttributesCommand {
    context: DataContextId,
    collection: CollectionRef,
    attributes: Vec<AttributeRef>,
    removed: Vec<RemovedAttribute>,
}

impl DeleteAttributesCommand {
    #[must_use]
    pub fn new(
        context: DataContextId,
        collection: CollectionRef,
        attributes: Vec<AttributeRef>,
    ) -> Self {
        Self {
            context,
            collection,
            attributes,
            removed: Vec::new(),
        }
    }
}

impl Command for DeleteAttributesCommand {
    fn name(&self) -> &'static str {
        Operation::DeleteAttributes.as_str()
    }

    fn context(&self) -> DataContextId {
        self.context
    }

    fn description(&self) -> String {
        format!(
            "delete {}",
            plural(self.attributes.len(), "attribute", "attributes")
        )
    }

    fn execute(&mut self, contexts: &mut ContextRegistry) -> Result<ChangeResult, CodapError> {
        let ctx = contexts.require_mut(self.context)?;
        let collection = ctx
            .resolve_collection(&self.collection)
            .and_then(|id| ctx.collection(id))
            .ok_or_else(|| CodapError::CollectionNotFound(self.collection.to_string()))?;

        let mut removed = Vec::new();
        for reference in &self.attributes {
            let Some(id) = collection.resolve_attribute(reference) else {
                continue;
            };
            let (Some(position), Some(attribute)) =
                (collection.attribute_position(id), collection.attribute(id))
            else {
                continue;
            };
            removed.push(RemovedAttribute {
                position,
                spec: attribute.to_spec(),
                values: collection
                    .cases()
                    .map(|c| (c.id(), c.value(id).cloned().unwrap_or_default()))
                    .collect(),
            });
        }
        removed.sort_by_key(|r| r.position);
        self.removed = removed;

        apply(
            contexts,
            self.context,
            ChangeRequest::DeleteAttributes {
                collection: self.collection.clone(),
                attributes: self.attributes.clone(),
            },
        )
    }

    fn undo(&mut self, contexts: &mut ContextRegistry) -> Result<(), CodapError> {
        let mut restored = Vec::new();
        // Ascending positions: each insert lands where it originally was.
        for removed in &self.removed {
            let result = apply(
                contexts,
                self.context,
                ChangeRequest::CreateAttributes {
                    collection: self.collection.clone(),
                    attributes: vec![removed.spec.clone()],
                    position: Some(removed.position),
                },
            )?;
            let Some(new_id) = result.attr_ids.first().copied() else {
                continue;
            };
            restored.push(AttributeRef::Id(new_id));

            let (cases, column): (Vec<CaseId>, Vec<Value>) =
                removed.values.iter().cloned().unzip();
            if !cases.is_empty() {
                apply(
                    contexts,
                    self.context,
                    ChangeRequest::UpdateCases {
                        collection: None,
                        cases,
                        values: vec![column],
                        attribute_ids: Some(vec![new_id]),
                    },
                )?;
            }
        }
        // Redo deletes what undo recreated.
        self.attributes = restored;
        Ok(())
    }

    fn remap_cases(&mut self, remap: &BTreeMap<CaseId, CaseId>) {
        for removed in &mut self.removed {
            for (id, _) in &mut removed.values {
                *id = remapped(remap, *id);
            }
        }
    }
}

// =============================================================================
// DESCRIPTOR → COMMAND
// =============================================================================

/// The undoable command for a change request, if it has one.
///
/// `createCollection` and `resetCollections` are not undoable.
#[must_use]
pub fn command_for_change(context: DataContextId, request: ChangeRequest) -> Option<Box<dyn Command>> {
    match request {
        ChangeRequest::CreateCase { collection, case } => Some(Box::new(
            CreateCasesCommand::new(context, collection, vec![case]),
        )),
        ChangeRequest::CreateCases { collection, cases } => {
            Some(Box::new(CreateCasesCommand::new(context, collection, cases)))
        }
        ChangeRequest::UpdateCases {
            collection,
            cases,
            values,
            attribute_ids,
        } => Some(Box::new(UpdateCasesCommand::new(
            context,
            collection,
            cases,
            values,
            attribute_ids,
        ))),
        ChangeRequest::DeleteCases { cases } => {
            Some(Box::new(DeleteCasesCommand::new(context, cases)))
        }
        ChangeRequest::SelectCases {
            cases,
            select,
            extend,
            descendants,
        } => Some(Box::new(SelectCasesCommand::new(
            context,
            cases,
            select,
            extend,
            descendants,
        ))),
        ChangeRequest::CreateAttributes {
            collection,
            attributes,
            position,
        } => Some(Box::new(CreateAttributesCommand::new(
            context, collection, attributes, position,
        ))),
        ChangeRequest::UpdateAttributes {
            collection,
            attributes,
        } => Some(Box::new(UpdateAttributesCommand::new(
            context, collection, attributes,
        ))),
        ChangeRequest::DeleteAttributes {
            collection,
            attributes,
        } => Some(Box::new(DeleteAttributesCommand::new(
            context, collection, attributes,
        ))),
        ChangeRequest::CreateCollection { .. } | ChangeRequest::ResetCollections => None,
    }
}

// =============================================================================
// TESTS
// =============================================================================

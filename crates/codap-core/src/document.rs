//! # Document
//!
//! The session object: every data context of an open document, the undo
//! history over them, the set of contexts with unsaved changes, and the
//! guard that keeps at most one save in flight.
//!
//! Mutations reach a context either as undoable commands (`execute`) or as
//! bare changes (`apply_change`). A bare change that dirties the document
//! outside a command invalidates the history, since commands can no longer
//! assume the state they recorded.

use crate::change::{Change, ChangeResult};
use crate::diagnostics::InvariantMode;
use crate::export::{DocumentSpec, export_document, import_document};
use crate::registry::ContextRegistry;
use crate::undo::{Command, UndoHistory};
use crate::{CodapError, DataContext, DataContextId};
use std::collections::BTreeSet;

/// A snapshot handed to the saver.
///
/// Returned by `Document::begin_save` and given back to `finish_save`.
#[derive(Debug, Clone)]
pub struct SaveTicket {
    pub spec: DocumentSpec,
    contexts: BTreeSet<DataContextId>,
}

impl SaveTicket {
    /// Contexts whose unsaved changes this snapshot covers.
    #[must_use]
    pub fn contexts(&self) -> &BTreeSet<DataContextId> {
        &self.contexts
    }
}

/// An open document.
#[derive(Debug, Default)]
pub struct Document {
    contexts: ContextRegistry,
    history: UndoHistory,
    dirty: BTreeSet<DataContextId>,
    save_in_flight: bool,
    save_requested: bool,
}

impl Document {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A document whose history keeps at most `capacity` commands.
    #[must_use]
    pub fn with_history_capacity(capacity: usize) -> Self {
        Self {
            history: UndoHistory::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Rebuild a document from its persisted form. Nothing is dirty.
    pub fn from_spec(spec: DocumentSpec, history_capacity: usize) -> Result<Self, CodapError> {
        Ok(Self {
            contexts: import_document(spec)?,
            history: UndoHistory::with_capacity(history_capacity),
            ..Self::default()
        })
    }

    #[must_use]
    pub fn to_spec(&self) -> DocumentSpec {
        export_document(&self.contexts)
    }

    pub fn set_invariant_mode(&mut self, mode: InvariantMode) {
        self.contexts.set_invariant_mode(mode);
    }

    // =========================================================================
    // CONTEXTS
    // =========================================================================

    #[must_use]
    pub fn contexts(&self) -> &ContextRegistry {
        &self.contexts
    }

    #[must_use]
    pub fn context(&self, id: DataContextId) -> Option<&DataContext> {
        self.contexts.get(id)
    }

    /// Resolve a context by name or numeric ID.
    #[must_use]
    pub fn resolve(&self, key: &str) -> Option<DataContextId> {
        self.contexts.resolve(key)
    }

    /// Find or create the context called `name`.
    pub fn create_context(&mut self, name: &str, title: Option<&str>) -> DataContextId {
        let existed = self.contexts.by_name(name).is_some();
        let id = self.contexts.create(name);
        if !existed {
            if let (Some(title), Some(ctx)) = (title, self.contexts.get_mut(id)) {
                ctx.set_title(title);
            }
            self.dirty_current_document(id);
        }
        id
    }

    /// Destroy and drop a context. Returns false when it was not registered.
    pub fn remove_context(&mut self, id: DataContextId) -> bool {
        if !self.contexts.remove(id) {
            return false;
        }
        self.dirty.remove(&id);
        // Commands may still reference the removed context.
        self.history.clear();
        true
    }

    // =========================================================================
    // MUTATION
    // =========================================================================

    /// Apply a change without recording it in the history.
    pub fn apply_change(
        &mut self,
        context: DataContextId,
        change: impl Into<Change>,
    ) -> Result<ChangeResult, CodapError> {
        let ctx = self.contexts.require_mut(context)?;
        let result = ctx.apply_change(change);
        if ctx.take_dirty() {
            self.dirty_current_document(context);
        }
        Ok(result)
    }

    /// Run an undoable command.
    pub fn execute(&mut self, command: Box<dyn Command>) -> Result<ChangeResult, CodapError> {
        let outcome = self.history.execute(command, &mut self.contexts);
        self.collect_dirty();
        outcome
    }

    /// Undo the latest command. Returns its undo label.
    pub fn undo(&mut self) -> Result<String, CodapError> {
        let outcome = self.history.undo(&mut self.contexts);
        self.collect_dirty();
        outcome
    }

    /// Redo the latest undone command. Returns its redo label.
    pub fn redo(&mut self) -> Result<String, CodapError> {
        let outcome = self.history.redo(&mut self.contexts);
        self.collect_dirty();
        outcome
    }

    #[must_use]
    pub fn history(&self) -> &UndoHistory {
        &self.history
    }

    /// Mark a context as having unsaved changes.
    ///
    /// Outside a running command this also clears the undo history.
    pub fn dirty_current_document(&mut self, context: DataContextId) {
        self.dirty.insert(context);
        if !self.history.is_executing() && (self.history.can_undo() || self.history.can_redo()) {
            tracing::debug!(context = %context, "document changed outside a command, clearing history");
            self.history.clear();
        }
    }

    /// Move per-context dirty flags raised by commands into the dirty set.
    fn collect_dirty(&mut self) {
        for ctx in self.contexts.iter_mut() {
            if ctx.take_dirty() {
                self.dirty.insert(ctx.id());
            }
        }
    }

    /// End of turn: deliver every context's queued notices.
    pub fn flush_notifications(&mut self) -> usize {
        self.contexts
            .iter_mut()
            .map(DataContext::flush_notifications)
            .sum()
    }

    // =========================================================================
    // SAVING
    // =========================================================================

    /// Contexts with unsaved changes.
    #[must_use]
    pub fn changed_contexts(&self) -> &BTreeSet<DataContextId> {
        &self.dirty
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    #[must_use]
    pub fn is_saving(&self) -> bool {
        self.save_in_flight
    }

    /// Start a save.
    ///
    /// Returns `None` when a save is already in flight; the request is
    /// remembered and reported by `finish_save`.
    pub fn begin_save(&mut self) -> Option<SaveTicket> {
        if self.save_in_flight {
            self.save_requested = true;
            tracing::debug!("save already in flight, coalescing request");
            return None;
        }
        self.collect_dirty();
        self.save_in_flight = true;
        Some(SaveTicket {
            spec: self.to_spec(),
            contexts: std::mem::take(&mut self.dirty),
        })
    }

    /// Complete a save started with `begin_save`.
    ///
    /// On failure the ticket's contexts are dirty again. Returns true when a
    /// save was requested meanwhile and the caller should save again.
    pub fn finish_save(&mut self, ticket: SaveTicket, outcome: Result<(), CodapError>) -> bool {
        self.save_in_flight = false;
        if let Err(e) = outcome {
            tracing::warn!("save failed: {}", e);
            self.dirty.extend(ticket.contexts);
        }
        std::mem::take(&mut self.save_requested)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;
    use crate::attribute::AttributeSpec;
    use crate::change::{CaseSpec, ChangeRequest};
    use crate::commands::command_for_change;

    fn document() -> (Document, DataContextId) {
        let mut doc = Document::new();
        let id = doc.create_context("Mammals", Some("Mammal facts"));
        doc.apply_change(
            id,
            ChangeRequest::CreateCollection {
                name: "Animals".to_string(),
                title: None,
                parent: None,
                attributes: vec![AttributeSpec::named("name")],
                attribute_order: vec![],
            },
        )
        .expect("collection");
        (doc, id)
    }

    fn create_case(id: DataContextId, name: &str) -> Box<dyn Command> {
        command_for_change(
            id,
            ChangeRequest::CreateCases {
                collection: None,
                cases: vec![CaseSpec::root(vec![Value::from(name)])],
            },
        )
        .expect("undoable")
    }

    #[test]
    fn commands_mark_dirty_without_clearing_history() {
        let (mut doc, id) = document();
        assert_eq!(doc.context(id).map(DataContext::title), Some("Mammal facts"));
        let ticket = doc.begin_save().expect("save");
        doc.finish_save(ticket, Ok(()));
        assert!(!doc.is_dirty());

        doc.execute(create_case(id, "Bat")).expect("execute");
        assert!(doc.changed_contexts().contains(&id));
        assert!(doc.history().can_undo());

        doc.undo().expect("undo");
        assert_eq!(doc.context(id).map(DataContext::case_count), Some(0));
        doc.redo().expect("redo");
        assert_eq!(doc.context(id).map(DataContext::case_count), Some(1));
    }

    #[test]
    fn bare_change_clears_history() {
        let (mut doc, id) = document();
        doc.execute(create_case(id, "Bat")).expect("execute");
        assert!(doc.history().can_undo());

        doc.apply_change(
            id,
            ChangeRequest::CreateCases {
                collection: None,
                cases: vec![CaseSpec::root(vec![Value::from("Owl")])],
            },
        )
        .expect("apply");
        assert!(!doc.history().can_undo());
    }

    #[test]
    fn selection_outside_command_keeps_history() {
        let (mut doc, id) = document();
        doc.execute(create_case(id, "Bat")).expect("execute");
        doc.apply_change(
            id,
            ChangeRequest::SelectCases {
                cases: None,
                select: true,
                extend: false,
                descendants: true,
            },
        )
        .expect("select");
        assert!(doc.history().can_undo());
    }

    #[test]
    fn unknown_context_is_an_error() {
        let (mut doc, _) = document();
        let outcome = doc.apply_change(DataContextId(999), ChangeRequest::ResetCollections);
        assert!(matches!(outcome, Err(CodapError::ContextNotFound(_))));
    }

    #[test]
    fn save_requests_coalesce() {
        let (mut doc, id) = document();
        let ticket = doc.begin_save().expect("first save");
        assert!(ticket.contexts().contains(&id));
        assert!(!doc.is_dirty());
        assert!(doc.is_saving());

        assert!(doc.begin_save().is_none());
        assert!(doc.begin_save().is_none());
        assert!(doc.finish_save(ticket, Ok(())), "a coalesced request is pending");

        let ticket = doc.begin_save().expect("second save");
        assert!(!doc.finish_save(ticket, Ok(())));
    }

    #[test]
    fn failed_save_remarks_dirty() {
        let (mut doc, id) = document();
        let ticket = doc.begin_save().expect("save");
        assert!(!doc.is_dirty());
        doc.finish_save(ticket, Err(CodapError::IoError("disk full".to_string())));
        assert!(doc.changed_contexts().contains(&id));
    }

    #[test]
    fn spec_round_trip_starts_clean() {
        let (mut doc, id) = document();
        doc.execute(create_case(id, "Bat")).expect("execute");
        let restored = Document::from_spec(doc.to_spec(), 10).expect("restore");
        assert!(!restored.is_dirty());
        assert!(!restored.history().can_undo());
        assert_eq!(restored.history().capacity(), 10);
        assert_eq!(restored.to_spec(), doc.to_spec());
    }

    #[test]
    fn flush_reaches_every_context() {
        let (mut doc, id) = document();
        let other = doc.create_context("Birds", None);
        assert_ne!(id, other);
        assert!(doc.flush_notifications() >= 2);
        assert_eq!(doc.flush_notifications(), 0);

        assert!(doc.remove_context(other));
        assert!(!doc.remove_context(other));
        assert_eq!(doc.resolve("Mammals"), Some(id));
    }
}

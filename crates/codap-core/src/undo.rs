//! # Undo History
//!
//! Linear undo/redo over `Command` objects.
//!
//! Commands are plain structs holding their own before/after snapshots.
//! They receive the `ContextRegistry` on every call rather than capturing
//! it, so a command can be replayed against whatever contexts are current.
//!
//! Undoing a delete (or redoing a create) brings cases back under fresh
//! IDs. The history hands that old→new remap to every other command it
//! holds, so older commands keep pointing at the same rows.

use crate::change::ChangeResult;
use crate::primitives::DEFAULT_UNDO_CAPACITY;
use crate::registry::ContextRegistry;
use crate::{CaseId, CodapError, DataContextId};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// A reversible unit of user-visible work.
pub trait Command: fmt::Debug + Send {
    /// Machine name, e.g. `"deleteCases"`.
    fn name(&self) -> &'static str;

    /// The data context the command operates on.
    fn context(&self) -> DataContextId;

    /// Human-readable description used for menu labels.
    fn description(&self) -> String;

    fn undo_label(&self) -> String {
        format!("Undo {}", self.description())
    }

    fn redo_label(&self) -> String {
        format!("Redo {}", self.description())
    }

    /// Audit line for the last execution, if the command records one.
    fn log(&self) -> Option<String> {
        None
    }

    fn execute(&mut self, contexts: &mut ContextRegistry) -> Result<ChangeResult, CodapError>;

    fn undo(&mut self, contexts: &mut ContextRegistry) -> Result<(), CodapError>;

    /// Defaults to running `execute` again.
    fn redo(&mut self, contexts: &mut ContextRegistry) -> Result<(), CodapError> {
        self.execute(contexts).map(|_| ())
    }

    /// Cases the last undo or redo recreated under new IDs, old→new.
    fn case_remap(&self) -> Option<&BTreeMap<CaseId, CaseId>> {
        None
    }

    /// Rewrite recorded case IDs after another command recreated them.
    fn remap_cases(&mut self, _remap: &BTreeMap<CaseId, CaseId>) {}
}

/// Undo and redo stacks with a bounded depth.
#[derive(Debug)]
pub struct UndoHistory {
    undo_stack: VecDeque<Box<dyn Command>>,
    redo_stack: Vec<Box<dyn Command>>,
    capacity: usize,
    executing: bool,
    last_log: Option<String>,
}

impl Default for UndoHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_UNDO_CAPACITY)
    }
}

impl UndoHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A history keeping at most `capacity` undoable commands (minimum 1).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            capacity: capacity.max(1),
            executing: false,
            last_log: None,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Run a command and, if it succeeds, make it the top of the undo stack.
    ///
    /// A failing command is dropped as if it never ran.
    pub fn execute(
        &mut self,
        mut command: Box<dyn Command>,
        contexts: &mut ContextRegistry,
    ) -> Result<ChangeResult, CodapError> {
        self.executing = true;
        let outcome = command.execute(contexts);
        self.executing = false;

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(command = command.name(), "command failed: {}", e);
                return Err(e);
            }
        };

        self.last_log = Some(command.log().unwrap_or_else(|| command.description()));
        tracing::debug!(command = command.name(), context = %command.context(), "executed command");
        self.undo_stack.push_back(command);
        while self.undo_stack.len() > self.capacity {
            self.undo_stack.pop_front();
        }
        self.redo_stack.clear();
        Ok(result)
    }

    /// Undo the most recent command. Returns its undo label.
    ///
    /// If the command cannot be undone the history is no longer
    /// trustworthy and both stacks are cleared.
    pub fn undo(&mut self, contexts: &mut ContextRegistry) -> Result<String, CodapError> {
        let mut command = self
            .undo_stack
            .pop_back()
            .ok_or(CodapError::HistoryEmpty("undo"))?;
        let label = command.undo_label();

        self.executing = true;
        let outcome = command.undo(contexts);
        self.executing = false;

        match outcome {
            Ok(()) => {
                self.propagate_remap(command.as_ref());
                self.redo_stack.push(command);
                Ok(label)
            }
            Err(e) => {
                tracing::warn!(command = command.name(), "undo failed, clearing history: {}", e);
                self.clear();
                Err(e)
            }
        }
    }

    /// Redo the most recently undone command. Returns its redo label.
    pub fn redo(&mut self, contexts: &mut ContextRegistry) -> Result<String, CodapError> {
        let mut command = self
            .redo_stack
            .pop()
            .ok_or(CodapError::HistoryEmpty("redo"))?;
        let label = command.redo_label();

        self.executing = true;
        let outcome = command.redo(contexts);
        self.executing = false;

        match outcome {
            Ok(()) => {
                self.propagate_remap(command.as_ref());
                self.undo_stack.push_back(command);
                Ok(label)
            }
            Err(e) => {
                tracing::warn!(command = command.name(), "redo failed, clearing history: {}", e);
                self.clear();
                Err(e)
            }
        }
    }

    fn propagate_remap(&mut self, source: &dyn Command) {
        let Some(remap) = source.case_remap().filter(|m| !m.is_empty()) else {
            return;
        };
        for command in self.undo_stack.iter_mut().chain(self.redo_stack.iter_mut()) {
            command.remap_cases(remap);
        }
        tracing::debug!(command = source.name(), remapped = remap.len(), "remapped history");
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    #[must_use]
    pub fn undo_label(&self) -> Option<String> {
        self.undo_stack.back().map(|c| c.undo_label())
    }

    #[must_use]
    pub fn redo_label(&self) -> Option<String> {
        self.redo_stack.last().map(|c| c.redo_label())
    }

    /// Descriptions of undoable commands, most recent first.
    #[must_use]
    pub fn undo_entries(&self) -> Vec<String> {
        self.undo_stack.iter().rev().map(|c| c.description()).collect()
    }

    /// Descriptions of redoable commands, next redo first.
    #[must_use]
    pub fn redo_entries(&self) -> Vec<String> {
        self.redo_stack.iter().rev().map(|c| c.description()).collect()
    }

    /// True while a command's execute, undo or redo is running.
    #[must_use]
    pub fn is_executing(&self) -> bool {
        self.executing
    }

    /// Log line of the last executed command.
    #[must_use]
    pub fn last_log(&self) -> Option<&str> {
        self.last_log.as_deref()
    }
}

// =============================================================================
// TESTS
// =============================================================================

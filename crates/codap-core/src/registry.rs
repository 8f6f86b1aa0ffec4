//! # Context Registry
//!
//! The set of live data contexts in one document, passed explicitly to
//! whoever needs it (commands, the document, the HTTP state) instead of
//! living in a global map.

use crate::data_context::DataContext;
use crate::diagnostics::InvariantMode;
use crate::{CodapError, DataContextId};
use std::collections::BTreeMap;

/// Create / lookup / remove / clear for data contexts.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    contexts: BTreeMap<DataContextId, DataContext>,
    next_id: u64,
    invariant_mode: InvariantMode,
}

impl ContextRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Mode handed to every context created from now on.
    pub fn set_invariant_mode(&mut self, mode: InvariantMode) {
        self.invariant_mode = mode;
        for context in self.contexts.values_mut() {
            context.set_invariant_mode(mode);
        }
    }

    /// Find the context called `name`, or create it.
    pub fn create(&mut self, name: &str) -> DataContextId {
        if let Some(existing) = self.by_name(name) {
            return existing.id();
        }
        let id = DataContextId(self.next_id.max(1));
        self.next_id = id.0.saturating_add(1);
        let mut context = DataContext::new(id, name);
        context.set_invariant_mode(self.invariant_mode);
        tracing::debug!(context = %id, name, "created data context");
        self.contexts.insert(id, context);
        id
    }

    /// Register an already built context (e.g. one restored from disk).
    ///
    /// A context with the same ID is destroyed and replaced.
    pub fn insert(&mut self, mut context: DataContext) -> DataContextId {
        let id = context.id();
        context.set_invariant_mode(self.invariant_mode);
        if let Some(mut old) = self.contexts.insert(id, context) {
            old.destroy();
        }
        if id.0 >= self.next_id {
            self.next_id = id.0.saturating_add(1);
        }
        id
    }

    #[must_use]
    pub fn get(&self, id: DataContextId) -> Option<&DataContext> {
        self.contexts.get(&id)
    }

    pub fn get_mut(&mut self, id: DataContextId) -> Option<&mut DataContext> {
        self.contexts.get_mut(&id)
    }

    /// Like `get_mut`, for callers that propagate with `?`.
    pub fn require_mut(&mut self, id: DataContextId) -> Result<&mut DataContext, CodapError> {
        self.contexts
            .get_mut(&id)
            .ok_or_else(|| CodapError::ContextNotFound(id.to_string()))
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&DataContext> {
        self.contexts.values().find(|c| c.name() == name)
    }

    /// Resolve a context by name, or by its numeric ID written as text.
    #[must_use]
    pub fn resolve(&self, key: &str) -> Option<DataContextId> {
        if let Some(context) = self.by_name(key) {
            return Some(context.id());
        }
        key.parse::<u64>()
            .ok()
            .map(DataContextId)
            .filter(|id| self.contexts.contains_key(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = DataContextId> + '_ {
        self.contexts.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataContext> {
        self.contexts.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DataContext> {
        self.contexts.values_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Destroy and unregister one context.
    pub fn remove(&mut self, id: DataContextId) -> bool {
        match self.contexts.remove(&id) {
            Some(mut context) => {
                context.destroy();
                true
            }
            None => false,
        }
    }

    /// Destroy every context.
    pub fn clear(&mut self) {
        for context in self.contexts.values_mut() {
            context.destroy();
        }
        self.contexts.clear();
    }
}

// =============================================================================
// TESTS
// =============================================================================

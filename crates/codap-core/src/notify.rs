//! # Notification Bus
//!
//! Explicit subscription lists with deferred delivery.
//!
//! Mutations `post` notices while they run; nothing is delivered until the
//! owner calls `flush` at the end of the processing turn. Every mutation of
//! one logical operation is therefore visible before any observer reacts,
//! and repeated counter notices within a turn collapse into the latest one.

use crate::{CaseId, CollectionId, DataContextId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle returned by `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

/// A notice that may replace an earlier pending notice of the same kind.
pub trait Notice: Clone + fmt::Debug {
    /// Whether `self` makes a still-pending `earlier` notice redundant.
    fn supersedes(&self, _earlier: &Self) -> bool {
        false
    }
}

type Handler<E> = Box<dyn FnMut(&E) + Send>;

/// Subscriber list plus the queue of notices waiting for the end of the turn.
pub struct NotificationBus<E> {
    subscribers: Vec<(SubscriptionId, Handler<E>)>,
    pending: Vec<E>,
    next_id: u64,
}

impl<E> Default for NotificationBus<E> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            pending: Vec::new(),
            next_id: 1,
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for NotificationBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationBus")
            .field("subscribers", &self.subscribers.len())
            .field("pending", &self.pending)
            .finish()
    }
}

impl<E: Notice> NotificationBus<E> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. It sees every notice flushed from now on.
    pub fn subscribe(&mut self, handler: impl FnMut(&E) + Send + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        self.subscribers.push((id, Box::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        before != self.subscribers.len()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Queue a notice for the end of the turn.
    pub fn post(&mut self, notice: E) {
        self.pending.retain(|earlier| !notice.supersedes(earlier));
        self.pending.push(notice);
    }

    /// Notices waiting for delivery.
    #[must_use]
    pub fn pending(&self) -> &[E] {
        &self.pending
    }

    /// Deliver every pending notice to every subscriber, in posting order.
    ///
    /// Returns the number of notices delivered.
    pub fn flush(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending);
        for notice in &pending {
            for (_, handler) in &mut self.subscribers {
                handler(notice);
            }
        }
        pending.len()
    }

    /// Drop every subscriber and pending notice.
    pub fn clear(&mut self) {
        self.subscribers.clear();
        self.pending.clear();
    }
}

// =============================================================================
// DATA CONTEXT NOTIFICATIONS
// =============================================================================

/// What a data context tells its observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Notification {
    /// New changes are available; query `new_changes`.
    ChangeCountChanged {
        context: DataContextId,
        change_count: u64,
    },
    /// A selection set's membership flipped.
    SelectionCountChanged {
        context: DataContextId,
        selection_change_count: u64,
    },
    /// Cases were added to, removed from or reordered in a collection.
    CollectionChanged {
        context: DataContextId,
        collection: CollectionId,
    },
    /// A case's values changed (one notice per value batch).
    CaseValuesChanged {
        context: DataContextId,
        case: CaseId,
    },
    /// Persisted document state changed.
    DocumentDirtied { context: DataContextId },
    /// The context was torn down.
    ContextDestroyed { context: DataContextId },
}

impl Notice for Notification {
    fn supersedes(&self, earlier: &Self) -> bool {
        use Notification as N;
        match (self, earlier) {
            (N::ChangeCountChanged { context: a, .. }, N::ChangeCountChanged { context: b, .. })
            | (
                N::SelectionCountChanged { context: a, .. },
                N::SelectionCountChanged { context: b, .. },
            )
            | (N::DocumentDirtied { context: a }, N::DocumentDirtied { context: b }) => a == b,
            (
                N::CollectionChanged {
                    context: a,
                    collection: x,
                },
                N::CollectionChanged {
                    context: b,
                    collection: y,
                },
            ) => a == b && x == y,
            (
                N::CaseValuesChanged { context: a, case: x },
                N::CaseValuesChanged { context: b, case: y },
            ) => a == b && x == y,
            _ => false,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

//! # codap-core
//!
//! The hierarchical case-data engine for CODAP - THE LOGIC.
//!
//! A data context owns a linear chain of collections (parent-most first).
//! Every case in a child collection points at exactly one parent case in
//! the collection above it. All mutation goes through
//! `DataContext::apply_change`, which logs the change, bumps the change
//! count and queues notifications that observers receive at the end of the
//! turn.
//!
//! ## Layers
//!
//! - `types`, `case`, `attribute`, `collection`, `cases_controller`: the model
//! - `data_context`, `change`, `notify`: change dispatch and notification
//! - `undo`, `commands`: reversible commands over change requests
//! - `row_index`: flattened, collapsible row view for case tables
//! - `registry`, `document`: the open document and its save guard
//! - `export`, `formats`: the persisted form and its binary encoding
//!
//! ## Architectural Constraints
//!
//! - Single writer: no locks, no async, every change runs to completion
//! - Arena model: parent/child links are IDs resolved through the context
//! - Deterministic: ordered maps for every keyed store

// =============================================================================
// MODULES
// =============================================================================

pub mod attribute;
pub mod case;
pub mod cases_controller;
pub mod change;
pub mod collection;
pub mod commands;
pub mod data_context;
pub mod diagnostics;
pub mod document;
pub mod export;
pub mod formats;
pub mod notify;
pub mod primitives;
pub mod registry;
pub mod row_index;
pub mod types;
pub mod undo;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    AttributeId, AttributeType, CaseId, CodapError, CollectionId, DataContextId, IdAllocator,
    Value,
};

// =============================================================================
// RE-EXPORTS: Model
// =============================================================================

pub use attribute::{Attribute, AttributeRef, AttributeSpec};
pub use case::Case;
pub use cases_controller::CasesController;
pub use collection::Collection;
pub use data_context::DataContext;
pub use diagnostics::InvariantMode;

// =============================================================================
// RE-EXPORTS: Changes, Notifications, Undo
// =============================================================================

pub use change::{
    CaseSpec, CaseValues, Change, ChangeRecord, ChangeRequest, ChangeResult, CollectionRef,
    Operation,
};
pub use commands::command_for_change;
pub use document::{Document, SaveTicket};
pub use notify::{Notice, Notification, NotificationBus, SubscriptionId};
pub use registry::ContextRegistry;
pub use row_index::{CaseTableRowIndex, RowIndexEvent};
pub use undo::{Command, UndoHistory};

// =============================================================================
// RE-EXPORTS: Persisted Form (from export and formats modules)
// =============================================================================

pub use export::{
    CaseRecord, CollectionSpec, ContextSpec, DocumentSpec, export_context, export_document,
    import_context, import_document,
};
pub use formats::{PersistenceHeader, document_from_bytes, document_to_bytes};

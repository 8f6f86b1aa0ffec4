//! # Core Type Definitions
//!
//! This module contains the shared vocabulary of the case-data engine:
//! - Identifiers (`CaseId`, `AttributeId`, `CollectionId`, `DataContextId`)
//! - Untyped case values (`Value`)
//! - Attribute kinds (`AttributeType`)
//! - The ID allocator owned by each data context
//! - Error types (`CodapError`)
//!
//! ## Identity Guarantees
//!
//! All identifiers:
//! - Are plain `u64` newtypes, `Copy` and `Ord` for use as `BTreeMap` keys
//! - Are allocated monotonically and never reused inside one data context
//! - Are stable within one serialization, but NOT across an undo-driven
//!   delete + recreate cycle (recreated cases receive fresh IDs)

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Identifier of a single case (row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(pub u64);

/// Identifier of an attribute (column definition).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeId(pub u64);

/// Identifier of a collection (one level of the hierarchy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(pub u64);

/// Identifier of a data context (one hierarchical dataset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataContextId(pub u64);

macro_rules! impl_id_display {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

impl_id_display!(CaseId, AttributeId, CollectionId, DataContextId);

// =============================================================================
// ID ALLOCATOR
// =============================================================================

/// Monotonic ID source shared by every entity kind inside one data context.
///
/// A single counter is used for cases, attributes and collections so that
/// an ID printed in a log line is never ambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAllocator {
    next: u64,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl IdAllocator {
    /// Create an allocator starting at 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an allocator that continues after `next`.
    #[must_use]
    pub fn starting_at(next: u64) -> Self {
        Self { next: next.max(1) }
    }

    /// The next raw ID that would be handed out.
    #[must_use]
    pub fn peek(&self) -> u64 {
        self.next
    }

    /// Make sure future IDs are strictly greater than `seen`.
    pub fn observe(&mut self, seen: u64) {
        if seen >= self.next {
            self.next = seen.saturating_add(1);
        }
    }

    fn take(&mut self) -> u64 {
        let id = self.next;
        self.next = self.next.saturating_add(1);
        id
    }

    pub fn case_id(&mut self) -> CaseId {
        CaseId(self.take())
    }

    pub fn attribute_id(&mut self) -> AttributeId {
        AttributeId(self.take())
    }

    pub fn collection_id(&mut self) -> CollectionId {
        CollectionId(self.take())
    }
}

// =============================================================================
// VALUE
// =============================================================================

/// An untyped scalar stored in a case.
///
/// Serialized untagged so that JSON descriptors read naturally:
/// `null` is `Missing`, `true` is `Bool`, `1.5` is `Number`, `"x"` is `String`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// The distinguished "no value" sentinel.
    #[default]
    Missing,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Value {
    /// Check whether this is the missing sentinel.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    /// Numeric view of the value, if it is a number.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// String view of the value, if it is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => Ok(()),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => f.write_str(s),
        }
    }
}

// =============================================================================
// ATTRIBUTE TYPE
// =============================================================================

/// The declared kind of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    /// Not declared; inferred by consumers.
    #[default]
    None,
    Categorical,
    Numeric,
    Date,
    Qualitative,
    Boundary,
    Checkbox,
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the CODAP core.
///
/// Per-item validation failures inside a batch change are reported through
/// `ChangeResult { success: false, .. }` and never surface here; this type
/// covers whole-operation failures and I/O.
#[derive(Debug, Error)]
pub enum CodapError {
    /// The requested data context is not registered.
    #[error("Data context not found: {0}")]
    ContextNotFound(String),

    /// The requested collection does not exist in the data context.
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    /// The requested case does not exist.
    #[error("Case not found: {0}")]
    CaseNotFound(CaseId),

    /// The requested attribute does not exist.
    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    /// A case referenced a parent that is missing or in the wrong collection.
    #[error("Invalid parent case: {0:?}")]
    InvalidParent(Option<CaseId>),

    /// A change was applied but reported `success: false`.
    #[error("Change failed: {0}")]
    ChangeFailed(String),

    /// The data context was destroyed and can no longer be mutated.
    #[error("Data context destroyed: {0}")]
    ContextDestroyed(DataContextId),

    /// Undo or redo was requested with nothing on the stack.
    #[error("Nothing to {0}")]
    HistoryEmpty(&'static str),

    /// A save was requested while another save is still in flight.
    #[error("A save is already in progress")]
    SaveInProgress,

    /// A serialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A deserialization error occurred.
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),
}

// =============================================================================
// TESTS
// =============================================================================

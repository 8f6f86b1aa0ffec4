//! # Change Descriptors
//!
//! The closed vocabulary accepted by `DataContext::apply_change`, the result
//! each operation reports, and the record appended to the change log.
//!
//! Descriptors serialize with an `operation` tag so that external
//! requests read as `{"operation": "selectCases", "cases": [4], ...}`.

use crate::attribute::{AttributeRef, AttributeSpec};
use crate::{AttributeId, CaseId, CollectionId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// REFERENCES & SPECS
// =============================================================================

/// Reference to a collection by ID or by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CollectionRef {
    Id(CollectionId),
    Name(String),
}

impl From<CollectionId> for CollectionRef {
    fn from(id: CollectionId) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for CollectionRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "#{}", id),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// Values supplied for a new case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CaseValues {
    /// Flattened positional values. Under a parent, the parent's own value
    /// vector is prepended before assignment.
    Positional(Vec<Value>),
    /// Values keyed by attribute name.
    Named(BTreeMap<String, Value>),
}

impl Default for CaseValues {
    fn default() -> Self {
        Self::Positional(Vec::new())
    }
}

/// One case to create.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaseSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<CaseId>,
    pub values: CaseValues,
    /// Display position in the collection; appended when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl CaseSpec {
    /// A root-level case with positional values.
    #[must_use]
    pub fn root(values: Vec<Value>) -> Self {
        Self {
            values: CaseValues::Positional(values),
            ..Self::default()
        }
    }

    /// A case under `parent` with positional (own) values.
    #[must_use]
    pub fn child(parent: CaseId, values: Vec<Value>) -> Self {
        Self {
            parent: Some(parent),
            values: CaseValues::Positional(values),
            index: None,
        }
    }

    /// A case with values keyed by attribute name.
    #[must_use]
    pub fn named(parent: Option<CaseId>, values: BTreeMap<String, Value>) -> Self {
        Self {
            parent,
            values: CaseValues::Named(values),
            index: None,
        }
    }

    #[must_use]
    pub fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }
}

fn default_true() -> bool {
    true
}

// =============================================================================
// CHANGE REQUEST
// =============================================================================

/// The operation-specific part of a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "operation",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ChangeRequest {
    CreateCollection {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<CollectionRef>,
        #[serde(default)]
        attributes: Vec<AttributeSpec>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attribute_order: Vec<String>,
    },
    CreateCase {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collection: Option<CollectionRef>,
        case: CaseSpec,
    },
    CreateCases {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collection: Option<CollectionRef>,
        cases: Vec<CaseSpec>,
    },
    UpdateCases {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collection: Option<CollectionRef>,
        cases: Vec<CaseId>,
        /// Per-case full vectors, or attribute-major when `attribute_ids` is set.
        values: Vec<Vec<Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attribute_ids: Option<Vec<AttributeId>>,
    },
    DeleteCases {
        cases: Vec<CaseId>,
    },
    SelectCases {
        /// `None` means every case in every collection.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cases: Option<Vec<CaseId>>,
        #[serde(default = "default_true")]
        select: bool,
        #[serde(default)]
        extend: bool,
        /// Whether selection cascades to each case's subtree.
        #[serde(default = "default_true")]
        descendants: bool,
    },
    CreateAttributes {
        collection: CollectionRef,
        attributes: Vec<AttributeSpec>,
        /// Display position of the first new attribute; `None` appends.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<usize>,
    },
    UpdateAttributes {
        collection: CollectionRef,
        attributes: Vec<AttributeSpec>,
    },
    DeleteAttributes {
        collection: CollectionRef,
        attributes: Vec<AttributeRef>,
    },
    ResetCollections,
}

impl ChangeRequest {
    /// The operation tag of this request.
    #[must_use]
    pub fn operation(&self) -> Operation {
        match self {
            Self::CreateCollection { .. } => Operation::CreateCollection,
            Self::CreateCase { .. } => Operation::CreateCase,
            Self::CreateCases { .. } => Operation::CreateCases,
            Self::UpdateCases { .. } => Operation::UpdateCases,
            Self::DeleteCases { .. } => Operation::DeleteCases,
            Self::SelectCases { .. } => Operation::SelectCases,
            Self::CreateAttributes { .. } => Operation::CreateAttributes,
            Self::UpdateAttributes { .. } => Operation::UpdateAttributes,
            Self::DeleteAttributes { .. } => Operation::DeleteAttributes,
            Self::ResetCollections => Operation::ResetCollections,
        }
    }

    /// Number of cases named by the request, for boundary limits.
    #[must_use]
    pub fn case_count(&self) -> usize {
        match self {
            Self::CreateCase { .. } => 1,
            Self::CreateCases { cases, .. } => cases.len(),
            Self::UpdateCases { cases, .. } | Self::DeleteCases { cases } => cases.len(),
            Self::SelectCases { cases, .. } => cases.as_ref().map_or(0, Vec::len),
            _ => 0,
        }
    }
}

/// A change descriptor: the request plus the out-of-band completion flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// The caller asserts the effect already happened; only log it.
    #[serde(default, rename = "isComplete")]
    pub is_complete: bool,
    #[serde(flatten)]
    pub request: ChangeRequest,
}

impl Change {
    #[must_use]
    pub fn new(request: ChangeRequest) -> Self {
        Self {
            is_complete: false,
            request,
        }
    }

    /// A change whose effect was already applied elsewhere.
    #[must_use]
    pub fn completed(request: ChangeRequest) -> Self {
        Self {
            is_complete: true,
            request,
        }
    }

    #[must_use]
    pub fn operation(&self) -> Operation {
        self.request.operation()
    }
}

impl From<ChangeRequest> for Change {
    fn from(request: ChangeRequest) -> Self {
        Self::new(request)
    }
}

// =============================================================================
// OPERATION TAG
// =============================================================================

/// The closed set of operation tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    CreateCollection,
    CreateCase,
    CreateCases,
    UpdateCases,
    DeleteCases,
    SelectCases,
    CreateAttributes,
    UpdateAttributes,
    DeleteAttributes,
    ResetCollections,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateCollection => "createCollection",
            Self::CreateCase => "createCase",
            Self::CreateCases => "createCases",
            Self::UpdateCases => "updateCases",
            Self::DeleteCases => "deleteCases",
            Self::SelectCases => "selectCases",
            Self::CreateAttributes => "createAttributes",
            Self::UpdateAttributes => "updateAttributes",
            Self::DeleteAttributes => "deleteAttributes",
            Self::ResetCollections => "resetCollections",
        }
    }

    /// Selection does not dirty the persisted document.
    #[must_use]
    pub fn dirties_document(self) -> bool {
        self != Self::SelectCases
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// RESULT & RECORD
// =============================================================================

/// What an applied change reports back.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChangeResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_id: Option<CaseId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub case_ids: Vec<CaseId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<CollectionId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attr_ids: Vec<AttributeId>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub did_create_attribute: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deleted_case_ids: Vec<CaseId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub invalidated_attr_ids: Vec<AttributeId>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub selection_changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ChangeResult {
    #[must_use]
    pub fn success() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// One entry of the append-only change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// 1-based position in the log; equals `change_count` right after append.
    pub sequence: u64,
    /// The effective operation (may differ from the requested one).
    pub operation: Operation,
    pub is_complete: bool,
    pub request: ChangeRequest,
    pub result: ChangeResult,
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_cases_parses_with_defaults() {
        let json = r#"{"operation":"selectCases","cases":[4,5]}"#;
        let change: Change = serde_json::from_str(json).expect("parse");

        assert!(!change.is_complete);
        match change.request {
            ChangeRequest::SelectCases {
                cases,
                select,
                extend,
                descendants,
            } => {
                assert_eq!(cases, Some(vec![CaseId(4), CaseId(5)]));
                assert!(select);
                assert!(!extend);
                assert!(descendants);
            }
            other => unreachable!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn create_cases_accepts_positional_and_named_values() {
        let json = r#"{
            "operation": "createCases",
            "collection": "People",
            "cases": [
                {"parent": 1, "values": ["Ann", 30]},
                {"parent": 1, "values": {"name": "Bo"}, "index": 0}
            ]
        }"#;
        let change: Change = serde_json::from_str(json).expect("parse");
        let ChangeRequest::CreateCases { collection, cases } = change.request else {
            unreachable!("wrong variant");
        };
        assert_eq!(collection, Some(CollectionRef::Name("People".to_string())));
        assert_eq!(
            cases[0].values,
            CaseValues::Positional(vec![Value::from("Ann"), Value::from(30)])
        );
        assert!(matches!(cases[1].values, CaseValues::Named(_)));
        assert_eq!(cases[1].index, Some(0));
    }

    #[test]
    fn update_cases_uses_camel_case_fields() {
        let request = ChangeRequest::UpdateCases {
            collection: None,
            cases: vec![CaseId(3)],
            values: vec![vec![Value::from(1)]],
            attribute_ids: Some(vec![AttributeId(2)]),
        };
        let json = serde_json::to_string(&Change::new(request)).expect("serialize");
        assert!(json.contains("\"operation\":\"updateCases\""));
        assert!(json.contains("\"attributeIds\":[2]"));
        assert!(json.contains("\"isComplete\":false"));
    }

    #[test]
    fn reset_collections_is_a_bare_tag() {
        let change: Change =
            serde_json::from_str(r#"{"operation":"resetCollections","isComplete":true}"#)
                .expect("parse");
        assert!(change.is_complete);
        assert_eq!(change.operation(), Operation::ResetCollections);
    }

    #[test]
    fn only_selection_leaves_document_clean() {
        assert!(!Operation::SelectCases.dirties_document());
        assert!(Operation::UpdateCases.dirties_document());
        assert_eq!(Operation::CreateAttributes.to_string(), "createAttributes");
    }

    #[test]
    fn result_omits_empty_payload() {
        let json = serde_json::to_string(&ChangeResult::success()).expect("serialize");
        assert_eq!(json, r#"{"success":true}"#);
    }
}

//! # API Request/Response Types
//!
//! This module defines the JSON structures for the HTTP API.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use codap_core::{
    Attribute, CaseId, Change, ChangeRecord, ChangeResult, CodapError, CollectionId,
    DataContext, DataContextId, Document, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// ERRORS
// =============================================================================

/// Body of every failed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

/// A handler failure: status plus message.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<CodapError> for ApiError {
    fn from(error: CodapError) -> Self {
        let status = match &error {
            CodapError::ContextNotFound(_)
            | CodapError::CollectionNotFound(_)
            | CodapError::CaseNotFound(_)
            | CodapError::AttributeNotFound(_) => StatusCode::NOT_FOUND,
            CodapError::InvalidParent(_) | CodapError::ChangeFailed(_) => StatusCode::BAD_REQUEST,
            CodapError::ContextDestroyed(_)
            | CodapError::HistoryEmpty(_)
            | CodapError::SaveInProgress => StatusCode::CONFLICT,
            CodapError::SerializationError(_)
            | CodapError::DeserializationError(_)
            | CodapError::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("request failed: {}", self.message);
        }
        (
            self.status,
            Json(ErrorResponse {
                success: false,
                error: self.message,
            }),
        )
            .into_response()
    }
}

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// STATUS RESPONSE
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStatus {
    pub id: CollectionId,
    pub name: String,
    pub case_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextStatus {
    pub id: DataContextId,
    pub name: String,
    pub title: String,
    pub collections: Vec<CollectionStatus>,
    pub case_count: usize,
    pub change_count: u64,
    pub selection_change_count: u64,
}

impl From<&DataContext> for ContextStatus {
    fn from(ctx: &DataContext) -> Self {
        Self {
            id: ctx.id(),
            name: ctx.name().to_string(),
            title: ctx.title().to_string(),
            collections: ctx
                .collections()
                .iter()
                .map(|c| CollectionStatus {
                    id: c.id(),
                    name: c.name().to_string(),
                    case_count: c.case_count(),
                })
                .collect(),
            case_count: ctx.case_count(),
            change_count: ctx.change_count(),
            selection_change_count: ctx.selection_change_count(),
        }
    }
}

/// Document status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub contexts: Vec<ContextStatus>,
    pub dirty_contexts: Vec<DataContextId>,
    pub can_undo: bool,
    pub can_redo: bool,
    pub undo_label: Option<String>,
    pub redo_label: Option<String>,
}

impl From<&Document> for StatusResponse {
    fn from(doc: &Document) -> Self {
        let history = doc.history();
        Self {
            contexts: doc.contexts().iter().map(ContextStatus::from).collect(),
            dirty_contexts: doc.changed_contexts().iter().copied().collect(),
            can_undo: history.can_undo(),
            can_redo: history.can_redo(),
            undo_label: history.undo_label(),
            redo_label: history.redo_label(),
        }
    }
}

// =============================================================================
// CONTEXT CREATION
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContextRequest {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContextResponse {
    pub success: bool,
    pub id: DataContextId,
    pub name: String,
}

// =============================================================================
// CHANGES
// =============================================================================

fn default_undoable() -> bool {
    true
}

/// A change descriptor from a data interactive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEnvelope {
    /// Carries `isComplete` next to the operation fields.
    pub change: Change,
    /// Record the change in the undo history when it has a command.
    /// Completed changes are only logged and never enter the history.
    #[serde(default = "default_undoable")]
    pub undoable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeResponse {
    pub success: bool,
    pub result: ChangeResult,
    /// Whether the change went through the undo history.
    pub undoable: bool,
    pub change_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangesQuery {
    #[serde(default)]
    pub since: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub change_count: u64,
    pub selection_change_count: u64,
    pub changes: Vec<ChangeRecord>,
}

// =============================================================================
// COLLECTIONS
// =============================================================================

/// A case with values keyed by attribute name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseJson {
    pub id: CaseId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<CaseId>,
    pub values: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionResponse {
    pub id: CollectionId,
    pub name: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<CollectionId>,
    pub attributes: Vec<Attribute>,
    pub cases: Vec<CaseJson>,
    pub selection: Vec<CaseId>,
}

// =============================================================================
// ROWS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowJson {
    pub row: usize,
    pub case_id: CaseId,
    /// True when the row stands for a collapsed ancestor.
    pub collapsed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsResponse {
    pub collection: CollectionId,
    pub length: usize,
    pub rows: Vec<RowJson>,
    pub collapsed: Vec<CaseId>,
    /// Whether the request changed the collapsed set.
    #[serde(default)]
    pub changed: bool,
}

/// Collapse or expand one case, or every case with `all`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowActionRequest {
    #[serde(default)]
    pub case_id: Option<CaseId>,
    #[serde(default)]
    pub all: bool,
}

// =============================================================================
// HISTORY
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub success: bool,
    /// Label of the step just performed.
    pub label: String,
    pub can_undo: bool,
    pub can_redo: bool,
}

// =============================================================================
// EXPORT RESPONSE
// =============================================================================

/// Binary document export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResponse {
    pub success: bool,
    /// Base64 of the `CDAP` header plus postcard payload.
    pub data: Option<String>,
    pub size: usize,
    pub error: Option<String>,
}

impl ExportResponse {
    pub fn success(data: &[u8]) -> Self {
        Self {
            success: true,
            data: Some(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                data,
            )),
            size: data.len(),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            size: 0,
            error: Some(msg.into()),
        }
    }
}

//! # API Endpoint Handlers
//!
//! Each handler runs one turn: lock the workspace, act, flush
//! notifications, answer.

use super::{
    AppState,
    types::{
        ApiError, CaseJson, ChangeEnvelope, ChangeResponse, ChangesQuery, ChangesResponse,
        CollectionResponse, CreateContextRequest, CreateContextResponse, ExportResponse,
        HealthResponse, HistoryResponse, RowActionRequest, RowJson, RowsResponse,
        StatusResponse,
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use codap_core::{
    CaseTableRowIndex, CodapError, CollectionId, CollectionRef, DataContext, DataContextId,
    Document, command_for_change, document_to_bytes, primitives::MAX_NAME_LENGTH,
};
use std::collections::BTreeMap;

// =============================================================================
// LOOKUP HELPERS
// =============================================================================

/// Resolve a context path segment (name or numeric ID).
fn resolve_context(document: &Document, key: &str) -> Result<DataContextId, ApiError> {
    document
        .resolve(key)
        .ok_or_else(|| CodapError::ContextNotFound(key.to_string()).into())
}

/// Resolve a collection path segment: numeric ID first, then name.
fn resolve_collection(ctx: &DataContext, key: &str) -> Result<CollectionId, ApiError> {
    key.parse::<u64>()
        .ok()
        .and_then(|id| ctx.resolve_collection(&CollectionRef::Id(CollectionId(id))))
        .or_else(|| ctx.resolve_collection(&CollectionRef::Name(key.to_string())))
        .ok_or_else(|| CodapError::CollectionNotFound(key.to_string()).into())
}

fn resolve_table(
    document: &Document,
    context: &str,
    collection: &str,
) -> Result<(DataContextId, CollectionId), ApiError> {
    let id = resolve_context(document, context)?;
    let ctx = document
        .context(id)
        .ok_or_else(|| ApiError::from(CodapError::ContextNotFound(context.to_string())))?;
    Ok((id, resolve_collection(ctx, collection)?))
}

fn rows_response(collection: CollectionId, index: &CaseTableRowIndex, changed: bool) -> RowsResponse {
    RowsResponse {
        collection,
        length: index.get_length(),
        rows: index
            .rows()
            .iter()
            .enumerate()
            .map(|(row, id)| RowJson {
                row,
                case_id: *id,
                collapsed: index.is_group_collapsed(*id),
            })
            .collect(),
        collapsed: index.collapsed_cases().iter().copied().collect(),
        changed,
    }
}

// =============================================================================
// HEALTH & STATUS
// =============================================================================

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

/// Contexts, counters and history labels.
pub async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let workspace = state.workspace.lock().await;
    Json(StatusResponse::from(&workspace.document))
}

// =============================================================================
// CONTEXTS
// =============================================================================

/// Find or create a data context.
pub async fn create_context_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateContextRequest>,
) -> Result<Json<CreateContextResponse>, ApiError> {
    let name = request.name.trim();
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(ApiError::bad_request(format!(
            "context name must be 1 to {} bytes",
            MAX_NAME_LENGTH
        )));
    }

    let mut workspace = state.workspace.lock().await;
    let id = workspace
        .document
        .create_context(name, request.title.as_deref());
    workspace.document.flush_notifications();
    Ok(Json(CreateContextResponse {
        success: true,
        id,
        name: name.to_string(),
    }))
}

// =============================================================================
// CHANGES
// =============================================================================

/// Apply one change descriptor.
///
/// Undoable requests go through the undo history unless the envelope says
/// `undoable: false` or the change is already complete.
pub async fn apply_change_handler(
    State(state): State<AppState>,
    Path(context): Path<String>,
    Json(envelope): Json<ChangeEnvelope>,
) -> Result<Json<ChangeResponse>, ApiError> {
    let mut workspace = state.workspace.lock().await;
    let id = resolve_context(&workspace.document, &context)?;

    let command = (envelope.undoable && !envelope.change.is_complete)
        .then(|| command_for_change(id, envelope.change.request.clone()))
        .flatten();
    let undoable = command.is_some();
    let outcome = match command {
        Some(command) => workspace.document.execute(command),
        None => workspace.document.apply_change(id, envelope.change),
    };
    workspace.document.flush_notifications();

    let result = outcome?;
    if !result.success {
        return Err(ApiError::bad_request(
            result
                .message
                .unwrap_or_else(|| "change had no effect".to_string()),
        ));
    }
    let change_count = workspace
        .document
        .context(id)
        .map(DataContext::change_count)
        .unwrap_or_default();
    Ok(Json(ChangeResponse {
        success: true,
        result,
        undoable,
        change_count,
    }))
}

/// Changes logged after `since`.
pub async fn changes_handler(
    State(state): State<AppState>,
    Path(context): Path<String>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<ChangesResponse>, ApiError> {
    let workspace = state.workspace.lock().await;
    let id = resolve_context(&workspace.document, &context)?;
    let ctx = workspace
        .document
        .context(id)
        .ok_or_else(|| ApiError::from(CodapError::ContextNotFound(context.clone())))?;
    Ok(Json(ChangesResponse {
        change_count: ctx.change_count(),
        selection_change_count: ctx.selection_change_count(),
        changes: ctx.new_changes(query.since).to_vec(),
    }))
}

// =============================================================================
// COLLECTIONS & ROWS
// =============================================================================

/// Attributes, cases in display order and the selection of one collection.
pub async fn collection_handler(
    State(state): State<AppState>,
    Path((context, collection)): Path<(String, String)>,
) -> Result<Json<CollectionResponse>, ApiError> {
    let workspace = state.workspace.lock().await;
    let (id, collection_id) = resolve_table(&workspace.document, &context, &collection)?;
    let collection = workspace
        .document
        .context(id)
        .and_then(|ctx| ctx.collection(collection_id))
        .ok_or_else(|| ApiError::from(CodapError::CollectionNotFound(collection)))?;

    let names: BTreeMap<_, _> = collection
        .attributes()
        .iter()
        .map(|a| (a.id, a.name.clone()))
        .collect();
    let cases = collection
        .cases()
        .map(|case| CaseJson {
            id: case.id(),
            parent: case.parent(),
            values: case
                .values()
                .iter()
                .filter_map(|(attr, value)| names.get(attr).map(|n| (n.clone(), value.clone())))
                .collect(),
        })
        .collect();

    Ok(Json(CollectionResponse {
        id: collection.id(),
        name: collection.name().to_string(),
        title: collection.title().to_string(),
        parent: collection.parent_id(),
        attributes: collection.attributes().to_vec(),
        cases,
        selection: collection.selected_cases(),
    }))
}

/// The case table rows of one collection.
pub async fn rows_handler(
    State(state): State<AppState>,
    Path((context, collection)): Path<(String, String)>,
) -> Result<Json<RowsResponse>, ApiError> {
    let mut workspace = state.workspace.lock().await;
    let (id, collection_id) = resolve_table(&workspace.document, &context, &collection)?;
    let response = workspace.with_row_index(id, collection_id, |index, _| {
        rows_response(collection_id, index, false)
    })?;
    Ok(Json(response))
}

/// Collapse one ancestor case, or every parent case with `all`.
pub async fn collapse_handler(
    State(state): State<AppState>,
    Path((context, collection)): Path<(String, String)>,
    Json(request): Json<RowActionRequest>,
) -> Result<Json<RowsResponse>, ApiError> {
    let mut workspace = state.workspace.lock().await;
    let (id, collection_id) = resolve_table(&workspace.document, &context, &collection)?;
    let response = workspace.with_row_index(id, collection_id, |index, ctx| {
        let changed = match (request.all, request.case_id) {
            (true, _) => index.collapse_all(ctx) > 0,
            (false, Some(case)) => index.collapse_group(ctx, case),
            (false, None) => return Err(ApiError::bad_request("case_id or all is required")),
        };
        Ok(rows_response(collection_id, index, changed))
    })??;
    Ok(Json(response))
}

/// Expand one collapsed case, or everything with `all`.
pub async fn expand_handler(
    State(state): State<AppState>,
    Path((context, collection)): Path<(String, String)>,
    Json(request): Json<RowActionRequest>,
) -> Result<Json<RowsResponse>, ApiError> {
    let mut workspace = state.workspace.lock().await;
    let (id, collection_id) = resolve_table(&workspace.document, &context, &collection)?;
    let response = workspace.with_row_index(id, collection_id, |index, ctx| {
        let changed = match (request.all, request.case_id) {
            (true, _) => index.expand_all(ctx) > 0,
            (false, Some(case)) => index.expand_group(ctx, case),
            (false, None) => return Err(ApiError::bad_request("case_id or all is required")),
        };
        Ok(rows_response(collection_id, index, changed))
    })??;
    Ok(Json(response))
}

// =============================================================================
// HISTORY
// =============================================================================

fn history_response(document: &Document, label: String) -> HistoryResponse {
    HistoryResponse {
        success: true,
        label,
        can_undo: document.history().can_undo(),
        can_redo: document.history().can_redo(),
    }
}

/// Undo the latest command.
pub async fn undo_handler(State(state): State<AppState>) -> Result<Json<HistoryResponse>, ApiError> {
    let mut workspace = state.workspace.lock().await;
    let outcome = workspace.document.undo();
    workspace.document.flush_notifications();
    let label = outcome?;
    Ok(Json(history_response(&workspace.document, label)))
}

/// Redo the latest undone command.
pub async fn redo_handler(State(state): State<AppState>) -> Result<Json<HistoryResponse>, ApiError> {
    let mut workspace = state.workspace.lock().await;
    let outcome = workspace.document.redo();
    workspace.document.flush_notifications();
    let label = outcome?;
    Ok(Json(history_response(&workspace.document, label)))
}

// =============================================================================
// EXPORT HANDLER
// =============================================================================

/// Binary snapshot of the whole document.
pub async fn export_handler(State(state): State<AppState>) -> impl IntoResponse {
    let spec = state.workspace.lock().await.document.to_spec();
    match document_to_bytes(&spec) {
        Ok(data) => (StatusCode::OK, Json(ExportResponse::success(&data))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ExportResponse::error(format!("Export failed: {}", e))),
        ),
    }
}

//! # CODAP HTTP API Module
//!
//! The "data interactive" channel: plugins post JSON change descriptors and
//! read cases, rows and change logs back.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /status` - Contexts, counters and undo/redo labels
//! - `POST /contexts` - Create a data context
//! - `POST /contexts/{context}/changes` - Apply a change descriptor
//! - `GET /contexts/{context}/changes?since=N` - Changes after N
//! - `GET /contexts/{context}/collections/{collection}` - Attributes, cases, selection
//! - `GET /contexts/{context}/collections/{collection}/rows` - Case table rows
//! - `POST /contexts/{context}/collections/{collection}/rows/collapse` - Collapse a group
//! - `POST /contexts/{context}/collections/{collection}/rows/expand` - Expand a group
//! - `POST /undo`, `POST /redo` - History navigation
//! - `POST /export` - Binary document snapshot (base64)
//!
//! Every handler holds the workspace lock for its whole turn and flushes
//! notifications before releasing it.

mod auth;
mod handlers;
mod middleware;
mod types;

pub use auth::{ApiKey, keys_match};
pub use middleware::{GlobalRateLimiter, create_rate_limiter};
// Re-export handlers and types for integration tests (via `codap::api::*`)
pub use handlers::{
    apply_change_handler, changes_handler, collapse_handler, collection_handler,
    create_context_handler, expand_handler, export_handler, health_handler, redo_handler,
    rows_handler, status_handler, undo_handler,
};
pub use types::{
    ApiError, CaseJson, ChangeEnvelope, ChangeResponse, ChangesQuery, ChangesResponse,
    CollectionResponse, CollectionStatus, ContextStatus, CreateContextRequest,
    CreateContextResponse, ErrorResponse, ExportResponse, HealthResponse, HistoryResponse,
    RowActionRequest, RowJson, RowsResponse, StatusResponse,
};

use crate::config::{AppConfig, ServerConfig};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    routing::{get, post},
};
use codap_core::{
    CaseTableRowIndex, CodapError, CollectionId, DataContext, DataContextId, Document,
    InvariantMode,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

// =============================================================================
// SERVER STATE
// =============================================================================

/// The document plus the per-table row indexes views have asked for.
#[derive(Debug, Default)]
pub struct Workspace {
    pub document: Document,
    row_indexes: BTreeMap<(DataContextId, CollectionId), CaseTableRowIndex>,
}

impl Workspace {
    #[must_use]
    pub fn new(document: Document) -> Self {
        Self {
            document,
            row_indexes: BTreeMap::new(),
        }
    }

    /// Run `f` on the row index for a table.
    ///
    /// The index is created on first use and synced to the context's
    /// current change count before `f` sees it.
    pub fn with_row_index<R>(
        &mut self,
        context: DataContextId,
        collection: CollectionId,
        f: impl FnOnce(&mut CaseTableRowIndex, &DataContext) -> R,
    ) -> Result<R, CodapError> {
        let ctx = self
            .document
            .context(context)
            .ok_or_else(|| CodapError::ContextNotFound(context.to_string()))?;
        if ctx.collection(collection).is_none() {
            self.row_indexes.remove(&(context, collection));
            return Err(CodapError::CollectionNotFound(collection.to_string()));
        }
        let index = self
            .row_indexes
            .entry((context, collection))
            .or_insert_with(|| CaseTableRowIndex::new(collection));
        index.sync(ctx);
        Ok(f(index, ctx))
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    pub workspace: Arc<Mutex<Workspace>>,
}

impl AppState {
    #[must_use]
    pub fn new(mut document: Document) -> Self {
        // A server logs invariant violations instead of aborting.
        document.set_invariant_mode(InvariantMode::Log);
        Self {
            workspace: Arc::new(Mutex::new(Workspace::new(document))),
        }
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

/// Build the CORS layer from `server.cors_origins`.
///
/// - `"*"`: allows all origins (development only)
/// - unset: localhost only
/// - otherwise: comma-separated list of allowed origins
fn build_cors_layer(origins: Option<&str>) -> CorsLayer {
    match origins {
        Some("*") => {
            tracing::warn!("CORS: Allowing ALL origins. This is insecure for production!");
            CorsLayer::permissive()
        }
        Some(origins) => {
            let allowed_origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| {
                    let trimmed = s.trim();
                    match trimmed.parse::<HeaderValue>() {
                        Ok(hv) => {
                            tracing::info!("CORS: Allowing origin: {}", trimmed);
                            Some(hv)
                        }
                        Err(e) => {
                            tracing::warn!("CORS: Invalid origin '{}': {}", trimmed, e);
                            None
                        }
                    }
                })
                .collect();

            if allowed_origins.is_empty() {
                tracing::warn!("CORS: No valid origins configured, defaulting to localhost only");
                build_localhost_cors()
            } else {
                CorsLayer::new()
                    .allow_origin(allowed_origins)
                    .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                    .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            }
        }
        None => build_localhost_cors(),
    }
}

/// Build a restrictive CORS layer that only allows localhost origins.
fn build_localhost_cors() -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        "http://localhost:3000",
        "http://localhost:8080",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:8080",
    ]
    .into_iter()
    .filter_map(|o| o.parse::<HeaderValue>().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the axum router with all endpoints and middleware.
///
/// Middleware stack (outer to inner):
/// 1. Tracing - logs all requests
/// 2. CORS - handles preflight requests
/// 3. Body limit
/// 4. Rate Limiting - if `rate_limit > 0`
/// 5. Authentication - if an API key is configured
pub fn create_router(state: AppState, config: &ServerConfig) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        .route("/contexts", post(handlers::create_context_handler))
        .route(
            "/contexts/{context}/changes",
            get(handlers::changes_handler).post(handlers::apply_change_handler),
        )
        .route(
            "/contexts/{context}/collections/{collection}",
            get(handlers::collection_handler),
        )
        .route(
            "/contexts/{context}/collections/{collection}/rows",
            get(handlers::rows_handler),
        )
        .route(
            "/contexts/{context}/collections/{collection}/rows/collapse",
            post(handlers::collapse_handler),
        )
        .route(
            "/contexts/{context}/collections/{collection}/rows/expand",
            post(handlers::expand_handler),
        )
        .route("/undo", post(handlers::undo_handler))
        .route("/redo", post(handlers::redo_handler))
        .route("/export", post(handlers::export_handler));

    match config.api_key.as_deref().filter(|k| !k.is_empty()) {
        Some(key) => {
            tracing::info!("API key authentication enabled");
            router = router.layer(axum_middleware::from_fn_with_state(
                ApiKey::from(key),
                auth::api_key_auth_middleware,
            ));
        }
        None => tracing::warn!(
            "API key authentication DISABLED - all endpoints are publicly accessible! \
             Set CODAP_API_KEY to enable authentication."
        ),
    }

    if config.rate_limit > 0 {
        tracing::info!("Rate limiting enabled: {} requests/second", config.rate_limit);
        router = router.layer(axum_middleware::from_fn_with_state(
            create_rate_limiter(config.rate_limit),
            middleware::rate_limit_middleware,
        ));
    } else {
        tracing::info!("Rate limiting disabled");
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(build_cors_layer(config.cors_origins.as_deref()))
                .layer(DefaultBodyLimit::max(config.body_limit_bytes)),
        )
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Write a save ticket's snapshot through `save`, repeating while requests
/// coalesced behind it.
pub async fn save_workspace<F>(state: &AppState, save: F)
where
    F: Fn(&codap_core::DocumentSpec) -> Result<(), CodapError>,
{
    loop {
        let Some(ticket) = state.workspace.lock().await.document.begin_save() else {
            return;
        };
        let outcome = if ticket.contexts().is_empty() {
            Ok(())
        } else {
            let outcome = save(&ticket.spec);
            match &outcome {
                Ok(()) => tracing::info!(contexts = ticket.contexts().len(), "document saved"),
                Err(e) => tracing::error!("document save failed: {}", e),
            }
            outcome
        };
        let again = state.workspace.lock().await.document.finish_save(ticket, outcome);
        if !again {
            return;
        }
    }
}

/// Start the HTTP server and save `document_path` periodically and at
/// shutdown.
pub async fn run_server(
    config: &AppConfig,
    document: Document,
    document_path: PathBuf,
) -> Result<(), CodapError> {
    let state = AppState::new(document);
    let router = create_router(state.clone(), &config.server);
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CodapError::IoError(format!("Bind failed: {}", e)))?;

    tracing::info!("CODAP data interactive server listening on {}", addr);

    let autosave = (config.server.autosave_secs > 0).then(|| {
        let state = state.clone();
        let path = document_path.clone();
        let period = Duration::from_secs(config.server.autosave_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                save_workspace(&state, |spec| crate::cli::write_document(spec, &path)).await;
            }
        })
    });

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("cannot listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
        })
        .await
        .map_err(|e| CodapError::IoError(format!("Server error: {}", e)));

    if let Some(task) = autosave {
        task.abort();
    }
    save_workspace(&state, |spec| crate::cli::write_document(spec, &document_path)).await;
    served
}

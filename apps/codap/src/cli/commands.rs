//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use super::ExportFormat;
use crate::{api, api::StatusResponse, config::AppConfig};
use codap_core::{
    CaseTableRowIndex, Change, CodapError, CollectionId, CollectionRef, Document,
    DocumentSpec, command_for_change, document_from_bytes, document_to_bytes,
    primitives::{MAGIC_BYTES, MAX_CASES_PER_CHANGE},
};
use std::path::{Path, PathBuf};

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum size of a change file (100 MB).
const MAX_CHANGE_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Maximum size of a document or import file (500 MB).
const MAX_DOCUMENT_FILE_SIZE: u64 = 500 * 1024 * 1024;

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), CodapError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| CodapError::IoError(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(CodapError::DeserializationError(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Canonicalize an input path and require a regular file.
///
/// Resolves `..` and symlinks before anything is read.
fn validate_file_path(path: &Path) -> Result<PathBuf, CodapError> {
    let canonical = path.canonicalize().map_err(|e| {
        CodapError::IoError(format!("Invalid file path '{}': {}", path.display(), e))
    })?;

    if !canonical.is_file() {
        return Err(CodapError::IoError(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

/// Canonicalize the parent of an output path and require a directory.
fn validate_output_path(path: &Path) -> Result<PathBuf, CodapError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let canonical_parent = parent.canonicalize().map_err(|e| {
        CodapError::IoError(format!(
            "Invalid output directory '{}': {}",
            parent.display(),
            e
        ))
    })?;

    if !canonical_parent.is_dir() {
        return Err(CodapError::IoError(format!(
            "Output directory '{}' is not a valid directory",
            parent.display()
        )));
    }

    let filename = path
        .file_name()
        .ok_or_else(|| CodapError::IoError("Output path has no filename".to_string()))?;

    Ok(canonical_parent.join(filename))
}

// =============================================================================
// DOCUMENT FILES
// =============================================================================

/// Whether `path` names a binary document.
fn is_binary_path(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "cdap")
}

/// Decode a document file: binary when it starts with the magic bytes,
/// JSON otherwise.
pub fn parse_document_bytes(data: &[u8]) -> Result<DocumentSpec, CodapError> {
    if data.starts_with(MAGIC_BYTES) {
        document_from_bytes(data)
    } else {
        serde_json::from_slice(data).map_err(|e| CodapError::DeserializationError(e.to_string()))
    }
}

/// Encode a document for `path`: binary for `.cdap`, JSON otherwise.
pub fn encode_document(spec: &DocumentSpec, path: &Path) -> Result<Vec<u8>, CodapError> {
    if is_binary_path(path) {
        document_to_bytes(spec)
    } else {
        serde_json::to_vec_pretty(spec).map_err(|e| CodapError::SerializationError(e.to_string()))
    }
}

/// Write a document snapshot to `path`.
///
/// The bytes go to a sibling temp file first and are renamed into place,
/// so a failed write never truncates the previous save.
pub fn write_document(spec: &DocumentSpec, path: &Path) -> Result<(), CodapError> {
    let data = encode_document(spec, path)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, &data)
        .map_err(|e| CodapError::IoError(format!("Write document: {}", e)))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| CodapError::IoError(format!("Replace document: {}", e)))?;
    tracing::debug!(bytes = data.len(), path = %path.display(), "document written");
    Ok(())
}

/// Load the document at `path`, or start an empty one when it is missing.
pub fn load_document(path: &Path, history_capacity: usize) -> Result<Document, CodapError> {
    if !path.exists() {
        tracing::info!("No document at {:?}, starting empty", path);
        return Ok(Document::with_history_capacity(history_capacity));
    }
    let validated = validate_file_path(path)?;
    validate_file_size(&validated, MAX_DOCUMENT_FILE_SIZE)?;
    let data = std::fs::read(&validated)
        .map_err(|e| CodapError::IoError(format!("Read document: {}", e)))?;
    Document::from_spec(parse_document_bytes(&data)?, history_capacity)
}

// =============================================================================
// SERVER COMMAND
// =============================================================================

/// Start the HTTP server.
pub async fn cmd_server(config: &AppConfig, document_path: PathBuf) -> Result<(), CodapError> {
    let document = load_document(&document_path, config.history.capacity)?;

    println!("CODAP Data Interactive Server Starting...");
    println!();
    println!("Configuration:");
    println!("  Host:     {}", config.server.host);
    println!("  Port:     {}", config.server.port);
    println!("  Document: {:?}", document_path);
    println!("  Autosave: {}s", config.server.autosave_secs);
    println!();
    println!("Endpoints:");
    println!("  GET  /status                                   - Document status");
    println!("  POST /contexts                                 - Create a data context");
    println!("  POST /contexts/{{context}}/changes               - Apply a change");
    println!("  GET  /contexts/{{context}}/changes?since=N       - Changes after N");
    println!("  GET  /contexts/{{context}}/collections/{{name}}    - Cases and selection");
    println!("  GET  /contexts/{{context}}/collections/{{name}}/rows - Case table rows");
    println!("  POST /undo, /redo                              - History");
    println!("  POST /export                                   - Binary snapshot");
    println!("  GET  /health                                   - Health check");
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    api::run_server(config, document, document_path).await
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show document status.
pub fn cmd_status(path: &Path, capacity: usize, json_mode: bool) -> Result<(), CodapError> {
    let document = load_document(path, capacity)?;
    let status = StatusResponse::from(&document);

    if json_mode {
        println!(
            "{}",
            serde_json::to_string_pretty(&status).unwrap_or_default()
        );
        return Ok(());
    }

    println!("CODAP Document Status");
    println!("=====================");
    println!("Document: {:?}", path);
    println!("Contexts: {}", status.contexts.len());
    for ctx in &status.contexts {
        println!();
        println!("{} (#{}) - {} cases", ctx.name, ctx.id, ctx.case_count);
        for collection in &ctx.collections {
            println!(
                "  {} (#{}): {} cases",
                collection.name, collection.id, collection.case_count
            );
        }
    }

    Ok(())
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Write an empty document.
pub fn cmd_init(path: &Path, force: bool) -> Result<(), CodapError> {
    if path.exists() && !force {
        return Err(CodapError::IoError(
            "Document already exists. Use --force to overwrite.".to_string(),
        ));
    }
    let validated = validate_output_path(path)?;
    write_document(&DocumentSpec::default(), &validated)?;
    println!("Initialized empty document at {:?}", validated);
    Ok(())
}

// =============================================================================
// APPLY COMMAND
// =============================================================================

/// Apply change descriptors from a file to one context and save.
///
/// Stops at the first change that fails; nothing is written in that case.
pub fn cmd_apply(
    path: &Path,
    capacity: usize,
    json_mode: bool,
    file: &Path,
    context: &str,
) -> Result<(), CodapError> {
    let validated = validate_file_path(file)?;
    validate_file_size(&validated, MAX_CHANGE_FILE_SIZE)?;
    let contents = std::fs::read(&validated)
        .map_err(|e| CodapError::IoError(format!("Read file: {}", e)))?;
    let changes: Vec<Change> = serde_json::from_slice(&contents)
        .map_err(|e| CodapError::DeserializationError(format!("Change file: {}", e)))?;
    if changes.len() > MAX_CASES_PER_CHANGE {
        return Err(CodapError::ChangeFailed(format!(
            "Change count {} exceeds maximum allowed {}",
            changes.len(),
            MAX_CASES_PER_CHANGE
        )));
    }

    let mut document = load_document(path, capacity)?;
    let id = match document.resolve(context) {
        Some(id) => id,
        None => document.create_context(context, None),
    };

    let mut results = Vec::with_capacity(changes.len());
    for (n, change) in changes.into_iter().enumerate() {
        let command = (!change.is_complete)
            .then(|| command_for_change(id, change.request.clone()))
            .flatten();
        let result = match command {
            Some(command) => document.execute(command)?,
            None => document.apply_change(id, change)?,
        };
        document.flush_notifications();
        if !result.success {
            return Err(CodapError::ChangeFailed(format!(
                "change {}: {}",
                n,
                result.message.unwrap_or_default()
            )));
        }
        results.push(result);
    }

    write_document(&document.to_spec(), path)?;

    if json_mode {
        println!(
            "{}",
            serde_json::to_string_pretty(&results).unwrap_or_default()
        );
    } else {
        let change_count = document
            .context(id)
            .map(|ctx| ctx.change_count())
            .unwrap_or_default();
        println!(
            "Applied {} change(s) to '{}' (change count {})",
            results.len(),
            context,
            change_count
        );
    }
    Ok(())
}

// =============================================================================
// ROWS COMMAND
// =============================================================================

/// Print the case table rows of one collection.
pub fn cmd_rows(
    path: &Path,
    capacity: usize,
    json_mode: bool,
    context: &str,
    collection: &str,
    collapse: &[u64],
) -> Result<(), CodapError> {
    let document = load_document(path, capacity)?;
    let ctx = document
        .resolve(context)
        .and_then(|id| document.context(id))
        .ok_or_else(|| CodapError::ContextNotFound(context.to_string()))?;
    let collection_id = collection
        .parse::<u64>()
        .ok()
        .and_then(|id| ctx.resolve_collection(&CollectionRef::Id(CollectionId(id))))
        .or_else(|| ctx.resolve_collection(&CollectionRef::Name(collection.to_string())))
        .ok_or_else(|| CodapError::CollectionNotFound(collection.to_string()))?;

    let mut index = CaseTableRowIndex::new(collection_id);
    index.refresh(ctx);
    index.begin_update();
    for case in collapse {
        if !index.collapse_group(ctx, codap_core::CaseId(*case)) {
            tracing::warn!("case {} is not an ancestor of this collection", case);
        }
    }
    index.end_update(ctx);

    let rows: Vec<_> = index
        .rows()
        .iter()
        .enumerate()
        .map(|(row, id)| {
            (
                row,
                *id,
                index.is_group_collapsed(*id),
                ctx.case_values_by_name(*id).unwrap_or_default(),
            )
        })
        .collect();

    if json_mode {
        let output: Vec<_> = rows
            .iter()
            .map(|(row, id, collapsed, values)| {
                serde_json::json!({
                    "row": row,
                    "case_id": id,
                    "collapsed": collapsed,
                    "values": values,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
        return Ok(());
    }

    println!("{} rows", index.get_length());
    for (row, id, collapsed, values) in rows {
        let marker = if collapsed { "+" } else { " " };
        let values: Vec<String> = values
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        println!("{:>5} {} #{:<6} {}", row, marker, id, values.join(", "));
    }
    Ok(())
}

// =============================================================================
// EXPORT COMMAND
// =============================================================================

/// Export the document.
pub fn cmd_export(
    path: &Path,
    capacity: usize,
    output: &Path,
    format: ExportFormat,
) -> Result<(), CodapError> {
    let validated_output = validate_output_path(output)?;
    let spec = load_document(path, capacity)?.to_spec();

    let data = match format {
        ExportFormat::Binary => document_to_bytes(&spec)?,
        ExportFormat::Json => serde_json::to_vec_pretty(&spec)
            .map_err(|e| CodapError::SerializationError(e.to_string()))?,
    };

    std::fs::write(&validated_output, &data)
        .map_err(|e| CodapError::IoError(format!("Write file: {}", e)))?;

    println!("Exported {} bytes to {:?}", data.len(), validated_output);
    Ok(())
}

// =============================================================================
// IMPORT COMMAND
// =============================================================================

/// Replace the document with an exported file.
pub fn cmd_import(path: &Path, capacity: usize, input: &Path) -> Result<(), CodapError> {
    let validated_path = validate_file_path(input)?;
    validate_file_size(&validated_path, MAX_DOCUMENT_FILE_SIZE)?;

    let data = std::fs::read(&validated_path)
        .map_err(|e| CodapError::IoError(format!("Read file: {}", e)))?;

    // Rebuilding validates links and IDs before anything is overwritten.
    let document = Document::from_spec(parse_document_bytes(&data)?, capacity)?;
    write_document(&document.to_spec(), path)?;

    println!(
        "Imported {} context(s), {} case(s)",
        document.contexts().len(),
        document
            .contexts()
            .iter()
            .map(|ctx| ctx.case_count())
            .sum::<usize>()
    );
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

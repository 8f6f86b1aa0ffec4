//! # Persistence Format
//!
//! Binary snapshot of a `DocumentSpec`.
//!
//! Format: Header (5 bytes) + postcard-serialized document.
//! - 4 bytes: Magic ("CDAP")
//! - 1 byte: Version
//!
//! postcard is not self-describing, so the payload uses its own canonical
//! mirror of the `export` types: values are externally tagged and no field is
//! ever skipped.
//!
//! ## Limits
//!
//! The total size is checked against `MAX_PERSISTENCE_PAYLOAD_SIZE` and the
//! header is validated before any payload byte is decoded.

use crate::attribute::Attribute;
use crate::export::{CaseRecord, CollectionSpec, ContextSpec, DocumentSpec};
use crate::{
    AttributeId, AttributeType, CaseId, CodapError, CollectionId, DataContextId, Value, primitives,
};
use serde::{Deserialize, Serialize};

/// Maximum accepted snapshot size.
///
/// Checked BEFORE deserialization so a corrupted length prefix cannot drive
/// a huge allocation.
pub const MAX_PERSISTENCE_PAYLOAD_SIZE: usize = 256 * 1024 * 1024;

/// Header length in bytes.
const HEADER_SIZE: usize = 5;

// =============================================================================
// FILE HEADER
// =============================================================================

/// The persistence header precedes the document payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl PersistenceHeader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: *primitives::MAGIC_BYTES,
            version: primitives::FORMAT_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), CodapError> {
        if &self.magic != primitives::MAGIC_BYTES {
            return Err(CodapError::DeserializationError(
                "Invalid magic bytes".to_string(),
            ));
        }
        if self.version != primitives::FORMAT_VERSION {
            return Err(CodapError::DeserializationError(format!(
                "Unsupported version: {} (expected {})",
                self.version,
                primitives::FORMAT_VERSION
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4] = self.version;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodapError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodapError::DeserializationError(
                "Header too short".to_string(),
            ));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        Ok(Self {
            magic,
            version: bytes[4],
        })
    }
}

impl Default for PersistenceHeader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// CANONICAL PAYLOAD
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum CanonicalValue {
    Missing,
    Bool(bool),
    Number(f64),
    String(String),
}

impl From<Value> for CanonicalValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Missing => Self::Missing,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
        }
    }
}

impl From<CanonicalValue> for Value {
    fn from(value: CanonicalValue) -> Self {
        match value {
            CanonicalValue::Missing => Self::Missing,
            CanonicalValue::Bool(b) => Self::Bool(b),
            CanonicalValue::Number(n) => Self::Number(n),
            CanonicalValue::String(s) => Self::String(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CanonicalAttribute {
    id: u64,
    name: String,
    title: String,
    attr_type: AttributeType,
    formula: Option<String>,
    formula_error: Option<String>,
    editable: bool,
    hidden: bool,
    precision: Option<u8>,
    unit: String,
    description: String,
}

impl From<Attribute> for CanonicalAttribute {
    fn from(a: Attribute) -> Self {
        Self {
            id: a.id.0,
            name: a.name,
            title: a.title,
            attr_type: a.attr_type,
            formula: a.formula,
            formula_error: a.formula_error,
            editable: a.editable,
            hidden: a.hidden,
            precision: a.precision,
            unit: a.unit,
            description: a.description,
        }
    }
}

impl From<CanonicalAttribute> for Attribute {
    fn from(c: CanonicalAttribute) -> Self {
        let mut attribute = Attribute::new(AttributeId(c.id), c.name);
        attribute.title = c.title;
        attribute.attr_type = c.attr_type;
        attribute.formula = c.formula;
        attribute.formula_error = c.formula_error;
        attribute.editable = c.editable;
        attribute.hidden = c.hidden;
        attribute.precision = c.precision;
        attribute.unit = c.unit;
        attribute.description = c.description;
        attribute
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CanonicalCase {
    id: u64,
    parent: Option<u64>,
    /// Sorted by attribute ID.
    values: Vec<(u64, CanonicalValue)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CanonicalCollection {
    id: u64,
    name: String,
    title: String,
    parent: Option<u64>,
    attributes: Vec<CanonicalAttribute>,
    cases: Vec<CanonicalCase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CanonicalContext {
    id: u64,
    name: String,
    title: String,
    next_id: u64,
    collections: Vec<CanonicalCollection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CanonicalDocument {
    contexts: Vec<CanonicalContext>,
}

impl From<DocumentSpec> for CanonicalDocument {
    fn from(doc: DocumentSpec) -> Self {
        let contexts = doc
            .contexts
            .into_iter()
            .map(|ctx| CanonicalContext {
                id: ctx.id.0,
                name: ctx.name,
                title: ctx.title,
                next_id: ctx.next_id,
                collections: ctx
                    .collections
                    .into_iter()
                    .map(|col| CanonicalCollection {
                        id: col.id.0,
                        name: col.name,
                        title: col.title,
                        parent: col.parent.map(|p| p.0),
                        attributes: col.attributes.into_iter().map(Into::into).collect(),
                        cases: col
                            .cases
                            .into_iter()
                            .map(|case| CanonicalCase {
                                id: case.id.0,
                                parent: case.parent.map(|p| p.0),
                                values: case
                                    .values
                                    .into_iter()
                                    .map(|(a, v)| (a.0, v.into()))
                                    .collect(),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();
        Self { contexts }
    }
}

impl From<CanonicalDocument> for DocumentSpec {
    fn from(doc: CanonicalDocument) -> Self {
        let contexts = doc
            .contexts
            .into_iter()
            .map(|ctx| ContextSpec {
                id: DataContextId(ctx.id),
                name: ctx.name,
                title: ctx.title,
                next_id: ctx.next_id,
                collections: ctx
                    .collections
                    .into_iter()
                    .map(|col| CollectionSpec {
                        id: CollectionId(col.id),
                        name: col.name,
                        title: col.title,
                        parent: col.parent.map(CollectionId),
                        attributes: col.attributes.into_iter().map(Into::into).collect(),
                        cases: col
                            .cases
                            .into_iter()
                            .map(|case| CaseRecord {
                                id: CaseId(case.id),
                                parent: case.parent.map(CaseId),
                                values: case
                                    .values
                                    .into_iter()
                                    .map(|(a, v)| (AttributeId(a), v.into()))
                                    .collect(),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();
        Self {
            version: primitives::FORMAT_VERSION,
            contexts,
        }
    }
}

// =============================================================================
// SERIALIZATION FUNCTIONS
// =============================================================================

/// Serialize a document to bytes (header + payload). No file I/O.
pub fn document_to_bytes(document: &DocumentSpec) -> Result<Vec<u8>, CodapError> {
    let header = PersistenceHeader::new();
    let canonical = CanonicalDocument::from(document.clone());

    let payload = postcard::to_stdvec(&canonical)
        .map_err(|e| CodapError::SerializationError(e.to_string()))?;

    let mut result = Vec::with_capacity(HEADER_SIZE + payload.len());
    result.extend_from_slice(&header.to_bytes());
    result.extend_from_slice(&payload);
    Ok(result)
}

/// Deserialize a document from bytes. No file I/O.
///
/// Size and header are validated before the payload is touched.
pub fn document_from_bytes(bytes: &[u8]) -> Result<DocumentSpec, CodapError> {
    if bytes.len() < HEADER_SIZE {
        return Err(CodapError::DeserializationError(format!(
            "Data too short: minimum {} bytes required",
            HEADER_SIZE
        )));
    }
    if bytes.len() > MAX_PERSISTENCE_PAYLOAD_SIZE {
        return Err(CodapError::DeserializationError(format!(
            "Data size {} bytes exceeds maximum allowed {} bytes",
            bytes.len(),
            MAX_PERSISTENCE_PAYLOAD_SIZE
        )));
    }

    let header = PersistenceHeader::from_bytes(bytes)?;
    header.validate()?;

    let canonical: CanonicalDocument = postcard::from_bytes(&bytes[HEADER_SIZE..])
        .map_err(|e| CodapError::DeserializationError(format!("Failed to decode document: {}", e)))?;
    Ok(DocumentSpec::from(canonical))
}

// =============================================================================
// TESTS
// =============================================================================

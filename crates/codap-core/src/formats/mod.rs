//! # Formats
//!
//! Byte-level encodings of the persisted form.

pub mod persistence;

pub use persistence::{
    MAX_PERSISTENCE_PAYLOAD_SIZE, PersistenceHeader, document_from_bytes, document_to_bytes,
};

//! # Engine Constants
//!
//! Hardcoded limits and format constants for the CODAP core.
//!
//! These are compiled into the binary and are immutable at runtime.

/// Maximum depth of the case hierarchy visited by recursive walks.
///
/// Cascading delete, cascading select and the row-index walk all descend
/// the parent→child case tree. Real documents have a handful of levels;
/// anything deeper than this is treated as a malformed (cyclic) document
/// and the walk stops.
pub const MAX_HIERARCHY_DEPTH: usize = 64;

/// Magic bytes for the binary document snapshot header.
pub const MAGIC_BYTES: &[u8; 4] = b"CDAP";

/// Current binary snapshot format version.
///
/// Increment this when making breaking changes to the snapshot format.
pub const FORMAT_VERSION: u8 = 1;

/// Default number of commands retained on the undo stack.
pub const DEFAULT_UNDO_CAPACITY: usize = 100;

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum length for collection and attribute names.
pub const MAX_NAME_LENGTH: usize = 256;

/// Maximum number of cases in a single create/update/delete/select change.
///
/// Larger batches are rejected at the app boundary to prevent DoS.
pub const MAX_CASES_PER_CHANGE: usize = 100_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_bytes_correct() {
        assert_eq!(MAGIC_BYTES, b"CDAP");
    }

    #[test]
    fn hierarchy_depth_allows_realistic_documents() {
        assert!(MAX_HIERARCHY_DEPTH >= 8);
    }
}

//! # Invariant Diagnostics
//!
//! Programmer errors (mutating a destroyed context, a case whose parent
//! vanished from the index) halt development builds and are logged and
//! skipped in production builds.
//!
//! The mode is a value rather than a compile-time switch so that tests can
//! exercise the production path without a release build.

use serde::{Deserialize, Serialize};

/// How an invariant violation is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvariantMode {
    /// Fail loudly (development builds).
    Assert,
    /// Log with `tracing::error!` and continue (production builds).
    Log,
}

impl Default for InvariantMode {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Assert
        } else {
            Self::Log
        }
    }
}

/// Report an invariant violation according to `mode`.
///
/// Always logs. In `Assert` mode, additionally trips a debug assertion.
pub fn invariant_violation(mode: InvariantMode, context: &str, message: &str) {
    tracing::error!(
        target: "codap_core::invariant",
        context,
        "invariant violated: {}",
        message
    );
    if mode == InvariantMode::Assert {
        debug_assert!(false, "invariant violated in {}: {}", context, message);
    }
}

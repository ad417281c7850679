// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Registry Error Types
//!
//! Errors raised by registry backends. The cluster layer treats every one of
//! them as "the directory is temporarily unknowable": a failed registry
//! operation never takes a node down, it only delays discovery until the next
//! heartbeat tick.
//!
//! ## Error Categories
//!
//! - **Unavailable**: the backend could not be reached or a lock was poisoned.
//!   Transient, callers retry at their own discretion.
//! - **Conflict**: a write was refused because the key is owned by someone
//!   else.
//! - **CreateRegistry**: the backend could not be initialized (bad path,
//!   failed schema creation).
//!

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for registry operations.
///
/// Errors are `Clone` and serializable so they can be reported through the
/// diagnostics actor and compared in tests.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq)]
pub enum Error {
    /// The registry backend could not be reached.
    ///
    /// Any operation may fail this way. Callers should keep their cached
    /// view and try again later.
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    /// The write conflicts with a record owned by another writer.
    #[error("Registry conflict: {0}")]
    Conflict(String),

    /// The backend could not be created or initialized.
    #[error("Can't create registry: {0}")]
    CreateRegistry(String),
}

impl Error {
    /// True for errors a caller may retry without changing its request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(Error::Unavailable("down".to_owned()).is_transient());
        assert!(!Error::Conflict("nodes/a".to_owned()).is_transient());
        assert!(!Error::CreateRegistry("path".to_owned()).is_transient());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::Unavailable("lock poisoned".to_owned()).to_string(),
            "Registry unavailable: lock poisoned"
        );
    }
}

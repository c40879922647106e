// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Error taxonomy shared by the control-plane components.
//!
//! Validation failures are recoverable by the caller and keep their own
//! variant all the way to the HTTP layer. Only [`ControlError::Store`] and
//! [`ControlError::Internal`] describe server-side faults.

use crate::storage::StoreError;

/// Result type for control-plane operations.
pub type ControlResult<T> = Result<T, ControlError>;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// A namespace, node or pre-auth key does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A record with the same unique attribute already exists.
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("pre-auth key has expired")]
    KeyExpired,

    #[error("pre-auth key has already been used")]
    KeyAlreadyUsed,

    /// A session or state transition was attempted out of order.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    pub fn namespace_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "namespace",
            id: name.into(),
        }
    }

    pub fn node_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "node",
            id: id.to_string(),
        }
    }

    /// The token itself is never echoed back.
    pub fn key_not_found() -> Self {
        Self::NotFound {
            kind: "pre-auth key",
            id: "<redacted>".to_string(),
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Axum extractor for administrative callers.
//!
//! ```rust,ignore
//! async fn create_namespace(_admin: AdminOnly, State(state): State<AppState>) { .. }
//! ```

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use ring::digest::{digest, SHA256};

use super::AuthError;
use crate::state::AppState;

/// Proof that the request carried the configured admin bearer token.
#[derive(Debug)]
pub struct AdminOnly;

fn tokens_match(expected: &str, presented: &str) -> bool {
    digest(&SHA256, expected.as_bytes()).as_ref() == digest(&SHA256, presented.as_bytes()).as_ref()
}

impl FromRequestParts<AppState> for AdminOnly {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let expected = state
            .config
            .admin_api_key
            .as_deref()
            .ok_or(AuthError::AdminDisabled)?;

        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or(AuthError::MissingAuthHeader)?
            .to_str()
            .map_err(|_| AuthError::InvalidAuthHeader)?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or(AuthError::InvalidAuthHeader)?;

        if !tokens_match(expected, token.trim()) {
            tracing::warn!("Rejected admin request with invalid API key");
            return Err(AuthError::InvalidApiKey);
        }
        Ok(AdminOnly)
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Authentication Module
//!
//! Machine endpoints are not authenticated here: a node is identified by its
//! public key and gated by the registration state machine.
//!
//! Administrative endpoints require `Authorization: Bearer <ADMIN_API_KEY>`.
//!
//! ## Security
//!
//! - Tokens are compared as SHA-256 digests, never as raw strings
//! - With no `ADMIN_API_KEY` configured every admin request is rejected

pub mod error;
pub mod extractor;

pub use error::AuthError;
pub use extractor::AdminOnly;

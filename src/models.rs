// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # API Data Models
//!
//! Request and response bodies of the HTTP API. Stored records
//! ([`Namespace`](crate::storage::Namespace), [`PreAuthKey`](crate::storage::PreAuthKey),
//! [`Node`](crate::storage::Node)) and the network map
//! ([`MapResponse`](crate::control::MapResponse)) are returned as they are.
//!
//! ## Model Categories
//!
//! - **Machine**: key exchange, registration and polling
//! - **Admin**: namespaces and pre-auth keys

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::storage::{NodeId, NodeState};

/// Longest accepted namespace or host name.
pub const MAX_NAME_LEN: usize = 63;

/// DNS-label style check shared by namespace and host names.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

// =============================================================================
// Machine Models
// =============================================================================

/// The server's long-term public key.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServerKeyResponse {
    /// Hex-encoded Curve25519 public key
    pub public_key: String,
}

/// Registration request sent by a node.
///
/// The node key itself is the path parameter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct RegisterRequest {
    /// Namespace to join; inferred from `auth_key` when omitted.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Pre-auth key; without it the node waits for manual approval.
    #[serde(default)]
    pub auth_key: Option<String>,
    /// Host name; defaults to `node-<key prefix>`.
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterResponse {
    pub node_id: NodeId,
    pub state: NodeState,
    /// Namespace the node is bound to
    pub namespace: String,
    /// Whether the node may open a poll connection
    pub authorized: bool,
    /// Hex-encoded server public key
    pub server_key: String,
}

fn default_stream() -> bool {
    true
}

/// Poll request sent by an authorized node.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PollRequest {
    /// Current `ip:port` endpoints of the node
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// `false` returns a single map instead of a stream.
    #[serde(default = "default_stream")]
    pub stream: bool,
}

impl Default for PollRequest {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            stream: true,
        }
    }
}

// =============================================================================
// Admin Models
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateNamespaceRequest {
    /// Lowercase letters, digits and `-`, at most 63 characters
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct IssueKeyRequest {
    #[serde(default)]
    pub reusable: bool,
    /// Must be in the future when given
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}

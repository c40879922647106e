// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Persistence Module
//!
//! Durable state (namespaces, pre-auth keys, nodes) is reached through the
//! [`Store`] repository trait. The control-plane components never see a
//! backend directly, so several coordinator instances can share one store.
//!
//! ## Backends
//!
//! - [`MemoryStore`]: mutex-guarded maps, used by tests and when no
//!   `DATABASE_PATH` is configured
//! - [`RedbStore`]: embedded ACID database, one write transaction per mutation
//!
//! ## Atomic Operations
//!
//! Three operations check and mutate in one transaction and are the only
//! place where single-writer semantics are enforced:
//!
//! - [`Store::consume_key`]: check-and-mark of a pre-auth key
//! - [`Store::authorize_node_with_key`]: key consumption plus `Pending ->
//!   Authorized`, all or nothing
//! - [`Store::transition_node`]: compare-and-set on a node's state

pub mod memory;
pub mod redb_store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::control::{ControlError, ControlResult};
use crate::identity::NodeKey;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

pub type NamespaceId = u64;
pub type NodeId = u64;

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("database directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

// =============================================================================
// Records
// =============================================================================

/// Tenant boundary for nodes and keys.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct Namespace {
    pub id: NamespaceId,
    /// Unique namespace name
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Enrollment credential.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct PreAuthKey {
    pub id: u64,
    /// 48 lowercase hex characters
    pub key: String,
    pub namespace_id: NamespaceId,
    /// Reusable keys are never marked used
    pub reusable: bool,
    /// Set once a single-use key has authorized a node
    pub used: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
}

impl PreAuthKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|expiration| now >= expiration)
    }

    /// Check whether the key may authorize a registration right now.
    ///
    /// Expiration wins over `used`: an expired key always reports
    /// [`ControlError::KeyExpired`].
    pub fn check_usable(&self, now: DateTime<Utc>) -> ControlResult<()> {
        if self.is_expired(now) {
            return Err(ControlError::KeyExpired);
        }
        if !self.reusable && self.used {
            return Err(ControlError::KeyAlreadyUsed);
        }
        Ok(())
    }
}

/// Fields supplied when issuing a key; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewPreAuthKey {
    pub key: String,
    pub namespace_id: NamespaceId,
    pub reusable: bool,
    pub created_at: DateTime<Utc>,
    pub expiration: Option<DateTime<Utc>>,
}

/// Approval state of a node.
///
/// `Unknown` is not a variant: it is the absence of a record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Key exchange seen, waiting for authorization
    Pending,
    /// Approved, not currently polling
    Authorized,
    /// Currently holding a poll connection
    Active,
    /// Administratively removed (terminal)
    Revoked,
    /// Credentials lapsed (terminal)
    Expired,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Revoked | NodeState::Expired)
    }

    /// Authorized or Active.
    pub fn is_authorized(self) -> bool {
        matches!(self, NodeState::Authorized | NodeState::Active)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Pending => "pending",
            NodeState::Authorized => "authorized",
            NodeState::Active => "active",
            NodeState::Revoked => "revoked",
            NodeState::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A registered peer.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub namespace_id: NamespaceId,
    #[schema(value_type = String)]
    pub public_key: NodeKey,
    /// Host name reported by the node
    pub name: String,
    pub state: NodeState,
    /// Pre-auth key that authorized this node, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_key_id: Option<u64>,
    /// Reachability metadata (`ip:port` strings) reported on poll
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied on first key exchange; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub namespace_id: NamespaceId,
    pub public_key: NodeKey,
    pub name: String,
}

impl NewNode {
    fn into_node(self, id: NodeId, now: DateTime<Utc>) -> Node {
        Node {
            id,
            namespace_id: self.namespace_id,
            public_key: self.public_key,
            name: self.name,
            state: NodeState::Pending,
            auth_key_id: None,
            endpoints: Vec::new(),
            last_seen: None,
            created_at: now,
        }
    }
}

// =============================================================================
// Transition Rules (shared by every backend)
// =============================================================================

/// Apply a pre-auth key to a node inside a store transaction.
///
/// The key is always validated and consumed. Only a `Pending` node changes
/// state and namespace; an already authorized node keeps both.
/// Returns `true` when the key must be persisted as used.
fn apply_key_authorization(
    node: &mut Node,
    key: &mut PreAuthKey,
    now: DateTime<Utc>,
) -> ControlResult<bool> {
    if node.state.is_terminal() {
        return Err(ControlError::NotAuthorized(format!(
            "node {} is {}",
            node.id, node.state
        )));
    }
    key.check_usable(now)?;

    if node.state == NodeState::Pending {
        node.state = NodeState::Authorized;
        node.namespace_id = key.namespace_id;
        node.auth_key_id = Some(key.id);
    }

    if key.reusable {
        Ok(false)
    } else {
        key.used = true;
        Ok(true)
    }
}

/// Compare-and-set on a node's state.
fn apply_transition(
    node: &mut Node,
    allowed_from: &[NodeState],
    to: NodeState,
    now: DateTime<Utc>,
) -> ControlResult<()> {
    if !allowed_from.contains(&node.state) {
        return Err(ControlError::NotAuthorized(format!(
            "node {} cannot move from {} to {}",
            node.id, node.state, to
        )));
    }
    let was_active = node.state == NodeState::Active;
    node.state = to;
    if to == NodeState::Active || was_active {
        node.last_seen = Some(now);
    }
    Ok(())
}

// =============================================================================
// Store Trait
// =============================================================================

/// Repository interface over durable control-plane state.
///
/// Every method returns owned copies; the store keeps the canonical record.
pub trait Store: Send + Sync {
    /// Create a namespace; `AlreadyExists` when the name is taken.
    fn create_namespace(&self, name: &str, now: DateTime<Utc>) -> ControlResult<Namespace>;

    fn find_namespace(&self, name: &str) -> ControlResult<Option<Namespace>>;

    fn get_namespace(&self, id: NamespaceId) -> ControlResult<Option<Namespace>>;

    fn list_namespaces(&self) -> ControlResult<Vec<Namespace>>;

    fn insert_key(&self, key: NewPreAuthKey) -> ControlResult<PreAuthKey>;

    fn find_key(&self, token: &str) -> ControlResult<Option<PreAuthKey>>;

    /// Keys of a namespace ordered by creation time.
    fn list_keys(&self, namespace_id: NamespaceId) -> ControlResult<Vec<PreAuthKey>>;

    /// Overwrite an existing key record.
    fn update_key(&self, key: &PreAuthKey) -> ControlResult<()>;

    /// Atomically validate a key and mark it used when single-use.
    fn consume_key(&self, token: &str, now: DateTime<Utc>) -> ControlResult<PreAuthKey>;

    fn find_node(&self, public_key: &NodeKey) -> ControlResult<Option<Node>>;

    fn get_node(&self, id: NodeId) -> ControlResult<Option<Node>>;

    /// Insert a `Pending` node unless one with the same public key exists.
    ///
    /// Returns the stored node and whether it was created by this call.
    fn create_node_if_absent(&self, node: NewNode, now: DateTime<Utc>)
        -> ControlResult<(Node, bool)>;

    /// Nodes of a namespace ordered by id.
    fn list_nodes(&self, namespace_id: NamespaceId) -> ControlResult<Vec<Node>>;

    /// Consume `token` and authorize the node holding `public_key` in one
    /// transaction. Nothing changes when any check fails.
    fn authorize_node_with_key(
        &self,
        public_key: &NodeKey,
        token: &str,
        now: DateTime<Utc>,
    ) -> ControlResult<Node>;

    /// Replace a node's reachability metadata.
    fn set_endpoints(&self, id: NodeId, endpoints: Vec<String>) -> ControlResult<Node>;

    /// Move a node to `to` if its current state is in `allowed_from`.
    fn transition_node(
        &self,
        id: NodeId,
        allowed_from: &[NodeState],
        to: NodeState,
        now: DateTime<Utc>,
    ) -> ControlResult<Node>;
}

// =============================================================================
// Backend Conformance Tests
// =============================================================================

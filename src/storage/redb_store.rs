// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Durable store backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `namespaces`: namespace id → serialized Namespace
//! - `namespace_names`: name → namespace id
//! - `preauth_keys`: token → serialized PreAuthKey
//! - `nodes`: node id → serialized Node
//! - `node_keys`: hex public key → node id
//! - `counters`: record kind → last assigned id
//!
//! redb serializes write transactions, so every mutating trait method runs
//! inside exactly one of them and an early return aborts it.

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};

use super::{
    apply_key_authorization, apply_transition, Namespace, NamespaceId, NewNode, NewPreAuthKey,
    Node, NodeId, NodeState, PreAuthKey, Store, StoreError,
};
use crate::control::{ControlError, ControlResult};
use crate::identity::NodeKey;

// =============================================================================
// Table Definitions
// =============================================================================

const NAMESPACES: TableDefinition<u64, &[u8]> = TableDefinition::new("namespaces");

const NAMESPACE_NAMES: TableDefinition<&str, u64> = TableDefinition::new("namespace_names");

const PREAUTH_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("preauth_keys");

const NODES: TableDefinition<u64, &[u8]> = TableDefinition::new("nodes");

const NODE_KEYS: TableDefinition<&str, u64> = TableDefinition::new("node_keys");

const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

const NAMESPACE_COUNTER: &str = "namespace";
const KEY_COUNTER: &str = "preauth_key";
const NODE_COUNTER: &str = "node";

macro_rules! store_error_into_control {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ControlError {
                fn from(e: $ty) -> Self {
                    ControlError::Store(StoreError::from(e))
                }
            }
        )*
    };
}

store_error_into_control!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
    serde_json::Error,
);

fn encode<T: Serialize>(value: &T) -> ControlResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> ControlResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn next_id(counters: &mut Table<'_, &'static str, u64>, kind: &str) -> ControlResult<u64> {
    let current = counters.get(kind)?.map(|v| v.value()).unwrap_or(0);
    let next = current + 1;
    counters.insert(kind, next)?;
    Ok(next)
}

fn load_node(nodes: &impl ReadableTable<u64, &'static [u8]>, id: NodeId) -> ControlResult<Node> {
    let bytes = nodes
        .get(id)?
        .map(|v| v.value().to_vec())
        .ok_or_else(|| ControlError::node_not_found(id))?;
    decode(&bytes)
}

// =============================================================================
// RedbStore
// =============================================================================

pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> ControlResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::from)?;
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(NAMESPACES)?;
            let _ = write_txn.open_table(NAMESPACE_NAMES)?;
            let _ = write_txn.open_table(PREAUTH_KEYS)?;
            let _ = write_txn.open_table(NODES)?;
            let _ = write_txn.open_table(NODE_KEYS)?;
            let _ = write_txn.open_table(COUNTERS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }
}

impl Store for RedbStore {
    fn create_namespace(&self, name: &str, now: DateTime<Utc>) -> ControlResult<Namespace> {
        let write_txn = self.db.begin_write()?;
        let namespace = {
            let mut names = write_txn.open_table(NAMESPACE_NAMES)?;
            if names.get(name)?.is_some() {
                return Err(ControlError::AlreadyExists {
                    kind: "namespace",
                    id: name.to_string(),
                });
            }
            let mut counters = write_txn.open_table(COUNTERS)?;
            let id = next_id(&mut counters, NAMESPACE_COUNTER)?;
            let namespace = Namespace {
                id,
                name: name.to_string(),
                created_at: now,
            };
            let mut namespaces = write_txn.open_table(NAMESPACES)?;
            namespaces.insert(id, encode(&namespace)?.as_slice())?;
            names.insert(name, id)?;
            namespace
        };
        write_txn.commit()?;
        Ok(namespace)
    }

    fn find_namespace(&self, name: &str) -> ControlResult<Option<Namespace>> {
        let read_txn = self.db.begin_read()?;
        let names = read_txn.open_table(NAMESPACE_NAMES)?;
        let Some(id) = names.get(name)?.map(|v| v.value()) else {
            return Ok(None);
        };
        drop(names);
        let namespaces = read_txn.open_table(NAMESPACES)?;
        match namespaces.get(id)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Err(ControlError::Store(StoreError::Corrupt(format!(
                "namespace name {name} points at missing id {id}"
            )))),
        }
    }

    fn get_namespace(&self, id: NamespaceId) -> ControlResult<Option<Namespace>> {
        let read_txn = self.db.begin_read()?;
        let namespaces = read_txn.open_table(NAMESPACES)?;
        match namespaces.get(id)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn list_namespaces(&self) -> ControlResult<Vec<Namespace>> {
        let read_txn = self.db.begin_read()?;
        let namespaces = read_txn.open_table(NAMESPACES)?;
        let mut result = Vec::new();
        for entry in namespaces.iter()? {
            let (_, value) = entry?;
            result.push(decode(value.value())?);
        }
        Ok(result)
    }

    fn insert_key(&self, key: NewPreAuthKey) -> ControlResult<PreAuthKey> {
        let write_txn = self.db.begin_write()?;
        let record = {
            let mut keys = write_txn.open_table(PREAUTH_KEYS)?;
            if keys.get(key.key.as_str())?.is_some() {
                return Err(ControlError::AlreadyExists {
                    kind: "pre-auth key",
                    id: "<redacted>".to_string(),
                });
            }
            let mut counters = write_txn.open_table(COUNTERS)?;
            let record = PreAuthKey {
                id: next_id(&mut counters, KEY_COUNTER)?,
                key: key.key,
                namespace_id: key.namespace_id,
                reusable: key.reusable,
                used: false,
                created_at: key.created_at,
                expiration: key.expiration,
            };
            keys.insert(record.key.as_str(), encode(&record)?.as_slice())?;
            record
        };
        write_txn.commit()?;
        Ok(record)
    }

    fn find_key(&self, token: &str) -> ControlResult<Option<PreAuthKey>> {
        let read_txn = self.db.begin_read()?;
        let keys = read_txn.open_table(PREAUTH_KEYS)?;
        match keys.get(token)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn list_keys(&self, namespace_id: NamespaceId) -> ControlResult<Vec<PreAuthKey>> {
        let read_txn = self.db.begin_read()?;
        let keys = read_txn.open_table(PREAUTH_KEYS)?;
        let mut result: Vec<PreAuthKey> = Vec::new();
        for entry in keys.iter()? {
            let (_, value) = entry?;
            let key: PreAuthKey = decode(value.value())?;
            if key.namespace_id == namespace_id {
                result.push(key);
            }
        }
        result.sort_by_key(|k| (k.created_at, k.id));
        Ok(result)
    }

    fn update_key(&self, key: &PreAuthKey) -> ControlResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut keys = write_txn.open_table(PREAUTH_KEYS)?;
            if keys.get(key.key.as_str())?.is_none() {
                return Err(ControlError::key_not_found());
            }
            keys.insert(key.key.as_str(), encode(key)?.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn consume_key(&self, token: &str, now: DateTime<Utc>) -> ControlResult<PreAuthKey> {
        let write_txn = self.db.begin_write()?;
        let key = {
            let mut keys = write_txn.open_table(PREAUTH_KEYS)?;
            let bytes = keys
                .get(token)?
                .map(|v| v.value().to_vec())
                .ok_or_else(ControlError::key_not_found)?;
            let mut key: PreAuthKey = decode(&bytes)?;
            key.check_usable(now)?;
            if !key.reusable {
                key.used = true;
                keys.insert(token, encode(&key)?.as_slice())?;
            }
            key
        };
        write_txn.commit()?;
        Ok(key)
    }

    fn find_node(&self, public_key: &NodeKey) -> ControlResult<Option<Node>> {
        let read_txn = self.db.begin_read()?;
        let node_keys = read_txn.open_table(NODE_KEYS)?;
        let Some(id) = node_keys.get(public_key.to_hex().as_str())?.map(|v| v.value()) else {
            return Ok(None);
        };
        let nodes = read_txn.open_table(NODES)?;
        load_node(&nodes, id).map(Some)
    }

    fn get_node(&self, id: NodeId) -> ControlResult<Option<Node>> {
        let read_txn = self.db.begin_read()?;
        let nodes = read_txn.open_table(NODES)?;
        match nodes.get(id)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn create_node_if_absent(
        &self,
        node: NewNode,
        now: DateTime<Utc>,
    ) -> ControlResult<(Node, bool)> {
        let write_txn = self.db.begin_write()?;
        let hex_key = node.public_key.to_hex();
        let result = {
            let mut node_keys = write_txn.open_table(NODE_KEYS)?;
            let mut nodes = write_txn.open_table(NODES)?;
            let existing = node_keys.get(hex_key.as_str())?.map(|v| v.value());
            match existing {
                Some(id) => (load_node(&nodes, id)?, false),
                None => {
                    let mut counters = write_txn.open_table(COUNTERS)?;
                    let id = next_id(&mut counters, NODE_COUNTER)?;
                    let record = node.into_node(id, now);
                    nodes.insert(id, encode(&record)?.as_slice())?;
                    node_keys.insert(hex_key.as_str(), id)?;
                    (record, true)
                }
            }
        };
        write_txn.commit()?;
        Ok(result)
    }

    fn list_nodes(&self, namespace_id: NamespaceId) -> ControlResult<Vec<Node>> {
        let read_txn = self.db.begin_read()?;
        let nodes = read_txn.open_table(NODES)?;
        let mut result = Vec::new();
        for entry in nodes.iter()? {
            let (_, value) = entry?;
            let node: Node = decode(value.value())?;
            if node.namespace_id == namespace_id {
                result.push(node);
            }
        }
        Ok(result)
    }

    fn authorize_node_with_key(
        &self,
        public_key: &NodeKey,
        token: &str,
        now: DateTime<Utc>,
    ) -> ControlResult<Node> {
        let write_txn = self.db.begin_write()?;
        let node = {
            let node_keys = write_txn.open_table(NODE_KEYS)?;
            let id = node_keys
                .get(public_key.to_hex().as_str())?
                .map(|v| v.value())
                .ok_or_else(|| ControlError::node_not_found(public_key.short()))?;
            let mut nodes = write_txn.open_table(NODES)?;
            let mut node = load_node(&nodes, id)?;

            let mut keys = write_txn.open_table(PREAUTH_KEYS)?;
            let key_bytes = keys
                .get(token)?
                .map(|v| v.value().to_vec())
                .ok_or_else(ControlError::key_not_found)?;
            let mut key: PreAuthKey = decode(&key_bytes)?;

            if apply_key_authorization(&mut node, &mut key, now)? {
                keys.insert(token, encode(&key)?.as_slice())?;
            }
            nodes.insert(id, encode(&node)?.as_slice())?;
            node
        };
        write_txn.commit()?;
        Ok(node)
    }

    fn set_endpoints(&self, id: NodeId, endpoints: Vec<String>) -> ControlResult<Node> {
        let write_txn = self.db.begin_write()?;
        let node = {
            let mut nodes = write_txn.open_table(NODES)?;
            let mut node = load_node(&nodes, id)?;
            node.endpoints = endpoints;
            nodes.insert(id, encode(&node)?.as_slice())?;
            node
        };
        write_txn.commit()?;
        Ok(node)
    }

    fn transition_node(
        &self,
        id: NodeId,
        allowed_from: &[NodeState],
        to: NodeState,
        now: DateTime<Utc>,
    ) -> ControlResult<Node> {
        let write_txn = self.db.begin_write()?;
        let node = {
            let mut nodes = write_txn.open_table(NODES)?;
            let mut node = load_node(&nodes, id)?;
            apply_transition(&mut node, allowed_from, to, now)?;
            nodes.insert(id, encode(&node)?.as_slice())?;
            node
        };
        write_txn.commit()?;
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::conformance;

    fn open_store() -> (tempfile::TempDir, RedbStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(&dir.path().join("meshgate.redb")).unwrap();
        (dir, store)
    }

    #[test]
    fn namespaces_are_unique() {
        let (_dir, store) = open_store();
        conformance::namespaces_are_unique(&store);
    }

    #[test]
    fn keys_list_in_creation_order() {
        let (_dir, store) = open_store();
        conformance::keys_list_in_creation_order(&store);
    }

    #[test]
    fn single_use_key_is_consumed_once() {
        let (_dir, store) = open_store();
        conformance::single_use_key_is_consumed_once(&store);
    }

    #[test]
    fn reusable_key_is_never_marked_used() {
        let (_dir, store) = open_store();
        conformance::reusable_key_is_never_marked_used(&store);
    }

    #[test]
    fn expired_key_reports_expired_even_when_used() {
        let (_dir, store) = open_store();
        conformance::expired_key_reports_expired_even_when_used(&store);
    }

    #[test]
    fn concurrent_consumers_have_one_winner() {
        let (_dir, store) = open_store();
        conformance::concurrent_consumers_have_one_winner(Arc::new(store));
    }

    #[test]
    fn create_node_is_idempotent() {
        let (_dir, store) = open_store();
        conformance::create_node_is_idempotent(&store);
    }

    #[test]
    fn key_authorization_is_all_or_nothing() {
        let (_dir, store) = open_store();
        conformance::key_authorization_is_all_or_nothing(&store);
    }

    #[test]
    fn transitions_are_compare_and_set() {
        let (_dir, store) = open_store();
        conformance::transitions_are_compare_and_set(&store);
    }

    #[test]
    fn endpoints_are_replaced() {
        let (_dir, store) = open_store();
        conformance::endpoints_are_replaced(&store);
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshgate.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            let ns = store.create_namespace("acme", Utc::now()).unwrap();
            store
                .create_node_if_absent(
                    NewNode {
                        namespace_id: ns.id,
                        public_key: conformance::node_key(5),
                        name: "persisted".into(),
                    },
                    Utc::now(),
                )
                .unwrap();
        }

        let store = RedbStore::open(&path).unwrap();
        let ns = store.find_namespace("acme").unwrap().unwrap();
        let node = store.find_node(&conformance::node_key(5)).unwrap().unwrap();
        assert_eq!(node.namespace_id, ns.id);
        assert_eq!(node.name, "persisted");

        // Id counters continue where they left off.
        let second = store.create_namespace("beta", Utc::now()).unwrap();
        assert_eq!(second.id, ns.id + 1);
    }

    #[test]
    fn open_reports_unusable_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let result = RedbStore::open(&blocker.join("meshgate.redb"));
        assert!(matches!(
            result,
            Err(ControlError::Store(StoreError::Io(_)))
        ));
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-memory store.
//!
//! Used by tests and by deployments without `DATABASE_PATH`. All tables sit
//! behind one mutex, so every trait method is a transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{
    apply_key_authorization, apply_transition, Namespace, NamespaceId, NewNode, NewPreAuthKey,
    Node, NodeId, NodeState, PreAuthKey, Store, StoreError,
};
use crate::control::{ControlError, ControlResult};
use crate::identity::NodeKey;

#[derive(Default)]
struct Tables {
    namespaces: BTreeMap<NamespaceId, Namespace>,
    keys: HashMap<String, PreAuthKey>,
    nodes: BTreeMap<NodeId, Node>,
    node_keys: HashMap<NodeKey, NodeId>,
    next_namespace_id: u64,
    next_key_id: u64,
    next_node_id: u64,
}

impl Tables {
    fn next_id(counter: &mut u64) -> u64 {
        *counter += 1;
        *counter
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> ControlResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| ControlError::Store(StoreError::Poisoned))
    }
}

impl Store for MemoryStore {
    fn create_namespace(&self, name: &str, now: DateTime<Utc>) -> ControlResult<Namespace> {
        let mut tables = self.tables()?;
        if tables.namespaces.values().any(|ns| ns.name == name) {
            return Err(ControlError::AlreadyExists {
                kind: "namespace",
                id: name.to_string(),
            });
        }
        let id = Tables::next_id(&mut tables.next_namespace_id);
        let namespace = Namespace {
            id,
            name: name.to_string(),
            created_at: now,
        };
        tables.namespaces.insert(id, namespace.clone());
        Ok(namespace)
    }

    fn find_namespace(&self, name: &str) -> ControlResult<Option<Namespace>> {
        let tables = self.tables()?;
        Ok(tables.namespaces.values().find(|ns| ns.name == name).cloned())
    }

    fn get_namespace(&self, id: NamespaceId) -> ControlResult<Option<Namespace>> {
        Ok(self.tables()?.namespaces.get(&id).cloned())
    }

    fn list_namespaces(&self) -> ControlResult<Vec<Namespace>> {
        Ok(self.tables()?.namespaces.values().cloned().collect())
    }

    fn insert_key(&self, key: NewPreAuthKey) -> ControlResult<PreAuthKey> {
        let mut tables = self.tables()?;
        if tables.keys.contains_key(&key.key) {
            return Err(ControlError::AlreadyExists {
                kind: "pre-auth key",
                id: "<redacted>".to_string(),
            });
        }
        let id = Tables::next_id(&mut tables.next_key_id);
        let record = PreAuthKey {
            id,
            key: key.key,
            namespace_id: key.namespace_id,
            reusable: key.reusable,
            used: false,
            created_at: key.created_at,
            expiration: key.expiration,
        };
        tables.keys.insert(record.key.clone(), record.clone());
        Ok(record)
    }

    fn find_key(&self, token: &str) -> ControlResult<Option<PreAuthKey>> {
        Ok(self.tables()?.keys.get(token).cloned())
    }

    fn list_keys(&self, namespace_id: NamespaceId) -> ControlResult<Vec<PreAuthKey>> {
        let tables = self.tables()?;
        let mut keys: Vec<PreAuthKey> = tables
            .keys
            .values()
            .filter(|k| k.namespace_id == namespace_id)
            .cloned()
            .collect();
        keys.sort_by_key(|k| (k.created_at, k.id));
        Ok(keys)
    }

    fn update_key(&self, key: &PreAuthKey) -> ControlResult<()> {
        let mut tables = self.tables()?;
        match tables.keys.get_mut(&key.key) {
            Some(existing) => {
                *existing = key.clone();
                Ok(())
            }
            None => Err(ControlError::key_not_found()),
        }
    }

    fn consume_key(&self, token: &str, now: DateTime<Utc>) -> ControlResult<PreAuthKey> {
        let mut tables = self.tables()?;
        let key = tables
            .keys
            .get_mut(token)
            .ok_or_else(ControlError::key_not_found)?;
        key.check_usable(now)?;
        if !key.reusable {
            key.used = true;
        }
        Ok(key.clone())
    }

    fn find_node(&self, public_key: &NodeKey) -> ControlResult<Option<Node>> {
        let tables = self.tables()?;
        Ok(tables
            .node_keys
            .get(public_key)
            .and_then(|id| tables.nodes.get(id))
            .cloned())
    }

    fn get_node(&self, id: NodeId) -> ControlResult<Option<Node>> {
        Ok(self.tables()?.nodes.get(&id).cloned())
    }

    fn create_node_if_absent(
        &self,
        node: NewNode,
        now: DateTime<Utc>,
    ) -> ControlResult<(Node, bool)> {
        let mut tables = self.tables()?;
        if let Some(existing) = tables
            .node_keys
            .get(&node.public_key)
            .and_then(|id| tables.nodes.get(id))
        {
            return Ok((existing.clone(), false));
        }
        let id = Tables::next_id(&mut tables.next_node_id);
        let record = node.into_node(id, now);
        tables.node_keys.insert(record.public_key, id);
        tables.nodes.insert(id, record.clone());
        Ok((record, true))
    }

    fn list_nodes(&self, namespace_id: NamespaceId) -> ControlResult<Vec<Node>> {
        let tables = self.tables()?;
        Ok(tables
            .nodes
            .values()
            .filter(|n| n.namespace_id == namespace_id)
            .cloned()
            .collect())
    }

    fn authorize_node_with_key(
        &self,
        public_key: &NodeKey,
        token: &str,
        now: DateTime<Utc>,
    ) -> ControlResult<Node> {
        let mut tables = self.tables()?;
        let node_id = *tables
            .node_keys
            .get(public_key)
            .ok_or_else(|| ControlError::node_not_found(public_key.short()))?;

        // Work on copies so a failed check leaves both records untouched.
        let mut node = tables
            .nodes
            .get(&node_id)
            .cloned()
            .ok_or_else(|| ControlError::node_not_found(node_id))?;
        let mut key = tables
            .keys
            .get(token)
            .cloned()
            .ok_or_else(ControlError::key_not_found)?;

        let key_changed = apply_key_authorization(&mut node, &mut key, now)?;
        if key_changed {
            tables.keys.insert(key.key.clone(), key);
        }
        tables.nodes.insert(node_id, node.clone());
        Ok(node)
    }

    fn set_endpoints(&self, id: NodeId, endpoints: Vec<String>) -> ControlResult<Node> {
        let mut tables = self.tables()?;
        let node = tables
            .nodes
            .get_mut(&id)
            .ok_or_else(|| ControlError::node_not_found(id))?;
        node.endpoints = endpoints;
        Ok(node.clone())
    }

    fn transition_node(
        &self,
        id: NodeId,
        allowed_from: &[NodeState],
        to: NodeState,
        now: DateTime<Utc>,
    ) -> ControlResult<Node> {
        let mut tables = self.tables()?;
        let node = tables
            .nodes
            .get_mut(&id)
            .ok_or_else(|| ControlError::node_not_found(id))?;
        apply_transition(node, allowed_from, to, now)?;
        Ok(node.clone())
    }
}

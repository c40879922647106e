// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Node registration state machine.
//!
//! ```text
//!   (none) --begin--> Pending --key / approve--> Authorized <--detach-- Active
//!                                                     |                   ^
//!                                                     +------attach-------+
//!   any non-terminal --revoke--> Revoked     any non-terminal --expire--> Expired
//! ```
//!
//! Every transition is a compare-and-set in the store, so concurrent requests
//! for one node are serialized there. A session is installed only after the
//! durable transition to `Active` has committed.
//!
//! Attach, detach and the stale sweep each pair a store transition with a
//! registry change. Those pairs run under a per-node lock so the persisted
//! state and the registry never disagree about whether a node is polling.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{Duration, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::keys::KeyService;
use super::netmap::MapCoordinator;
use super::sessions::{MapPayload, SessionHandle, SessionRegistry};
use super::{ControlError, ControlResult};
use crate::identity::NodeKey;
use crate::storage::{NewNode, Node, NodeId, NodeState, Store};

/// Upper bound on endpoints a node may report.
pub const MAX_ENDPOINTS: usize = 32;

/// A registration request as seen by the core.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub public_key: NodeKey,
    pub name: String,
    /// Explicit namespace; taken from the pre-auth key when absent.
    pub namespace: Option<String>,
    pub auth_key: Option<String>,
}

/// One lock per node id that ever attached a session.
#[derive(Default)]
struct NodeLocks {
    locks: Mutex<HashMap<NodeId, Arc<Mutex<()>>>>,
}

impl NodeLocks {
    fn get(&self, node_id: NodeId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(node_id)
            .or_default()
            .clone()
    }
}

fn hold(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Registrar {
    store: Arc<dyn Store>,
    keys: Arc<KeyService>,
    sessions: Arc<SessionRegistry>,
    netmap: Arc<MapCoordinator>,
    node_locks: NodeLocks,
}

impl Registrar {
    pub fn new(
        store: Arc<dyn Store>,
        keys: Arc<KeyService>,
        sessions: Arc<SessionRegistry>,
        netmap: Arc<MapCoordinator>,
    ) -> Self {
        Self {
            store,
            keys,
            sessions,
            netmap,
            node_locks: NodeLocks::default(),
        }
    }

    fn node(&self, node_id: NodeId) -> ControlResult<Node> {
        self.store
            .get_node(node_id)?
            .ok_or_else(|| ControlError::node_not_found(node_id))
    }

    pub fn find_by_key(&self, public_key: &NodeKey) -> ControlResult<Node> {
        self.store
            .find_node(public_key)?
            .ok_or_else(|| ControlError::node_not_found(public_key.short()))
    }

    /// Record a key exchange. Creates a `Pending` node on first contact and
    /// returns the existing record on every retry.
    pub fn begin_registration(
        &self,
        public_key: NodeKey,
        namespace: &str,
        name: &str,
    ) -> ControlResult<Node> {
        let namespace = self
            .store
            .find_namespace(namespace)?
            .ok_or_else(|| ControlError::namespace_not_found(namespace))?;

        let (node, created) = self.store.create_node_if_absent(
            NewNode {
                namespace_id: namespace.id,
                public_key,
                name: name.to_string(),
            },
            Utc::now(),
        )?;

        if node.state.is_terminal() {
            warn!(node_id = node.id, state = %node.state, "Rejected registration of retired node");
            return Err(ControlError::NotAuthorized(format!(
                "node {} is {}",
                node.id, node.state
            )));
        }
        if created {
            info!(
                node_id = node.id,
                node_key = %public_key.short(),
                namespace = %namespace.name,
                "Node registration pending"
            );
        }
        Ok(node)
    }

    /// Authorize a node with a pre-auth key.
    ///
    /// Key consumption and the `Pending -> Authorized` move share one store
    /// transaction. On failure the node is left exactly as it was.
    pub fn authorize_with_key(&self, public_key: &NodeKey, token: &str) -> ControlResult<Node> {
        let before = self.find_by_key(public_key)?;
        let node = self.keys.authorize_node(public_key, token)?;

        if before.state == NodeState::Pending {
            info!(
                node_id = node.id,
                namespace_id = node.namespace_id,
                auth_key_id = ?node.auth_key_id,
                "Node authorized with pre-auth key"
            );
            if before.namespace_id != node.namespace_id {
                self.netmap.notify_changed(before.namespace_id);
            }
            self.netmap.notify_changed(node.namespace_id);
        }
        Ok(node)
    }

    /// Administrative approval. Approving an authorized node is a no-op.
    pub fn authorize_manually(&self, node_id: NodeId) -> ControlResult<Node> {
        let current = self.node(node_id)?;
        if current.state.is_authorized() {
            return Ok(current);
        }

        let node = self.store.transition_node(
            node_id,
            &[NodeState::Pending],
            NodeState::Authorized,
            Utc::now(),
        )?;
        info!(node_id, "Node authorized manually");
        self.netmap.notify_changed(node.namespace_id);
        Ok(node)
    }

    /// Start serving a poll connection for `node_id`.
    ///
    /// The node receives its first map on the returned channel. Any earlier
    /// session of the same node is closed.
    pub fn attach_session(
        &self,
        node_id: NodeId,
    ) -> ControlResult<(SessionHandle, mpsc::Receiver<MapPayload>)> {
        let lock = self.node_locks.get(node_id);
        let _serial = hold(&lock);

        let node = self.store.transition_node(
            node_id,
            &[NodeState::Authorized, NodeState::Active],
            NodeState::Active,
            Utc::now(),
        )?;
        let (handle, receiver) = self.sessions.register(node.id, node.namespace_id);

        // A revoke that committed between the transition and `register` has
        // already run its eviction; do not leave this session behind.
        let current = match self.node(node_id) {
            Ok(current) => current,
            Err(e) => {
                self.sessions.unregister(&handle);
                return Err(e);
            }
        };
        if current.state.is_terminal() {
            self.sessions.unregister(&handle);
            return Err(ControlError::NotAuthorized(format!(
                "node {} is {}",
                node_id, current.state
            )));
        }

        info!(node_id, namespace_id = node.namespace_id, "Poll session attached");
        self.netmap.notify_changed(node.namespace_id);
        Ok((handle, receiver))
    }

    /// End a poll connection. Only the live session demotes the node; a
    /// superseded handle is ignored. Returns whether anything changed.
    pub fn detach_session(&self, handle: &SessionHandle) -> ControlResult<bool> {
        let lock = self.node_locks.get(handle.node_id);
        let _serial = hold(&lock);

        if !self.sessions.unregister(handle) {
            debug!(node_id = handle.node_id, "Detach of superseded session ignored");
            return Ok(false);
        }

        match self.store.transition_node(
            handle.node_id,
            &[NodeState::Active],
            NodeState::Authorized,
            Utc::now(),
        ) {
            Ok(_) => info!(node_id = handle.node_id, "Poll session detached"),
            // Revoked or removed while polling.
            Err(ControlError::NotAuthorized(_)) | Err(ControlError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        self.netmap.notify_changed(handle.namespace_id);
        Ok(true)
    }

    pub fn revoke(&self, node_id: NodeId) -> ControlResult<Node> {
        self.retire(node_id, NodeState::Revoked)
    }

    pub fn expire(&self, node_id: NodeId) -> ControlResult<Node> {
        self.retire(node_id, NodeState::Expired)
    }

    fn retire(&self, node_id: NodeId, to: NodeState) -> ControlResult<Node> {
        let node = self.store.transition_node(
            node_id,
            &[
                NodeState::Pending,
                NodeState::Authorized,
                NodeState::Active,
            ],
            to,
            Utc::now(),
        )?;
        let had_session = self.sessions.evict(node_id);
        info!(node_id, state = %to, had_session, "Node retired");
        self.netmap.notify_changed(node.namespace_id);
        Ok(node)
    }

    /// Registration as driven by the machine endpoint: key exchange, then
    /// key authorization when a key is presented.
    ///
    /// An already authorized node skips the key step, so a retried request
    /// gets its current state back instead of `KeyAlreadyUsed`.
    pub fn register(&self, request: Enrollment) -> ControlResult<Node> {
        let namespace = match (&request.namespace, &request.auth_key) {
            (Some(namespace), _) => namespace.clone(),
            (None, Some(token)) => self.keys.namespace_of(token)?.name,
            (None, None) => {
                return Err(ControlError::InvalidInput(
                    "either a namespace or a pre-auth key is required".into(),
                ))
            }
        };

        let node = self.begin_registration(request.public_key, &namespace, &request.name)?;
        match request.auth_key {
            Some(token) if node.state == NodeState::Pending => {
                self.authorize_with_key(&request.public_key, &token)
            }
            _ => Ok(node),
        }
    }

    /// Store reachability metadata reported by a poll request.
    pub fn update_endpoints(&self, node_id: NodeId, endpoints: Vec<String>) -> ControlResult<Node> {
        if endpoints.len() > MAX_ENDPOINTS {
            return Err(ControlError::InvalidInput(format!(
                "at most {MAX_ENDPOINTS} endpoints are accepted"
            )));
        }
        if let Some(bad) = endpoints.iter().find(|e| e.parse::<SocketAddr>().is_err()) {
            return Err(ControlError::InvalidInput(format!(
                "endpoint {bad:?} is not an ip:port pair"
            )));
        }

        let current = self.node(node_id)?;
        if current.state.is_terminal() {
            return Err(ControlError::NotAuthorized(format!(
                "node {} is {}",
                node_id, current.state
            )));
        }
        if current.endpoints == endpoints {
            return Ok(current);
        }

        let node = self.store.set_endpoints(node_id, endpoints)?;
        debug!(node_id, endpoints = ?node.endpoints, "Node endpoints updated");
        self.netmap.notify_changed(node.namespace_id);
        Ok(node)
    }

    /// Demote nodes persisted as `Active` that hold no session and have not
    /// been seen for `grace`. Returns how many were demoted.
    pub fn deactivate_stale(&self, grace: Duration) -> ControlResult<usize> {
        let cutoff = Utc::now() - grace;
        let mut demoted = 0;

        for namespace in self.store.list_namespaces()? {
            let mut changed = false;
            for node in self.store.list_nodes(namespace.id)? {
                if node.state != NodeState::Active || self.sessions.is_connected(node.id) {
                    continue;
                }
                if node.last_seen.is_some_and(|seen| seen > cutoff) {
                    continue;
                }
                let lock = self.node_locks.get(node.id);
                let _serial = hold(&lock);
                // An attach may have completed since the listing.
                if self.sessions.is_connected(node.id) {
                    continue;
                }
                match self.store.transition_node(
                    node.id,
                    &[NodeState::Active],
                    NodeState::Authorized,
                    Utc::now(),
                ) {
                    Ok(_) => {
                        demoted += 1;
                        changed = true;
                    }
                    Err(ControlError::NotAuthorized(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            if changed {
                self.netmap.notify_changed(namespace.id);
            }
        }

        if demoted > 0 {
            info!(demoted, "Demoted stale active nodes");
        }
        Ok(demoted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration as StdDuration;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;
    use crate::control::netmap::{MapResponse, PeerVisibility};
    use crate::storage::{
        MemoryStore, Namespace, NamespaceId, NewPreAuthKey, PreAuthKey, StoreError,
    };

    struct Harness {
        store: Arc<MemoryStore>,
        keys: Arc<KeyService>,
        sessions: Arc<SessionRegistry>,
        registrar: Registrar,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        store.create_namespace("acme", Utc::now()).unwrap();
        store.create_namespace("globex", Utc::now()).unwrap();

        let keys = Arc::new(KeyService::new(store.clone()));
        let sessions = Arc::new(SessionRegistry::default());
        let netmap = Arc::new(MapCoordinator::new(
            store.clone(),
            sessions.clone(),
            json!({"regions": {}}),
            PeerVisibility::Authorized,
        ));
        let registrar = Registrar::new(store.clone(), keys.clone(), sessions.clone(), netmap);
        Harness {
            store,
            keys,
            sessions,
            registrar,
        }
    }

    /// Memory store whose node reads fail while `broken` is set.
    struct BrokenReads {
        inner: MemoryStore,
        broken: AtomicBool,
    }

    impl BrokenReads {
        fn check(&self) -> ControlResult<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(ControlError::Store(StoreError::Poisoned));
            }
            Ok(())
        }
    }

    impl Store for BrokenReads {
        fn create_namespace(&self, name: &str, now: DateTime<Utc>) -> ControlResult<Namespace> {
            self.inner.create_namespace(name, now)
        }
        fn find_namespace(&self, name: &str) -> ControlResult<Option<Namespace>> {
            self.inner.find_namespace(name)
        }
        fn get_namespace(&self, id: NamespaceId) -> ControlResult<Option<Namespace>> {
            self.inner.get_namespace(id)
        }
        fn list_namespaces(&self) -> ControlResult<Vec<Namespace>> {
            self.inner.list_namespaces()
        }
        fn insert_key(&self, key: NewPreAuthKey) -> ControlResult<PreAuthKey> {
            self.inner.insert_key(key)
        }
        fn find_key(&self, token: &str) -> ControlResult<Option<PreAuthKey>> {
            self.inner.find_key(token)
        }
        fn list_keys(&self, namespace_id: NamespaceId) -> ControlResult<Vec<PreAuthKey>> {
            self.inner.list_keys(namespace_id)
        }
        fn update_key(&self, key: &PreAuthKey) -> ControlResult<()> {
            self.inner.update_key(key)
        }
        fn consume_key(&self, token: &str, now: DateTime<Utc>) -> ControlResult<PreAuthKey> {
            self.inner.consume_key(token, now)
        }
        fn find_node(&self, public_key: &NodeKey) -> ControlResult<Option<Node>> {
            self.check()?;
            self.inner.find_node(public_key)
        }
        fn get_node(&self, id: NodeId) -> ControlResult<Option<Node>> {
            self.check()?;
            self.inner.get_node(id)
        }
        fn create_node_if_absent(
            &self,
            node: NewNode,
            now: DateTime<Utc>,
        ) -> ControlResult<(Node, bool)> {
            self.inner.create_node_if_absent(node, now)
        }
        fn list_nodes(&self, namespace_id: NamespaceId) -> ControlResult<Vec<Node>> {
            self.inner.list_nodes(namespace_id)
        }
        fn authorize_node_with_key(
            &self,
            public_key: &NodeKey,
            token: &str,
            now: DateTime<Utc>,
        ) -> ControlResult<Node> {
            self.inner.authorize_node_with_key(public_key, token, now)
        }
        fn set_endpoints(&self, id: NodeId, endpoints: Vec<String>) -> ControlResult<Node> {
            self.inner.set_endpoints(id, endpoints)
        }
        fn transition_node(
            &self,
            id: NodeId,
            allowed_from: &[NodeState],
            to: NodeState,
            now: DateTime<Utc>,
        ) -> ControlResult<Node> {
            self.inner.transition_node(id, allowed_from, to, now)
        }
    }

    fn node_key(byte: u8) -> NodeKey {
        NodeKey::from_bytes([byte; 32])
    }

    fn enrollment(byte: u8, auth_key: Option<&str>) -> Enrollment {
        Enrollment {
            public_key: node_key(byte),
            name: format!("node-{byte}"),
            namespace: None,
            auth_key: auth_key.map(str::to_string),
        }
    }

    async fn next_map(rx: &mut mpsc::Receiver<MapPayload>) -> MapResponse {
        let payload = tokio::time::timeout(StdDuration::from_secs(1), rx.recv())
            .await
            .expect("map update expected")
            .expect("channel closed unexpectedly");
        serde_json::from_slice(&payload).unwrap()
    }

    fn authorized(h: &Harness, byte: u8) -> Node {
        let node = h
            .registrar
            .begin_registration(node_key(byte), "acme", &format!("node-{byte}"))
            .unwrap();
        h.registrar.authorize_manually(node.id).unwrap()
    }

    #[test]
    fn begin_registration_is_idempotent() {
        let h = harness();
        let first = h.registrar.begin_registration(node_key(1), "acme", "a").unwrap();
        let second = h.registrar.begin_registration(node_key(1), "acme", "a").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.state, NodeState::Pending);
        assert_eq!(h.store.list_nodes(first.namespace_id).unwrap().len(), 1);
    }

    #[test]
    fn begin_registration_unknown_namespace_is_not_found() {
        let h = harness();
        assert!(matches!(
            h.registrar.begin_registration(node_key(1), "ghost", "a"),
            Err(ControlError::NotFound { kind: "namespace", .. })
        ));
    }

    #[test]
    fn single_use_key_authorizes_one_node() {
        let h = harness();
        let k1 = h.keys.issue_key("acme", false, None).unwrap();

        let a = h.registrar.register(enrollment(1, Some(&k1.key))).unwrap();
        assert_eq!(a.state, NodeState::Authorized);
        assert_eq!(a.auth_key_id, Some(k1.id));

        let b = h.registrar.register(enrollment(2, Some(&k1.key)));
        assert!(matches!(b, Err(ControlError::KeyAlreadyUsed)));
        let b = h.store.find_node(&node_key(2)).unwrap().unwrap();
        assert_eq!(b.state, NodeState::Pending);
    }

    #[test]
    fn retried_registration_returns_current_state() {
        let h = harness();
        let k1 = h.keys.issue_key("acme", false, None).unwrap();
        let first = h.registrar.register(enrollment(1, Some(&k1.key))).unwrap();
        let retry = h.registrar.register(enrollment(1, Some(&k1.key))).unwrap();
        assert_eq!(first.id, retry.id);
        assert_eq!(retry.state, NodeState::Authorized);
    }

    #[test]
    fn failed_key_authorization_leaves_node_pending() {
        let h = harness();
        let key = h.keys.issue_key("acme", false, None).unwrap();
        h.keys.expire_key(&key.key).unwrap();

        h.registrar.begin_registration(node_key(1), "acme", "a").unwrap();
        assert!(matches!(
            h.registrar.authorize_with_key(&node_key(1), &key.key),
            Err(ControlError::KeyExpired)
        ));
        assert!(matches!(
            h.registrar.authorize_with_key(&node_key(1), "ffff"),
            Err(ControlError::NotFound { .. })
        ));
        let node = h.store.find_node(&node_key(1)).unwrap().unwrap();
        assert_eq!(node.state, NodeState::Pending);
        assert_eq!(node.auth_key_id, None);
    }

    #[test]
    fn key_binds_node_to_its_namespace() {
        let h = harness();
        let key = h.keys.issue_key("globex", true, None).unwrap();
        h.registrar.begin_registration(node_key(1), "acme", "a").unwrap();
        let node = h.registrar.authorize_with_key(&node_key(1), &key.key).unwrap();
        let globex = h.store.find_namespace("globex").unwrap().unwrap();
        assert_eq!(node.namespace_id, globex.id);
    }

    #[test]
    fn register_requires_namespace_or_key() {
        let h = harness();
        assert!(matches!(
            h.registrar.register(enrollment(1, None)),
            Err(ControlError::InvalidInput(_))
        ));

        let mut request = enrollment(1, None);
        request.namespace = Some("acme".into());
        let node = h.registrar.register(request).unwrap();
        assert_eq!(node.state, NodeState::Pending);
    }

    #[test]
    fn pending_node_cannot_attach() {
        let h = harness();
        let node = h.registrar.begin_registration(node_key(1), "acme", "a").unwrap();
        assert!(matches!(
            h.registrar.attach_session(node.id),
            Err(ControlError::NotAuthorized(_))
        ));
        assert!(!h.sessions.is_connected(node.id));
        assert!(matches!(
            h.registrar.attach_session(999),
            Err(ControlError::NotFound { .. })
        ));
    }

    #[test]
    fn manual_approval_is_idempotent() {
        let h = harness();
        let node = authorized(&h, 1);
        assert_eq!(node.state, NodeState::Authorized);
        let again = h.registrar.authorize_manually(node.id).unwrap();
        assert_eq!(again.state, NodeState::Authorized);
    }

    #[tokio::test]
    async fn attached_node_sees_peer_changes() {
        let h = harness();
        let a = authorized(&h, 1);
        let (_handle, mut c1) = h.registrar.attach_session(a.id).unwrap();
        assert_eq!(
            h.store.get_node(a.id).unwrap().unwrap().state,
            NodeState::Active
        );

        let initial = next_map(&mut c1).await;
        assert!(initial.peers.is_empty());

        let b = authorized(&h, 2);
        let update = next_map(&mut c1).await;
        assert_eq!(update.peers.len(), 1);
        assert_eq!(update.peers[0].id, b.id);
        assert_eq!(update.peers[0].public_key, node_key(2).to_hex());
    }

    #[tokio::test]
    async fn reconnect_supersedes_previous_session() {
        let h = harness();
        let a = authorized(&h, 1);
        let (first, mut c1) = h.registrar.attach_session(a.id).unwrap();
        next_map(&mut c1).await;

        let (second, mut c2) = h.registrar.attach_session(a.id).unwrap();
        assert!(c1.recv().await.is_none());
        next_map(&mut c2).await;

        authorized(&h, 2);
        assert_eq!(next_map(&mut c2).await.peers.len(), 1);
        assert!(c1.recv().await.is_none());

        // The stale handle must not demote the live session.
        assert!(!h.registrar.detach_session(&first).unwrap());
        assert_eq!(
            h.store.get_node(a.id).unwrap().unwrap().state,
            NodeState::Active
        );
        assert!(h.registrar.detach_session(&second).unwrap());
    }

    #[test]
    fn reconnect_racing_old_detach_keeps_node_active() {
        let h = harness();
        let a = authorized(&h, 1);
        let (mut previous, _first_rx) = h.registrar.attach_session(a.id).unwrap();

        for _ in 0..200 {
            let (handle, _rx) = thread::scope(|scope| {
                let attach = scope.spawn(|| h.registrar.attach_session(a.id).unwrap());
                let detach = scope.spawn(|| h.registrar.detach_session(&previous).unwrap());
                detach.join().unwrap();
                attach.join().unwrap()
            });

            assert!(h.sessions.is_connected(a.id));
            assert_eq!(
                h.store.get_node(a.id).unwrap().unwrap().state,
                NodeState::Active
            );
            previous = handle;
        }

        assert!(h.registrar.detach_session(&previous).unwrap());
        assert_eq!(
            h.store.get_node(a.id).unwrap().unwrap().state,
            NodeState::Authorized
        );
    }

    #[test]
    fn failed_reread_after_attach_leaves_no_session() {
        let store = Arc::new(BrokenReads {
            inner: MemoryStore::new(),
            broken: AtomicBool::new(false),
        });
        let ns = store.create_namespace("acme", Utc::now()).unwrap();
        let (node, _) = store
            .create_node_if_absent(
                NewNode {
                    namespace_id: ns.id,
                    public_key: node_key(1),
                    name: "a".into(),
                },
                Utc::now(),
            )
            .unwrap();
        store
            .transition_node(node.id, &[NodeState::Pending], NodeState::Authorized, Utc::now())
            .unwrap();

        let sessions = Arc::new(SessionRegistry::default());
        let netmap = Arc::new(MapCoordinator::new(
            store.clone(),
            sessions.clone(),
            json!({}),
            PeerVisibility::Authorized,
        ));
        let keys = Arc::new(KeyService::new(store.clone()));
        let registrar = Registrar::new(store.clone(), keys, sessions.clone(), netmap);

        store.broken.store(true, Ordering::SeqCst);
        assert!(matches!(
            registrar.attach_session(node.id),
            Err(ControlError::Store(_))
        ));
        assert!(!sessions.is_connected(node.id));
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let h = harness();
        let a = authorized(&h, 1);
        let (handle, _rx) = h.registrar.attach_session(a.id).unwrap();

        assert!(h.registrar.detach_session(&handle).unwrap());
        assert!(!h.registrar.detach_session(&handle).unwrap());
        assert!(!h.sessions.is_connected(a.id));
        assert_eq!(
            h.store.get_node(a.id).unwrap().unwrap().state,
            NodeState::Authorized
        );
    }

    #[tokio::test]
    async fn revoke_closes_session_and_blocks_reentry() {
        let h = harness();
        let a = authorized(&h, 1);
        let (handle, mut rx) = h.registrar.attach_session(a.id).unwrap();
        next_map(&mut rx).await;

        let revoked = h.registrar.revoke(a.id).unwrap();
        assert_eq!(revoked.state, NodeState::Revoked);
        assert!(rx.recv().await.is_none());

        assert!(!h.registrar.detach_session(&handle).unwrap());
        assert!(matches!(
            h.registrar.attach_session(a.id),
            Err(ControlError::NotAuthorized(_))
        ));
        assert!(matches!(
            h.registrar.begin_registration(node_key(1), "acme", "a"),
            Err(ControlError::NotAuthorized(_))
        ));
        assert!(matches!(
            h.registrar.revoke(a.id),
            Err(ControlError::NotAuthorized(_))
        ));
    }

    #[tokio::test]
    async fn expired_node_is_terminal() {
        let h = harness();
        let a = authorized(&h, 1);
        assert_eq!(h.registrar.expire(a.id).unwrap().state, NodeState::Expired);
        assert!(matches!(
            h.registrar.attach_session(a.id),
            Err(ControlError::NotAuthorized(_))
        ));
    }

    #[tokio::test]
    async fn endpoint_updates_reach_peers() {
        let h = harness();
        let a = authorized(&h, 1);
        let b = authorized(&h, 2);
        let (_handle, mut rx) = h.registrar.attach_session(a.id).unwrap();
        next_map(&mut rx).await;

        let endpoints = vec!["203.0.113.9:41641".to_string()];
        h.registrar.update_endpoints(b.id, endpoints.clone()).unwrap();
        let update = next_map(&mut rx).await;
        assert_eq!(update.peers[0].endpoints, endpoints);

        // Unchanged endpoints do not trigger another push.
        h.registrar.update_endpoints(b.id, endpoints).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn malformed_endpoints_are_rejected() {
        let h = harness();
        let a = authorized(&h, 1);
        assert!(matches!(
            h.registrar.update_endpoints(a.id, vec!["not-an-endpoint".into()]),
            Err(ControlError::InvalidInput(_))
        ));
        let too_many = vec!["192.0.2.1:1".to_string(); MAX_ENDPOINTS + 1];
        assert!(matches!(
            h.registrar.update_endpoints(a.id, too_many),
            Err(ControlError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn stale_active_nodes_are_demoted() {
        let h = harness();
        let orphan = authorized(&h, 1);
        let live = authorized(&h, 2);

        // Persisted as active with no session, as after a restart.
        h.store
            .transition_node(
                orphan.id,
                &[NodeState::Authorized],
                NodeState::Active,
                Utc::now() - Duration::minutes(10),
            )
            .unwrap();
        let (_handle, _rx) = h.registrar.attach_session(live.id).unwrap();

        assert_eq!(h.registrar.deactivate_stale(Duration::hours(1)).unwrap(), 0);
        assert_eq!(h.registrar.deactivate_stale(Duration::minutes(1)).unwrap(), 1);
        assert_eq!(
            h.store.get_node(orphan.id).unwrap().unwrap().state,
            NodeState::Authorized
        );
        assert_eq!(
            h.store.get_node(live.id).unwrap().unwrap().state,
            NodeState::Active
        );
    }
}

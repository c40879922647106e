// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Network map computation and fan-out.
//!
//! A map is always the full current view, never a delta. A node that misses
//! an update (buffer full, connection down) converges on the next map it
//! receives, so nothing here queues or retries.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use utoipa::ToSchema;

use super::sessions::{MapPayload, SessionRegistry};
use super::{ControlError, ControlResult};
use crate::storage::{NamespaceId, Node, NodeId, NodeState, Store};

/// Which peers a node is shown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerVisibility {
    /// Only peers currently holding a poll connection.
    Active,
    /// Approved peers, whether or not they are polling.
    #[default]
    Authorized,
}

impl PeerVisibility {
    pub fn admits(self, state: NodeState) -> bool {
        match self {
            PeerVisibility::Active => state == NodeState::Active,
            PeerVisibility::Authorized => state.is_authorized(),
        }
    }
}

impl FromStr for PeerVisibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(PeerVisibility::Active),
            "authorized" => Ok(PeerVisibility::Authorized),
            other => Err(format!("unknown peer visibility: {other}")),
        }
    }
}

/// One node as seen in a network map.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: NodeId,
    pub name: String,
    /// Hex-encoded Curve25519 public key
    pub public_key: String,
    pub endpoints: Vec<String>,
    /// Whether the peer currently holds a poll connection
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl From<&Node> for PeerInfo {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id,
            name: node.name.clone(),
            public_key: node.public_key.to_hex(),
            endpoints: node.endpoints.clone(),
            online: node.state == NodeState::Active,
            last_seen: node.last_seen,
        }
    }
}

/// Payload pushed to a polling node.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MapResponse {
    /// The receiving node itself
    pub node: PeerInfo,
    /// Visible peers ordered by id
    pub peers: Vec<PeerInfo>,
    /// Relay configuration, passed through verbatim
    #[schema(value_type = Object)]
    pub derp_map: serde_json::Value,
    /// Keepalives carry no map content
    #[serde(default)]
    pub keep_alive: bool,
}

/// Line written to the stream between map updates.
const KEEPALIVE_LINE: &[u8] = b"{\"keep_alive\":true}\n";

/// Encode a payload as one NDJSON line.
fn to_line<T: Serialize>(value: &T) -> ControlResult<MapPayload> {
    let mut bytes = serde_json::to_vec(value)
        .map_err(|e| ControlError::Internal(format!("map serialization failed: {e}")))?;
    bytes.push(b'\n');
    Ok(MapPayload::from(bytes))
}

pub struct MapCoordinator {
    store: Arc<dyn Store>,
    sessions: Arc<SessionRegistry>,
    derp_map: Arc<serde_json::Value>,
    visibility: PeerVisibility,
}

impl MapCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        sessions: Arc<SessionRegistry>,
        derp_map: serde_json::Value,
        visibility: PeerVisibility,
    ) -> Self {
        Self {
            store,
            sessions,
            derp_map: Arc::new(derp_map),
            visibility,
        }
    }

    pub fn visibility(&self) -> PeerVisibility {
        self.visibility
    }

    /// The map `node_id` should see right now. Read-only.
    pub fn compute_map(&self, node_id: NodeId) -> ControlResult<MapResponse> {
        let node = self
            .store
            .get_node(node_id)?
            .ok_or_else(|| ControlError::node_not_found(node_id))?;

        let peers = self
            .store
            .list_nodes(node.namespace_id)?
            .iter()
            .filter(|peer| peer.id != node.id && self.visibility.admits(peer.state))
            .map(PeerInfo::from)
            .collect();

        Ok(MapResponse {
            node: PeerInfo::from(&node),
            peers,
            derp_map: (*self.derp_map).clone(),
            keep_alive: false,
        })
    }

    /// [`Self::compute_map`] encoded for the poll stream.
    pub fn encoded_map(&self, node_id: NodeId) -> ControlResult<MapPayload> {
        to_line(&self.compute_map(node_id)?)
    }

    pub fn keepalive_payload(&self) -> MapPayload {
        MapPayload::from_static(KEEPALIVE_LINE)
    }

    /// Recompute and push the map of every polling node in `namespace_id`.
    ///
    /// Returns how many nodes accepted an update.
    pub fn notify_changed(&self, namespace_id: NamespaceId) -> usize {
        let targets = self.sessions.sessions_in(namespace_id);
        if targets.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        for node_id in &targets {
            match self.encoded_map(*node_id) {
                Ok(payload) => {
                    if self.sessions.send_to(*node_id, payload) {
                        delivered += 1;
                    }
                }
                Err(e) => warn!(node_id, error = %e, "Failed to compute network map"),
            }
        }

        debug!(
            namespace_id,
            targets = targets.len(),
            delivered,
            "Distributed network map"
        );
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeKey;
    use crate::storage::{MemoryStore, NewNode};

    struct Fixture {
        store: Arc<MemoryStore>,
        sessions: Arc<SessionRegistry>,
        namespace_id: NamespaceId,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let ns = store.create_namespace("acme", Utc::now()).unwrap();
            Self {
                store,
                sessions: Arc::new(SessionRegistry::default()),
                namespace_id: ns.id,
            }
        }

        fn coordinator(&self, visibility: PeerVisibility) -> MapCoordinator {
            MapCoordinator::new(
                self.store.clone(),
                self.sessions.clone(),
                serde_json::json!({"regions": {"1": {"code": "fra"}}}),
                visibility,
            )
        }

        fn node(&self, byte: u8, state: NodeState) -> Node {
            let (node, _) = self
                .store
                .create_node_if_absent(
                    NewNode {
                        namespace_id: self.namespace_id,
                        public_key: NodeKey::from_bytes([byte; 32]),
                        name: format!("node-{byte}"),
                    },
                    Utc::now(),
                )
                .unwrap();
            self.store
                .transition_node(node.id, &[NodeState::Pending], state, Utc::now())
                .unwrap()
        }
    }

    fn peer_ids(map: &MapResponse) -> Vec<NodeId> {
        map.peers.iter().map(|p| p.id).collect()
    }

    #[test]
    fn authorized_policy_shows_approved_peers() {
        let f = Fixture::new();
        let me = f.node(1, NodeState::Active);
        let active = f.node(2, NodeState::Active);
        let authorized = f.node(3, NodeState::Authorized);
        f.node(4, NodeState::Pending);
        f.node(5, NodeState::Revoked);

        let map = f
            .coordinator(PeerVisibility::Authorized)
            .compute_map(me.id)
            .unwrap();
        assert_eq!(peer_ids(&map), vec![active.id, authorized.id]);
        assert_eq!(map.node.id, me.id);
        assert_eq!(map.derp_map["regions"]["1"]["code"], "fra");
        assert!(map.peers[0].online);
        assert!(!map.peers[1].online);
    }

    #[test]
    fn active_policy_shows_only_polling_peers() {
        let f = Fixture::new();
        let me = f.node(1, NodeState::Active);
        let active = f.node(2, NodeState::Active);
        f.node(3, NodeState::Authorized);

        let map = f
            .coordinator(PeerVisibility::Active)
            .compute_map(me.id)
            .unwrap();
        assert_eq!(peer_ids(&map), vec![active.id]);
    }

    #[test]
    fn peers_from_other_namespaces_are_hidden() {
        let f = Fixture::new();
        let me = f.node(1, NodeState::Active);
        let other_ns = f.store.create_namespace("other", Utc::now()).unwrap();
        let (stranger, _) = f
            .store
            .create_node_if_absent(
                NewNode {
                    namespace_id: other_ns.id,
                    public_key: NodeKey::from_bytes([9; 32]),
                    name: "stranger".into(),
                },
                Utc::now(),
            )
            .unwrap();
        f.store
            .transition_node(stranger.id, &[NodeState::Pending], NodeState::Active, Utc::now())
            .unwrap();

        let map = f
            .coordinator(PeerVisibility::Authorized)
            .compute_map(me.id)
            .unwrap();
        assert!(map.peers.is_empty());
    }

    #[test]
    fn compute_map_for_unknown_node_is_not_found() {
        let f = Fixture::new();
        assert!(matches!(
            f.coordinator(PeerVisibility::Authorized).compute_map(404),
            Err(ControlError::NotFound { kind: "node", .. })
        ));
    }

    #[test]
    fn compute_map_has_no_side_effects() {
        let f = Fixture::new();
        let me = f.node(1, NodeState::Authorized);
        let coordinator = f.coordinator(PeerVisibility::Authorized);
        let before = f.store.get_node(me.id).unwrap();
        coordinator.compute_map(me.id).unwrap();
        coordinator.compute_map(me.id).unwrap();
        assert_eq!(f.store.get_node(me.id).unwrap(), before);
    }

    #[tokio::test]
    async fn notify_changed_pushes_map_with_new_peer() {
        let f = Fixture::new();
        let coordinator = f.coordinator(PeerVisibility::Authorized);
        let a = f.node(1, NodeState::Active);
        let (_handle, mut rx) = f.sessions.register(a.id, f.namespace_id);

        let b = f.node(2, NodeState::Authorized);
        assert_eq!(coordinator.notify_changed(f.namespace_id), 1);

        let line = rx.recv().await.unwrap();
        let map: MapResponse = serde_json::from_slice(&line).unwrap();
        assert_eq!(map.peers.len(), 1);
        assert_eq!(map.peers[0].public_key, b.public_key.to_hex());
        assert!(line.ends_with(b"\n"));
    }

    #[test]
    fn notify_changed_without_sessions_is_a_noop() {
        let f = Fixture::new();
        f.node(1, NodeState::Authorized);
        assert_eq!(
            f.coordinator(PeerVisibility::Authorized)
                .notify_changed(f.namespace_id),
            0
        );
    }

    #[tokio::test]
    async fn notify_changed_skips_nodes_that_cannot_receive() {
        let f = Fixture::new();
        let coordinator = f.coordinator(PeerVisibility::Authorized);
        let a = f.node(1, NodeState::Active);
        let b = f.node(2, NodeState::Active);
        let (_ha, rx_a) = f.sessions.register(a.id, f.namespace_id);
        let (_hb, mut rx_b) = f.sessions.register(b.id, f.namespace_id);
        drop(rx_a);

        assert_eq!(coordinator.notify_changed(f.namespace_id), 1);
        assert!(rx_b.recv().await.is_some());
    }

    #[test]
    fn visibility_parses_case_insensitively() {
        assert_eq!("ACTIVE".parse(), Ok(PeerVisibility::Active));
        assert_eq!("authorized".parse(), Ok(PeerVisibility::Authorized));
        assert!("everyone".parse::<PeerVisibility>().is_err());
        assert_eq!(PeerVisibility::default(), PeerVisibility::Authorized);
    }
}

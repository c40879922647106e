// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Registry of nodes currently holding a poll connection.
//!
//! Each entry owns the only sender of a bounded channel whose receiver is
//! held by the poll handler. Removing an entry drops that sender, which
//! closes the channel: this is how a superseded or revoked connection learns
//! it must stop.
//!
//! One mutex guards the table. Critical sections are map operations and
//! `try_send`, which never blocks, so a stuck client can only fill its own
//! buffer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use axum::body::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::storage::{NamespaceId, NodeId};

/// Serialized map update as written to the poll stream.
pub type MapPayload = Bytes;

/// Default per-node channel capacity.
pub const DEFAULT_SESSION_BUFFER: usize = 16;

/// Identifies one registration of a node; used for compare-and-remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    pub node_id: NodeId,
    pub namespace_id: NamespaceId,
    generation: u64,
}

struct SessionEntry {
    namespace_id: NamespaceId,
    generation: u64,
    sender: mpsc::Sender<MapPayload>,
}

enum Delivery {
    Sent,
    NoSession,
    Full,
    Closed,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<NodeId, SessionEntry>>,
    next_generation: AtomicU64,
    buffer: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_BUFFER)
    }
}

impl SessionRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    // Entries hold no invariant a panicking holder could break.
    fn table(&self) -> MutexGuard<'_, HashMap<NodeId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a session for `node_id`, closing any previous one first.
    pub fn register(
        &self,
        node_id: NodeId,
        namespace_id: NamespaceId,
    ) -> (SessionHandle, mpsc::Receiver<MapPayload>) {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let superseded = {
            let mut sessions = self.table();
            // Dropping the old entry drops its sender and closes the channel
            // before the replacement becomes visible.
            let previous = sessions.remove(&node_id);
            let superseded = previous.is_some();
            drop(previous);
            sessions.insert(
                node_id,
                SessionEntry {
                    namespace_id,
                    generation,
                    sender,
                },
            );
            superseded
        };

        if superseded {
            info!(node_id, "Superseded existing poll session");
        } else {
            debug!(node_id, "Registered poll session");
        }

        let handle = SessionHandle {
            node_id,
            namespace_id,
            generation,
        };
        (handle, receiver)
    }

    /// Remove the entry only if it still belongs to `handle`.
    pub fn unregister(&self, handle: &SessionHandle) -> bool {
        let mut sessions = self.table();
        match sessions.get(&handle.node_id) {
            Some(entry) if entry.generation == handle.generation => {
                sessions.remove(&handle.node_id);
                true
            }
            _ => false,
        }
    }

    /// Drop whatever session `node_id` holds, closing its channel.
    pub fn evict(&self, node_id: NodeId) -> bool {
        self.table().remove(&node_id).is_some()
    }

    /// Non-blocking delivery. Returns whether a live recipient took it.
    pub fn send_to(&self, node_id: NodeId, payload: MapPayload) -> bool {
        let delivery = {
            let sessions = self.table();
            match sessions.get(&node_id) {
                None => Delivery::NoSession,
                Some(entry) => match entry.sender.try_send(payload) {
                    Ok(()) => Delivery::Sent,
                    Err(TrySendError::Full(_)) => Delivery::Full,
                    Err(TrySendError::Closed(_)) => Delivery::Closed,
                },
            }
        };

        match delivery {
            Delivery::Sent => true,
            Delivery::NoSession => false,
            Delivery::Full => {
                warn!(node_id, "Session buffer full, dropping map update");
                false
            }
            Delivery::Closed => {
                debug!(node_id, "Session receiver already gone");
                false
            }
        }
    }

    /// Deliver `payload` to every node of `namespace_id` registered right now.
    ///
    /// Returns the number of nodes that accepted it.
    pub fn broadcast(&self, namespace_id: NamespaceId, payload: MapPayload) -> usize {
        let mut full = Vec::new();
        let delivered = {
            let sessions = self.table();
            let mut delivered = 0;
            for (node_id, entry) in sessions.iter() {
                if entry.namespace_id != namespace_id {
                    continue;
                }
                match entry.sender.try_send(payload.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => full.push(*node_id),
                    Err(TrySendError::Closed(_)) => {}
                }
            }
            delivered
        };

        for node_id in full {
            warn!(node_id, "Session buffer full, dropping broadcast");
        }
        delivered
    }

    /// Node ids of the sessions currently registered under `namespace_id`.
    pub fn sessions_in(&self, namespace_id: NamespaceId) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .table()
            .iter()
            .filter(|(_, entry)| entry.namespace_id == namespace_id)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_connected(&self, node_id: NodeId) -> bool {
        self.table().contains_key(&node_id)
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

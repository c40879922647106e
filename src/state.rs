// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::control::{KeyService, MapCoordinator, Registrar, SessionRegistry};
use crate::identity::ServerIdentity;
use crate::storage::Store;

/// Shared handles for every request handler and background task.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub identity: Arc<ServerIdentity>,
    pub store: Arc<dyn Store>,
    pub keys: Arc<KeyService>,
    pub sessions: Arc<SessionRegistry>,
    pub netmap: Arc<MapCoordinator>,
    pub registrar: Arc<Registrar>,
    /// Cancelled on server shutdown; poll streams end when it fires.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config, identity: ServerIdentity, store: Arc<dyn Store>) -> Self {
        let sessions = Arc::new(SessionRegistry::new(config.session_buffer));
        let keys = Arc::new(KeyService::new(store.clone()));
        let netmap = Arc::new(MapCoordinator::new(
            store.clone(),
            sessions.clone(),
            config.derp_map.clone(),
            config.peer_visibility,
        ));
        let registrar = Arc::new(Registrar::new(
            store.clone(),
            keys.clone(),
            sessions.clone(),
            netmap.clone(),
        ));

        Self {
            config: Arc::new(config),
            identity: Arc::new(identity),
            store,
            keys,
            sessions,
            netmap,
            registrar,
            shutdown: CancellationToken::new(),
        }
    }

    #[cfg(test)]
    pub fn in_memory(config: Config) -> Self {
        Self::new(
            config,
            ServerIdentity::from_secret_bytes([7u8; 32]),
            Arc::new(crate::storage::MemoryStore::new()),
        )
    }
}

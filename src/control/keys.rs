// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Pre-auth key issuance and consumption.
//!
//! Keys are 24 random bytes from the OS source, hex-encoded to 48
//! characters. Every check-and-mark runs inside a store transaction, never
//! behind an in-process lock alone, so coordinators sharing one store cannot
//! both accept the same single-use key.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{info, warn};

use super::{ControlError, ControlResult};
use crate::identity::NodeKey;
use crate::storage::{Namespace, NewPreAuthKey, Node, PreAuthKey, Store};

/// Random bytes per key.
pub const KEY_BYTES: usize = 24;

/// Generate a hex-encoded key token.
pub fn generate_key(rng: &dyn SecureRandom) -> ControlResult<String> {
    let mut bytes = [0u8; KEY_BYTES];
    rng.fill(&mut bytes)
        .map_err(|_| ControlError::Internal("system random source failed".into()))?;
    Ok(hex::encode(bytes))
}

/// Owner of pre-auth key records.
pub struct KeyService {
    store: Arc<dyn Store>,
    rng: SystemRandom,
}

impl KeyService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            rng: SystemRandom::new(),
        }
    }

    fn namespace(&self, name: &str) -> ControlResult<Namespace> {
        self.store
            .find_namespace(name)?
            .ok_or_else(|| ControlError::namespace_not_found(name))
    }

    /// Issue a new key for `namespace`.
    ///
    /// The record is persisted before the token is returned.
    pub fn issue_key(
        &self,
        namespace: &str,
        reusable: bool,
        expiration: Option<DateTime<Utc>>,
    ) -> ControlResult<PreAuthKey> {
        let namespace = self.namespace(namespace)?;
        let now = Utc::now();
        if expiration.is_some_and(|e| e <= now) {
            return Err(ControlError::InvalidInput(
                "expiration must be in the future".into(),
            ));
        }

        let key = self.store.insert_key(NewPreAuthKey {
            key: generate_key(&self.rng)?,
            namespace_id: namespace.id,
            reusable,
            created_at: now,
            expiration,
        })?;

        info!(
            key_id = key.id,
            namespace = %namespace.name,
            reusable,
            expiration = ?expiration,
            "Issued pre-auth key"
        );
        Ok(key)
    }

    /// Validate `token` and mark it used when it is single-use.
    ///
    /// Returns the namespace the key enrolls into.
    pub fn validate_and_consume(&self, token: &str) -> ControlResult<Namespace> {
        let key = self.store.consume_key(token, Utc::now()).inspect_err(|e| {
            if !e.is_retryable() {
                warn!(error = %e, "Pre-auth key rejected");
            }
        })?;
        self.store
            .get_namespace(key.namespace_id)?
            .ok_or_else(|| ControlError::namespace_not_found(key.namespace_id.to_string()))
    }

    /// Consume `token` and authorize the node in the same store transaction.
    pub fn authorize_node(&self, public_key: &NodeKey, token: &str) -> ControlResult<Node> {
        self.store
            .authorize_node_with_key(public_key, token, Utc::now())
            .inspect_err(|e| {
                if !e.is_retryable() {
                    warn!(node_key = %public_key.short(), error = %e, "Pre-auth key rejected");
                }
            })
    }

    /// Keys of `namespace` in creation order.
    pub fn list_keys(&self, namespace: &str) -> ControlResult<Vec<PreAuthKey>> {
        let namespace = self.namespace(namespace)?;
        self.store.list_keys(namespace.id)
    }

    /// Look up the namespace a key enrolls into, without consuming it.
    pub fn namespace_of(&self, token: &str) -> ControlResult<Namespace> {
        let key = self
            .store
            .find_key(token)?
            .ok_or_else(ControlError::key_not_found)?;
        self.store
            .get_namespace(key.namespace_id)?
            .ok_or_else(|| ControlError::namespace_not_found(key.namespace_id.to_string()))
    }

    /// Expire a key immediately. Expiring an expired key is a no-op.
    pub fn expire_key(&self, token: &str) -> ControlResult<PreAuthKey> {
        let mut key = self
            .store
            .find_key(token)?
            .ok_or_else(ControlError::key_not_found)?;
        let now = Utc::now();
        if !key.is_expired(now) {
            key.expiration = Some(now);
            self.store.update_key(&key)?;
            info!(key_id = key.id, "Expired pre-auth key");
        }
        Ok(key)
    }
}

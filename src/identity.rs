// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Curve25519 key material.
//!
//! - [`NodeKey`]: a node's long-term public key, 64 lowercase hex characters
//!   on the wire.
//! - [`ServerIdentity`]: the control server's own key pair, loaded from (or
//!   generated into) `PRIVATE_KEY_PATH`.
//! - [`MachineKey`]: symmetric key shared by one node and the server, used to
//!   seal machine requests. Only the holder of the node's private key can
//!   produce a body the server will open.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

/// Size in bytes of a Curve25519 key.
pub const KEY_SIZE: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("key must be {expected} hex characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("key is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("key file error: {0}")]
    Io(#[from] io::Error),

    #[error("system random source failed")]
    Random,

    #[error("key agreement with a low-order point")]
    WeakKey,

    #[error("message could not be sealed")]
    Sealing,

    #[error("message is not sealed with the expected key")]
    Unsealed,
}

// =============================================================================
// NodeKey
// =============================================================================

/// Long-term public key of a node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeKey([u8; KEY_SIZE]);

impl NodeKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl FromStr for NodeKey {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_key_hex(s).map(Self)
    }
}

impl TryFrom<String> for NodeKey {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeKey> for String {
    fn from(value: NodeKey) -> Self {
        value.to_hex()
    }
}

impl From<PublicKey> for NodeKey {
    fn from(value: PublicKey) -> Self {
        Self(value.to_bytes())
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey({})", self.short())
    }
}

fn parse_key_hex(s: &str) -> Result<[u8; KEY_SIZE], IdentityError> {
    let s = s.trim();
    if s.len() != KEY_SIZE * 2 {
        return Err(IdentityError::InvalidLength {
            expected: KEY_SIZE * 2,
            actual: s.len(),
        });
    }
    let mut bytes = [0u8; KEY_SIZE];
    hex::decode_to_slice(s, &mut bytes)?;
    Ok(bytes)
}

// =============================================================================
// ServerIdentity
// =============================================================================

/// The control server's static key pair.
pub struct ServerIdentity {
    secret: StaticSecret,
    public: PublicKey,
}

impl ServerIdentity {
    pub fn from_secret_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Generate a fresh key pair from the OS random source.
    pub fn generate() -> Result<Self, IdentityError> {
        let mut bytes = [0u8; KEY_SIZE];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| IdentityError::Random)?;
        Ok(Self::from_secret_bytes(bytes))
    }

    /// Load the private key from `path`, generating and persisting one when
    /// the file does not exist yet.
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Self::from_secret_bytes(parse_key_hex(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let identity = Self::generate()?;
                identity.write_private_key(path)?;
                tracing::info!(path = %path.display(), "Generated new server private key");
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_private_key(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(hex::encode(self.secret.to_bytes()).as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    pub fn public_key(&self) -> NodeKey {
        NodeKey::from(self.public)
    }

    /// The key `node` seals its machine requests with.
    pub fn machine_key(&self, node: &NodeKey) -> Result<MachineKey, IdentityError> {
        MachineKey::agree(&self.secret, node)
    }
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print private key material
        f.debug_struct("ServerIdentity")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// MachineKey
// =============================================================================

const MACHINE_KEY_INFO: &[u8] = b"meshgate machine key v1";

/// ChaCha20-Poly1305 key derived with HKDF-SHA256 from the x25519 agreement
/// between a node and the server.
///
/// Sealed messages are `nonce || ciphertext || tag`. The caller's context
/// (the route) is bound as associated data, so a body sealed for one
/// endpoint does not open at another.
pub struct MachineKey(LessSafeKey);

impl MachineKey {
    /// Agree on a key between `secret` and the peer's public key. Both sides
    /// arrive at the same key.
    pub fn agree(secret: &StaticSecret, peer: &NodeKey) -> Result<Self, IdentityError> {
        let shared = secret.diffie_hellman(&PublicKey::from(*peer.as_bytes()));
        if !shared.was_contributory() {
            return Err(IdentityError::WeakKey);
        }
        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]).extract(shared.as_bytes());
        let okm = prk
            .expand(&[MACHINE_KEY_INFO], &aead::CHACHA20_POLY1305)
            .map_err(|_| IdentityError::Sealing)?;
        Ok(Self(LessSafeKey::new(UnboundKey::from(okm))))
    }

    pub fn seal(
        &self,
        rng: &dyn SecureRandom,
        context: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, IdentityError> {
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill(&mut nonce).map_err(|_| IdentityError::Random)?;

        let mut in_out = plaintext.to_vec();
        self.0
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(context),
                &mut in_out,
            )
            .map_err(|_| IdentityError::Sealing)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&in_out);
        Ok(sealed)
    }

    pub fn open(&self, context: &[u8], sealed: &[u8]) -> Result<Vec<u8>, IdentityError> {
        if sealed.len() < NONCE_LEN + self.0.algorithm().tag_len() {
            return Err(IdentityError::Unsealed);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce =
            Nonce::try_assume_unique_for_key(nonce).map_err(|_| IdentityError::Unsealed)?;

        let mut in_out = ciphertext.to_vec();
        let len = self
            .0
            .open_in_place(nonce, Aad::from(context), &mut in_out)
            .map_err(|_| IdentityError::Unsealed)?
            .len();
        in_out.truncate(len);
        Ok(in_out)
    }
}

impl fmt::Debug for MachineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MachineKey(..)")
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Control Plane Core
//!
//! Leaves first:
//!
//! - [`keys`]: pre-auth key issuance and atomic consumption
//! - [`sessions`]: registry of nodes holding a poll connection
//! - [`registration`]: node lifecycle `Pending -> Authorized -> Active`
//! - [`netmap`]: per-node network map computation and fan-out
//!
//! Every component receives its collaborators through `Arc` at construction;
//! nothing here is a process-wide singleton.

pub mod error;
pub mod keys;
pub mod netmap;
pub mod registration;
pub mod sessions;

pub use error::{ControlError, ControlResult};
pub use keys::KeyService;
pub use netmap::{MapCoordinator, MapResponse, PeerInfo, PeerVisibility};
pub use registration::{Enrollment, Registrar};
pub use sessions::{MapPayload, SessionHandle, SessionRegistry};

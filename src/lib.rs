// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! meshgate - Mesh VPN Control Plane
//!
//! Authenticates overlay nodes, issues pre-auth enrollment keys and pushes
//! an up-to-date network map to every node holding a poll connection.
//!
//! ## Modules
//!
//! - `control` - key service, session registry, registration state machine
//!   and map distribution
//! - `storage` - `Store` repository trait with in-memory and redb backends
//! - `api` - HTTP API handlers (Axum)
//! - `auth` - Admin bearer-key authentication
//! - `identity` - Curve25519 node and server keys

pub mod api;
pub mod auth;
pub mod config;
pub mod control;
pub mod error;
pub mod identity;
pub mod models;
pub mod state;
pub mod storage;
pub mod sweeper;
pub mod tls;

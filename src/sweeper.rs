// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Stale Session Sweeper
//!
//! Background task that demotes nodes persisted as `Active` but holding no
//! poll connection. This happens after a restart (sessions live in memory
//! only) or when a detach failed to reach the store.
//!
//! ## Strategy
//!
//! Every `interval` (default 30 s) the sweeper asks the registrar to move
//! such nodes back to `Authorized`. A node is only touched once it has not
//! been seen for a full interval, so a poll that is still attaching is left
//! alone.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken` for graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::control::Registrar;

pub struct StaleSessionSweeper {
    registrar: Arc<Registrar>,
    interval: Duration,
}

impl StaleSessionSweeper {
    pub fn new(registrar: Arc<Registrar>, interval: Duration) -> Self {
        Self { registrar, interval }
    }

    /// Run the sweep loop until the cancellation token is triggered.
    ///
    /// ```rust,ignore
    /// tokio::spawn(sweeper.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Stale session sweeper starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Stale session sweeper shutting down");
                return;
            }

            self.sweep();

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Stale session sweeper shutting down");
                    return;
                }
            }
        }
    }

    /// One pass. Returns how many nodes were demoted.
    pub fn sweep(&self) -> usize {
        let grace = chrono::Duration::from_std(self.interval)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        match self.registrar.deactivate_stale(grace) {
            Ok(demoted) => demoted,
            Err(e) => {
                warn!(error = %e, "Stale session sweep failed");
                0
            }
        }
    }
}

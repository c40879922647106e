// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use meshgate::{
    api::router,
    config::{Config, LogFormat, TlsMode, DEFAULT_LOG_FILTER},
    identity::ServerIdentity,
    state::AppState,
    storage::{MemoryStore, RedbStore, Store},
    sweeper::StaleSessionSweeper,
    tls,
};

/// How long in-flight requests get to finish after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).init(),
    }
}

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };
    init_tracing(config.log_format);

    if let Err(e) = run(config).await {
        error!(error = %e, "meshgate terminated");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    // Install the ring crypto provider for rustls (must be done before any TLS operations)
    tls::install_crypto_provider();

    if let Some(warning) = config.scheme_warning() {
        warn!("{warning}");
    }

    let identity = ServerIdentity::load_or_generate(&config.private_key_path)?;
    info!(server_key = %identity.public_key().short(), "Loaded server identity");

    let store: Arc<dyn Store> = match &config.database_path {
        Some(path) => {
            info!(path = %path.display(), "Opening redb store");
            Arc::new(RedbStore::open(path)?)
        }
        None => {
            warn!("DATABASE_PATH not set, state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let addr = config.bind_addr;
    let tls_mode = config.tls.clone();
    let sweep_interval = config.stale_sweep_interval;

    let state = AppState::new(config, identity, store);
    let shutdown = state.shutdown.clone();

    let sweeper = StaleSessionSweeper::new(state.registrar.clone(), sweep_interval);
    tokio::spawn(sweeper.run(shutdown.clone()));

    let app = router(state);

    let handle = Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                return;
            }
            info!("Shutdown requested");
            // Ends poll streams so the graceful drain can complete.
            shutdown.cancel();
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        }
    });

    match tls_mode {
        TlsMode::Manual {
            cert_path,
            key_path,
        } => {
            let tls_config = tls::load_rustls_config(&cert_path, &key_path).await?;
            info!(%addr, "meshgate listening on https (docs at /docs)");
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        TlsMode::Disabled => {
            info!(%addr, "meshgate listening on http (docs at /docs)");
            axum_server::bind(addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
    }

    shutdown.cancel();
    info!("meshgate stopped");
    Ok(())
}

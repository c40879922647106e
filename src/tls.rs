// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Static-certificate TLS for the listener.
//!
//! The rustls `ring` provider must be installed before any of this runs.

use std::path::Path;

use axum_server::tls_rustls::RustlsConfig;

/// Install the ring crypto provider as the process default.
///
/// Installing twice is harmless.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Build the server TLS configuration from PEM files.
pub async fn load_rustls_config(cert_path: &Path, key_path: &Path) -> std::io::Result<RustlsConfig> {
    let config = RustlsConfig::from_pem_file(cert_path, key_path).await?;
    tracing::info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        "Loaded TLS certificate"
    );
    Ok(config)
}

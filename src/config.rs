// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Configuration is loaded from the environment at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SERVER_URL` | Public base URL announced to nodes | `http://127.0.0.1:8080` |
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `PRIVATE_KEY_PATH` | Server x25519 private key (hex), created if missing | `private.key` |
//! | `DATABASE_PATH` | redb database file | unset (in-memory store) |
//! | `DERP_MAP_PATH` | Relay map JSON, passed to nodes verbatim | unset (empty map) |
//! | `TLS_CERT_PATH` | PEM certificate chain | unset (plain HTTP) |
//! | `TLS_KEY_PATH` | PEM private key | unset (plain HTTP) |
//! | `ADMIN_API_KEY` | Bearer token for `/admin` routes | unset (admin disabled) |
//! | `PEER_VISIBILITY` | `authorized` or `active` | `authorized` |
//! | `SESSION_BUFFER` | Queued map updates per polling node | `16` |
//! | `KEEPALIVE_INTERVAL_SECS` | Keepalive period on poll streams | `60` |
//! | `STALE_SWEEP_INTERVAL_SECS` | Period of the stale session sweep | `30` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::control::sessions::DEFAULT_SESSION_BUFFER;
use crate::control::PeerVisibility;

pub const SERVER_URL_ENV: &str = "SERVER_URL";
pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
pub const PRIVATE_KEY_PATH_ENV: &str = "PRIVATE_KEY_PATH";

/// Path of the redb database. Without it all state lives in memory and is
/// lost on restart.
pub const DATABASE_PATH_ENV: &str = "DATABASE_PATH";
pub const DERP_MAP_PATH_ENV: &str = "DERP_MAP_PATH";
pub const TLS_CERT_PATH_ENV: &str = "TLS_CERT_PATH";
pub const TLS_KEY_PATH_ENV: &str = "TLS_KEY_PATH";

/// Bearer token required by every `/admin` route.
///
/// When unset, admin routes answer 401 to everyone.
pub const ADMIN_API_KEY_ENV: &str = "ADMIN_API_KEY";
pub const PEER_VISIBILITY_ENV: &str = "PEER_VISIBILITY";
pub const SESSION_BUFFER_ENV: &str = "SESSION_BUFFER";
pub const KEEPALIVE_INTERVAL_ENV: &str = "KEEPALIVE_INTERVAL_SECS";
pub const STALE_SWEEP_INTERVAL_ENV: &str = "STALE_SWEEP_INTERVAL_SECS";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_PRIVATE_KEY_PATH: &str = "private.key";
pub const DEFAULT_KEEPALIVE_SECS: u64 = 60;
pub const DEFAULT_STALE_SWEEP_SECS: u64 = 30;

/// Default `RUST_LOG` filter.
pub const DEFAULT_LOG_FILTER: &str = "info,tower_http=debug";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("DERP map is not valid JSON: {0}")]
    DerpMap(#[from] serde_json::Error),
}

fn invalid(var: &'static str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        var,
        reason: reason.to_string(),
    }
}

/// How the listener terminates connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    Disabled,
    /// Static certificate files, loaded once at startup.
    Manual { cert_path: PathBuf, key_path: PathBuf },
}

impl TlsMode {
    pub fn is_enabled(&self) -> bool {
        matches!(self, TlsMode::Manual { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_url: Url,
    pub bind_addr: SocketAddr,
    pub private_key_path: PathBuf,
    pub database_path: Option<PathBuf>,
    /// Opaque relay configuration.
    pub derp_map: serde_json::Value,
    pub tls: TlsMode,
    pub admin_api_key: Option<String>,
    pub peer_visibility: PeerVisibility,
    pub session_buffer: usize,
    pub keepalive_interval: Duration,
    pub stale_sweep_interval: Duration,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: Url::parse(DEFAULT_SERVER_URL).expect("default server URL is valid"),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            private_key_path: PathBuf::from(DEFAULT_PRIVATE_KEY_PATH),
            database_path: None,
            derp_map: empty_derp_map(),
            tls: TlsMode::Disabled,
            admin_api_key: None,
            peer_visibility: PeerVisibility::default(),
            session_buffer: DEFAULT_SESSION_BUFFER,
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            stale_sweep_interval: Duration::from_secs(DEFAULT_STALE_SWEEP_SECS),
            log_format: LogFormat::default(),
        }
    }
}

fn empty_derp_map() -> serde_json::Value {
    serde_json::json!({ "regions": {} })
}

fn parse_secs(var: &'static str, raw: Option<String>, default: u64) -> Result<Duration, ConfigError> {
    let secs = match raw {
        Some(raw) => raw.parse::<u64>().map_err(|e| invalid(var, e))?,
        None => default,
    };
    if secs == 0 {
        return Err(invalid(var, "must be greater than zero"));
    }
    Ok(Duration::from_secs(secs))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let server_url = lookup(SERVER_URL_ENV).unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        let server_url = Url::parse(&server_url).map_err(|e| invalid(SERVER_URL_ENV, e))?;

        let host = lookup(HOST_ENV).unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match lookup(PORT_ENV) {
            Some(raw) => raw.parse::<u16>().map_err(|e| invalid(PORT_ENV, e))?,
            None => DEFAULT_PORT,
        };
        let bind_addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| invalid(HOST_ENV, e))?;

        let derp_map = match lookup(DERP_MAP_PATH_ENV).map(PathBuf::from) {
            Some(path) => {
                let raw = std::fs::read(&path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                serde_json::from_slice(&raw)?
            }
            None => empty_derp_map(),
        };

        let tls = match (lookup(TLS_CERT_PATH_ENV), lookup(TLS_KEY_PATH_ENV)) {
            (Some(cert), Some(key)) => TlsMode::Manual {
                cert_path: cert.into(),
                key_path: key.into(),
            },
            (None, None) => TlsMode::Disabled,
            _ => {
                return Err(invalid(
                    TLS_CERT_PATH_ENV,
                    "TLS_CERT_PATH and TLS_KEY_PATH must be set together",
                ))
            }
        };

        let peer_visibility = match lookup(PEER_VISIBILITY_ENV) {
            Some(raw) => raw.parse().map_err(|e| invalid(PEER_VISIBILITY_ENV, e))?,
            None => PeerVisibility::default(),
        };

        let session_buffer = match lookup(SESSION_BUFFER_ENV) {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| invalid(SESSION_BUFFER_ENV, "must be a positive integer"))?,
            None => DEFAULT_SESSION_BUFFER,
        };

        let log_format = match lookup(LOG_FORMAT_ENV).as_deref() {
            Some("json") => LogFormat::Json,
            Some("pretty") | None => LogFormat::Pretty,
            Some(other) => return Err(invalid(LOG_FORMAT_ENV, format!("unknown format {other:?}"))),
        };

        Ok(Self {
            server_url,
            bind_addr,
            private_key_path: lookup(PRIVATE_KEY_PATH_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PRIVATE_KEY_PATH)),
            database_path: lookup(DATABASE_PATH_ENV).map(PathBuf::from),
            derp_map,
            tls,
            admin_api_key: lookup(ADMIN_API_KEY_ENV),
            peer_visibility,
            session_buffer,
            keepalive_interval: parse_secs(
                KEEPALIVE_INTERVAL_ENV,
                lookup(KEEPALIVE_INTERVAL_ENV),
                DEFAULT_KEEPALIVE_SECS,
            )?,
            stale_sweep_interval: parse_secs(
                STALE_SWEEP_INTERVAL_ENV,
                lookup(STALE_SWEEP_INTERVAL_ENV),
                DEFAULT_STALE_SWEEP_SECS,
            )?,
            log_format,
        })
    }

    /// Warning to log when `SERVER_URL` disagrees with the listener's TLS mode.
    pub fn scheme_warning(&self) -> Option<String> {
        match (self.tls.is_enabled(), self.server_url.scheme()) {
            (true, "https") | (false, "http") => None,
            (true, scheme) => Some(format!(
                "listening with TLS but SERVER_URL uses {scheme}://"
            )),
            (false, scheme) => Some(format!(
                "listening without TLS but SERVER_URL uses {scheme}://"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.tls, TlsMode::Disabled);
        assert_eq!(config.peer_visibility, PeerVisibility::Authorized);
        assert_eq!(config.session_buffer, DEFAULT_SESSION_BUFFER);
        assert_eq!(config.keepalive_interval, Duration::from_secs(60));
        assert!(config.database_path.is_none());
        assert!(config.admin_api_key.is_none());
        assert!(config.scheme_warning().is_none());
    }

    #[test]
    fn reads_every_variable() {
        let mut derp = tempfile::NamedTempFile::new().unwrap();
        write!(derp, r#"{{"regions":{{"1":{{"region_code":"fra"}}}}}}"#).unwrap();
        let derp_path = derp.path().to_str().unwrap().to_string();

        let config = Config::from_lookup(lookup_from(&[
            (SERVER_URL_ENV, "https://mesh.example.com"),
            (HOST_ENV, "127.0.0.1"),
            (PORT_ENV, "8443"),
            (DATABASE_PATH_ENV, "/var/lib/meshgate/db.redb"),
            (DERP_MAP_PATH_ENV, &derp_path),
            (TLS_CERT_PATH_ENV, "/etc/meshgate/cert.pem"),
            (TLS_KEY_PATH_ENV, "/etc/meshgate/key.pem"),
            (ADMIN_API_KEY_ENV, "s3cret"),
            (PEER_VISIBILITY_ENV, "active"),
            (SESSION_BUFFER_ENV, "4"),
            (KEEPALIVE_INTERVAL_ENV, "15"),
            (LOG_FORMAT_ENV, "json"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:8443".parse().unwrap());
        assert!(config.tls.is_enabled());
        assert_eq!(config.derp_map["regions"]["1"]["region_code"], "fra");
        assert_eq!(config.admin_api_key.as_deref(), Some("s3cret"));
        assert_eq!(config.peer_visibility, PeerVisibility::Active);
        assert_eq!(config.session_buffer, 4);
        assert_eq!(config.keepalive_interval, Duration::from_secs(15));
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.scheme_warning().is_none());
    }

    #[test]
    fn half_configured_tls_is_rejected() {
        let result = Config::from_lookup(lookup_from(&[(TLS_CERT_PATH_ENV, "/cert.pem")]));
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn malformed_values_are_rejected() {
        for (var, value) in [
            (PORT_ENV, "eighty"),
            (SERVER_URL_ENV, "not a url"),
            (PEER_VISIBILITY_ENV, "everyone"),
            (SESSION_BUFFER_ENV, "0"),
            (KEEPALIVE_INTERVAL_ENV, "0"),
            (LOG_FORMAT_ENV, "xml"),
        ] {
            let result = Config::from_lookup(lookup_from(&[(var, value)]));
            assert!(result.is_err(), "{var}={value} should be rejected");
        }
    }

    #[test]
    fn missing_derp_map_file_is_an_io_error() {
        let result = Config::from_lookup(lookup_from(&[(
            DERP_MAP_PATH_ENV,
            "/nonexistent/derp.json",
        )]));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn scheme_mismatch_is_reported() {
        let config = Config::from_lookup(lookup_from(&[(SERVER_URL_ENV, "https://mesh.example.com")]))
            .unwrap();
        assert!(config.scheme_warning().unwrap().contains("without TLS"));
    }
}

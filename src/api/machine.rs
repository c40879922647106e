// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Endpoints used by mesh nodes.
//!
//! A node is identified by its Curve25519 public key in the path and proves
//! it holds the matching private key by sealing the request body with the
//! [`MachineKey`](crate::identity::MachineKey) it shares with the server.
//! A body that does not open under the path key is refused before anything
//! is looked up or changed. Beyond that, what a node may do is decided by
//! its registration state.
//!
//! The poll endpoint answers with newline-delimited JSON: one
//! [`MapResponse`] per line, interleaved with `{"keep_alive":true}` lines.
//! The stream ends when the node reconnects elsewhere, is revoked, or the
//! server shuts down.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::header,
    response::{Html, IntoResponse, Response},
    Json,
};
use serde::{de::DeserializeOwned, Deserialize};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use utoipa::IntoParams;

use crate::{
    control::{ControlError, Enrollment, MapPayload, MapResponse, Registrar, SessionHandle},
    error::ApiError,
    identity::NodeKey,
    models::{is_valid_name, PollRequest, RegisterRequest, RegisterResponse, ServerKeyResponse},
    state::AppState,
    storage::{Node, NodeState},
};

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Associated data of a sealed registration request.
pub const REGISTER_CONTEXT: &[u8] = b"meshgate/register";

/// Associated data of a sealed poll request.
pub const POLL_CONTEXT: &[u8] = b"meshgate/map";

fn parse_node_key(raw: &str) -> Result<NodeKey, ApiError> {
    raw.parse::<NodeKey>()
        .map_err(|e| ApiError::bad_request(format!("invalid node key: {e}")))
}

/// Open a request body sealed by `public_key` and decode it.
fn open_request<T: DeserializeOwned>(
    state: &AppState,
    public_key: &NodeKey,
    context: &[u8],
    body: &[u8],
) -> Result<T, ApiError> {
    let plaintext = state
        .identity
        .machine_key(public_key)
        .and_then(|key| key.open(context, body))
        .map_err(|e| {
            warn!(node_key = %public_key.short(), error = %e, "Rejected unsealed machine request");
            ControlError::NotAuthorized("request is not sealed with the node key".into())
        })?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| ApiError::bad_request(format!("invalid request body: {e}")))
}

fn namespace_name(state: &AppState, node: &Node) -> Result<String, ApiError> {
    let namespace = state
        .store
        .get_namespace(node.namespace_id)?
        .ok_or_else(|| ControlError::namespace_not_found(node.namespace_id.to_string()))?;
    Ok(namespace.name)
}

/// The server's public key.
#[utoipa::path(
    get,
    path = "/key",
    tag = "Machine",
    responses(
        (status = 200, description = "Server public key", body = ServerKeyResponse)
    )
)]
pub async fn server_key(State(state): State<AppState>) -> Json<ServerKeyResponse> {
    Json(ServerKeyResponse {
        public_key: state.identity.public_key().to_hex(),
    })
}

/// Register a node, optionally authorizing it with a pre-auth key.
///
/// Repeating the request is safe: the node's current state is returned.
#[utoipa::path(
    post,
    path = "/machine/{node_key}",
    tag = "Machine",
    params(("node_key" = String, Path, description = "Hex-encoded node public key")),
    request_body(
        content = RegisterRequest,
        content_type = "application/octet-stream",
        description = "RegisterRequest JSON sealed with the machine key"
    ),
    responses(
        (status = 200, description = "Current registration state", body = RegisterResponse),
        (status = 400, description = "Malformed key or request"),
        (status = 403, description = "Request not sealed by the node, or node revoked or expired"),
        (status = 404, description = "Namespace or pre-auth key not found"),
        (status = 409, description = "Pre-auth key already used"),
        (status = 410, description = "Pre-auth key expired")
    )
)]
pub async fn register_machine(
    State(state): State<AppState>,
    Path(node_key): Path<String>,
    body: Bytes,
) -> Result<Json<RegisterResponse>, ApiError> {
    let public_key = parse_node_key(&node_key)?;
    let request: RegisterRequest = open_request(&state, &public_key, REGISTER_CONTEXT, &body)?;
    let name = request
        .hostname
        .unwrap_or_else(|| format!("node-{}", public_key.short()));
    if !is_valid_name(&name) {
        return Err(ApiError::bad_request(
            "hostname uses lowercase letters, digits and '-' (at most 63)",
        ));
    }

    let node = state.registrar.register(Enrollment {
        public_key,
        name,
        namespace: request.namespace,
        auth_key: request.auth_key,
    })?;

    Ok(Json(RegisterResponse {
        node_id: node.id,
        namespace: namespace_name(&state, &node)?,
        authorized: node.state.is_authorized(),
        state: node.state,
        server_key: state.identity.public_key().to_hex(),
    }))
}

/// Detaches the session when the response body is dropped.
struct SessionGuard {
    registrar: Arc<Registrar>,
    handle: SessionHandle,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.registrar.detach_session(&self.handle) {
            warn!(node_id = self.handle.node_id, error = %e, "Failed to detach poll session");
        }
    }
}

struct PollStream {
    receiver: mpsc::Receiver<MapPayload>,
    keepalive: Interval,
    keepalive_payload: MapPayload,
    shutdown: CancellationToken,
    guard: SessionGuard,
}

enum PollEvent {
    Update(MapPayload),
    KeepAlive,
    Closed,
}

impl PollStream {
    async fn next_payload(&mut self) -> Option<MapPayload> {
        let event = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => PollEvent::Closed,
            payload = self.receiver.recv() => payload.map_or(PollEvent::Closed, PollEvent::Update),
            _ = self.keepalive.tick() => PollEvent::KeepAlive,
        };

        match event {
            PollEvent::Update(payload) => Some(payload),
            PollEvent::KeepAlive => Some(self.keepalive_payload.clone()),
            PollEvent::Closed => {
                debug!(node_id = self.guard.handle.node_id, "Poll stream closed");
                None
            }
        }
    }
}

/// Stream network maps to a node.
///
/// Pending, revoked and unknown nodes are rejected before any streaming
/// starts. With `"stream": false` a single map is returned.
#[utoipa::path(
    post,
    path = "/machine/{node_key}/map",
    tag = "Machine",
    params(("node_key" = String, Path, description = "Hex-encoded node public key")),
    request_body(
        content = PollRequest,
        content_type = "application/octet-stream",
        description = "PollRequest JSON sealed with the machine key"
    ),
    responses(
        (status = 200, description = "NDJSON stream of network maps", body = MapResponse, content_type = "application/x-ndjson"),
        (status = 400, description = "Malformed key or endpoints"),
        (status = 403, description = "Request not sealed by the node, or node not authorized"),
        (status = 404, description = "Node not registered")
    )
)]
pub async fn poll_map(
    State(state): State<AppState>,
    Path(node_key): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let public_key = parse_node_key(&node_key)?;
    let request: PollRequest = open_request(&state, &public_key, POLL_CONTEXT, &body)?;
    let node = state.registrar.find_by_key(&public_key)?;
    if !node.state.is_authorized() {
        return Err(ControlError::NotAuthorized(format!("node {} is {}", node.id, node.state)).into());
    }

    if !request.endpoints.is_empty() {
        state
            .registrar
            .update_endpoints(node.id, request.endpoints)?;
    }

    if !request.stream {
        return Ok(Json(state.netmap.compute_map(node.id)?).into_response());
    }

    let (handle, receiver) = state.registrar.attach_session(node.id)?;
    let period = state.config.keepalive_interval;
    let mut keepalive = time::interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let poll = PollStream {
        receiver,
        keepalive,
        keepalive_payload: state.netmap.keepalive_payload(),
        shutdown: state.shutdown.clone(),
        guard: SessionGuard {
            registrar: state.registrar.clone(),
            handle,
        },
    };

    let stream = futures::stream::unfold(poll, |mut poll| async move {
        let payload = poll.next_payload().await?;
        Some((Ok::<_, Infallible>(payload), poll))
    });

    Ok((
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(stream),
    )
        .into_response())
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct RegisterPageQuery {
    /// Hex-encoded node public key
    pub key: String,
}

/// Approval instructions for a node waiting on manual authorization.
#[utoipa::path(
    get,
    path = "/register",
    tag = "Machine",
    params(RegisterPageQuery),
    responses(
        (status = 200, description = "HTML page with the approval command", content_type = "text/html"),
        (status = 400, description = "Malformed key"),
        (status = 404, description = "Node not registered")
    )
)]
pub async fn register_page(
    State(state): State<AppState>,
    Query(query): Query<RegisterPageQuery>,
) -> Result<Html<String>, ApiError> {
    let public_key = parse_node_key(&query.key)?;
    let node = state.registrar.find_by_key(&public_key)?;
    let base = state.config.server_url.as_str().trim_end_matches('/');

    let body = match node.state {
        NodeState::Pending => format!(
            "<p>Node <code>{name}</code> (id {id}) is waiting for approval.</p>\
             <p>Run:</p><pre>curl -X POST -H \"Authorization: Bearer $ADMIN_API_KEY\" \
             {base}/admin/nodes/{id}/approve</pre>",
            name = node.name,
            id = node.id,
        ),
        other => format!(
            "<p>Node <code>{name}</code> (id {id}) is {other}.</p>",
            name = node.name,
            id = node.id,
        ),
    };
    Ok(Html(format!(
        "<!DOCTYPE html><html><head><title>meshgate</title></head><body>\
         <h1>Machine registration</h1>{body}</body></html>"
    )))
}

// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Admin-only API endpoints.
//!
//! These endpoints require the admin bearer key and provide:
//! - Namespace management
//! - Pre-auth key issuance, listing and expiry
//! - Node approval, revocation and map inspection

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use tracing::info;

use crate::{
    auth::AdminOnly,
    control::{ControlError, MapResponse},
    error::ApiError,
    models::{is_valid_name, CreateNamespaceRequest, IssueKeyRequest},
    state::AppState,
    storage::{Namespace, Node, NodeId, PreAuthKey},
};

fn namespace_by_name(state: &AppState, name: &str) -> Result<Namespace, ApiError> {
    state
        .store
        .find_namespace(name)?
        .ok_or_else(|| ControlError::namespace_not_found(name).into())
}

/// List namespaces.
#[utoipa::path(
    get,
    path = "/admin/namespaces",
    tag = "Admin",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "All namespaces", body = [Namespace]),
        (status = 401, description = "Missing or invalid admin key")
    )
)]
pub async fn list_namespaces(
    _admin: AdminOnly,
    State(state): State<AppState>,
) -> Result<Json<Vec<Namespace>>, ApiError> {
    Ok(Json(state.store.list_namespaces()?))
}

/// Create a namespace.
#[utoipa::path(
    post,
    path = "/admin/namespaces",
    tag = "Admin",
    security(("bearer_auth" = [])),
    request_body = CreateNamespaceRequest,
    responses(
        (status = 201, description = "Namespace created", body = Namespace),
        (status = 400, description = "Invalid name"),
        (status = 409, description = "Namespace already exists")
    )
)]
pub async fn create_namespace(
    _admin: AdminOnly,
    State(state): State<AppState>,
    Json(request): Json<CreateNamespaceRequest>,
) -> Result<(StatusCode, Json<Namespace>), ApiError> {
    if !is_valid_name(&request.name) {
        return Err(ApiError::bad_request(
            "namespace names use lowercase letters, digits and '-' (at most 63)",
        ));
    }
    let namespace = state.store.create_namespace(&request.name, Utc::now())?;
    info!(namespace = %namespace.name, id = namespace.id, "Created namespace");
    Ok((StatusCode::CREATED, Json(namespace)))
}

/// List the pre-auth keys of a namespace, oldest first.
#[utoipa::path(
    get,
    path = "/admin/namespaces/{name}/preauthkeys",
    tag = "Admin",
    security(("bearer_auth" = [])),
    params(("name" = String, Path, description = "Namespace name")),
    responses(
        (status = 200, description = "Keys in creation order", body = [PreAuthKey]),
        (status = 404, description = "Namespace not found")
    )
)]
pub async fn list_preauth_keys(
    _admin: AdminOnly,
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<PreAuthKey>>, ApiError> {
    Ok(Json(state.keys.list_keys(&name)?))
}

/// Issue a pre-auth key.
#[utoipa::path(
    post,
    path = "/admin/namespaces/{name}/preauthkeys",
    tag = "Admin",
    security(("bearer_auth" = [])),
    params(("name" = String, Path, description = "Namespace name")),
    request_body = IssueKeyRequest,
    responses(
        (status = 201, description = "Key issued", body = PreAuthKey),
        (status = 400, description = "Expiration in the past"),
        (status = 404, description = "Namespace not found")
    )
)]
pub async fn issue_preauth_key(
    _admin: AdminOnly,
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<IssueKeyRequest>,
) -> Result<(StatusCode, Json<PreAuthKey>), ApiError> {
    let key = state
        .keys
        .issue_key(&name, request.reusable, request.expiration)?;
    Ok((StatusCode::CREATED, Json(key)))
}

/// Expire a pre-auth key immediately.
#[utoipa::path(
    post,
    path = "/admin/preauthkeys/{key}/expire",
    tag = "Admin",
    security(("bearer_auth" = [])),
    params(("key" = String, Path, description = "Key token")),
    responses(
        (status = 200, description = "Key expired", body = PreAuthKey),
        (status = 404, description = "Key not found")
    )
)]
pub async fn expire_preauth_key(
    _admin: AdminOnly,
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<PreAuthKey>, ApiError> {
    Ok(Json(state.keys.expire_key(&key)?))
}

/// List the nodes of a namespace.
#[utoipa::path(
    get,
    path = "/admin/namespaces/{name}/nodes",
    tag = "Admin",
    security(("bearer_auth" = [])),
    params(("name" = String, Path, description = "Namespace name")),
    responses(
        (status = 200, description = "Nodes ordered by id", body = [Node]),
        (status = 404, description = "Namespace not found")
    )
)]
pub async fn list_nodes(
    _admin: AdminOnly,
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<Node>>, ApiError> {
    let namespace = namespace_by_name(&state, &name)?;
    Ok(Json(state.store.list_nodes(namespace.id)?))
}

/// Approve a pending node.
#[utoipa::path(
    post,
    path = "/admin/nodes/{id}/approve",
    tag = "Admin",
    security(("bearer_auth" = [])),
    params(("id" = u64, Path, description = "Node id")),
    responses(
        (status = 200, description = "Node authorized", body = Node),
        (status = 403, description = "Node is revoked or expired"),
        (status = 404, description = "Node not found")
    )
)]
pub async fn approve_node(
    _admin: AdminOnly,
    State(state): State<AppState>,
    Path(id): Path<NodeId>,
) -> Result<Json<Node>, ApiError> {
    Ok(Json(state.registrar.authorize_manually(id)?))
}

/// Revoke a node and close its poll connection.
#[utoipa::path(
    post,
    path = "/admin/nodes/{id}/revoke",
    tag = "Admin",
    security(("bearer_auth" = [])),
    params(("id" = u64, Path, description = "Node id")),
    responses(
        (status = 200, description = "Node revoked", body = Node),
        (status = 403, description = "Node already retired"),
        (status = 404, description = "Node not found")
    )
)]
pub async fn revoke_node(
    _admin: AdminOnly,
    State(state): State<AppState>,
    Path(id): Path<NodeId>,
) -> Result<Json<Node>, ApiError> {
    Ok(Json(state.registrar.revoke(id)?))
}

/// Mark a node's credentials as expired and close its poll connection.
#[utoipa::path(
    post,
    path = "/admin/nodes/{id}/expire",
    tag = "Admin",
    security(("bearer_auth" = [])),
    params(("id" = u64, Path, description = "Node id")),
    responses(
        (status = 200, description = "Node expired", body = Node),
        (status = 403, description = "Node already retired"),
        (status = 404, description = "Node not found")
    )
)]
pub async fn expire_node(
    _admin: AdminOnly,
    State(state): State<AppState>,
    Path(id): Path<NodeId>,
) -> Result<Json<Node>, ApiError> {
    Ok(Json(state.registrar.expire(id)?))
}

/// The network map a node would receive right now.
#[utoipa::path(
    get,
    path = "/admin/nodes/{id}/map",
    tag = "Admin",
    security(("bearer_auth" = [])),
    params(("id" = u64, Path, description = "Node id")),
    responses(
        (status = 200, description = "Computed map", body = MapResponse),
        (status = 404, description = "Node not found")
    )
)]
pub async fn get_node_map(
    _admin: AdminOnly,
    State(state): State<AppState>,
    Path(id): Path<NodeId>,
) -> Result<Json<MapResponse>, ApiError> {
    Ok(Json(state.netmap.compute_map(id)?))
}

// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::HeaderName,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    control::{MapResponse, PeerInfo},
    models::{
        CreateNamespaceRequest, IssueKeyRequest, PollRequest, RegisterRequest, RegisterResponse,
        ServerKeyResponse,
    },
    state::AppState,
    storage::{Namespace, Node, NodeState, PreAuthKey},
};

pub mod admin;
pub mod health;
pub mod machine;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn router(state: AppState) -> Router {
    let machine_routes = Router::new()
        .route("/key", get(machine::server_key))
        .route("/register", get(machine::register_page))
        .route("/machine/{node_key}", post(machine::register_machine))
        .route("/machine/{node_key}/map", post(machine::poll_map));

    let admin_routes = Router::new()
        .route(
            "/namespaces",
            get(admin::list_namespaces).post(admin::create_namespace),
        )
        .route(
            "/namespaces/{name}/preauthkeys",
            get(admin::list_preauth_keys).post(admin::issue_preauth_key),
        )
        .route("/namespaces/{name}/nodes", get(admin::list_nodes))
        .route(
            "/preauthkeys/{key}/expire",
            post(admin::expire_preauth_key),
        )
        .route("/nodes/{id}/approve", post(admin::approve_node))
        .route("/nodes/{id}/revoke", post(admin::revoke_node))
        .route("/nodes/{id}/expire", post(admin::expire_node))
        .route("/nodes/{id}/map", get(admin::get_node_map));

    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    Router::new()
        .merge(machine_routes)
        .nest("/admin", admin_routes)
        .route("/health", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
        .layer(CorsLayer::permissive())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        machine::server_key,
        machine::register_machine,
        machine::poll_map,
        machine::register_page,
        admin::list_namespaces,
        admin::create_namespace,
        admin::list_preauth_keys,
        admin::issue_preauth_key,
        admin::expire_preauth_key,
        admin::list_nodes,
        admin::approve_node,
        admin::revoke_node,
        admin::expire_node,
        admin::get_node_map,
        health::liveness,
        health::readiness
    ),
    components(
        schemas(
            Namespace,
            PreAuthKey,
            Node,
            NodeState,
            PeerInfo,
            MapResponse,
            ServerKeyResponse,
            RegisterRequest,
            RegisterResponse,
            PollRequest,
            CreateNamespaceRequest,
            IssueKeyRequest,
            health::HealthResponse,
            health::ReadyResponse,
            health::HealthChecks
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Machine", description = "Node registration and network map polling"),
        (name = "Admin", description = "Namespace, pre-auth key and node administration"),
        (name = "Health", description = "Liveness and readiness probes")
    )
)]
struct ApiDoc;

//! Client-facing HTTP surface: the WebSocket upgrade endpoints the Proxy Engine (§4.3) and
//! the Stream Proxy (§4.6) hang off of, the HTTP Passthrough reverse-proxy route, and
//! liveness/readiness.
//!
//! Route shapes follow the teacher's `api::jmux` upgrade handler and `api::health` endpoint.

use crate::audit::AuditSink;
use crate::config::Conf;
use crate::dialer::{DialOptions, Dialer};
use crate::http_passthrough;
use crate::proxy::{self, SessionDeps};
use crate::services::{ControllerDirectory, LoginService, TokenGenerator};
use crate::stream_proxy;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use std::sync::Arc;

/// Collaborators shared across every connection handled by this router.
#[derive(Clone)]
pub struct AppState {
    pub conf: Arc<Conf>,
    pub login_service: Arc<dyn LoginService>,
    pub token_generator: Arc<dyn TokenGenerator>,
    pub controller_directory: Arc<dyn ControllerDirectory>,
    pub audit_sink: Arc<dyn AuditSink>,
}

/// Build the router served behind the TLS-terminating listener.
pub fn make_router(state: AppState) -> Router {
    Router::new()
        .route("/api", get(api_handler))
        .route("/model/{model_uuid}/api", get(model_api_handler))
        .route("/model/{model_uuid}/log", get(stream_handler))
        .route("/model/{model_uuid}/{*rest}", any(passthrough_handler))
        .route("/liveness", get(liveness))
        .route("/readiness", get(readiness))
        .with_state(state)
}

async fn api_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    upgrade_session(state, ws, None)
}

async fn model_api_handler(State(state): State<AppState>, Path(model_uuid): Path<String>, ws: WebSocketUpgrade) -> Response {
    upgrade_session(state, ws, Some(model_uuid))
}

fn upgrade_session(state: AppState, ws: WebSocketUpgrade, model_tag: Option<String>) -> Response {
    ws.on_upgrade(move |socket| async move {
        let deps = SessionDeps {
            login_service: state.login_service,
            token_generator: state.token_generator,
            controller_directory: state.controller_directory,
            audit_sink: state.audit_sink,
            model_tag,
        };
        proxy::run_session(socket, deps).await;
    })
}

async fn stream_handler(State(state): State<AppState>, Path(model_uuid): Path<String>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |client_socket| async move {
        let resolved = match state.controller_directory.resolve(Some(&model_uuid)).await {
            Ok(resolved) => resolved,
            Err(error) => {
                warn!(%error, "stream proxy: failed to resolve controller");
                return;
            }
        };

        let options = DialOptions {
            model_tag: Some(resolved.controller_uuid),
            final_segment: Some("log".to_owned()),
            ..Default::default()
        };

        match Dialer::dial(&resolved.record, &options).await {
            Ok(controller_socket) => stream_proxy::relay(client_socket, controller_socket).await,
            Err(error) => warn!(%error, "stream proxy: failed to dial controller"),
        }
    })
}

async fn passthrough_handler(
    State(state): State<AppState>,
    Path((model_uuid, rest)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: axum::body::Body,
) -> Response {
    let resolved = match state.controller_directory.resolve(Some(&model_uuid)).await {
        Ok(resolved) => resolved,
        Err(error) => return (StatusCode::BAD_GATEWAY, error.to_string()).into_response(),
    };

    let path_and_query = match query {
        Some(query) => format!("/model/{model_uuid}/{rest}?{query}"),
        None => format!("/model/{model_uuid}/{rest}"),
    };

    http_passthrough::forward(&resolved.record, method, &path_and_query, headers, body).await
}

async fn liveness() -> StatusCode {
    StatusCode::OK
}

async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.conf.controllers.is_empty() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

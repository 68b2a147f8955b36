//! HTTP entrypoint serving one unit over both wire protocols.
//!
//! A pipeline image runs this inside its container: it rebuilds the
//! pipeline, adopts the child endpoints from [`ENDPOINTS_ENV`] into a
//! runtime bound to the children, and calls [`serve`] with the pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::client::Endpoint;
use crate::error::{ComposeError, DeploymentError};
use crate::executor::InferenceHandler;
use crate::protocol::Protocol;

pub use crate::runtime::container::ENDPOINTS_ENV;

type SharedHandler = Arc<dyn InferenceHandler>;

/// Routes for both protocols plus `/health/ping`.
pub fn router(handler: SharedHandler) -> Router {
    Router::new()
        .route("/api/v1.0/predictions", post(seldon_predict))
        .route("/health/status", get(seldon_status))
        .route("/health/ping", get(|| async { "pong" }))
        .route("/v2/health/live", get(|| async { StatusCode::OK }))
        .route("/v2/health/ready", get(v2_server_ready))
        .route("/v2/models/:name/ready", get(v2_model_ready))
        .route("/v2/models/:name/infer", post(v2_infer))
        .with_state(handler)
}

/// Serve `handler` on `listener` until the task is dropped.
pub async fn serve(handler: SharedHandler, listener: TcpListener) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(unit = %handler.name(), %addr, "serve: listening");
    axum::serve(listener, router(handler)).await
}

/// Decode a request body, run the handler and encode its response.
///
/// `model_name`, when given, must match the handler's name (404 otherwise).
/// Malformed payloads are 400; handler failures are 500 with an
/// `{"error": ..}` body.
pub async fn handle_predict(
    handler: &dyn InferenceHandler,
    protocol: Protocol,
    model_name: Option<&str>,
    body: &[u8],
) -> Response {
    if let Some(name) = model_name {
        if name != handler.name() {
            return error_response(StatusCode::NOT_FOUND, format!("unknown model '{name}'"));
        }
    }

    let request = match protocol.decode_request(body) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let mut response = match handler.predict(request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(unit = %handler.name(), error = %e, "serve: prediction failed");
            return error_response(status_for(&e), e.to_string());
        }
    };
    if response.model_name.is_empty() {
        response.model_name = handler.name().to_string();
    }

    match protocol.encode_response(&response) {
        Ok(bytes) => {
            debug!(unit = %handler.name(), %protocol, bytes = bytes.len(), "serve: predicted");
            (StatusCode::OK, [(CONTENT_TYPE, "application/json")], bytes).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// 200 when the handler is ready, 503 when not, 404 for another model.
pub async fn handle_ready(handler: &dyn InferenceHandler, model_name: Option<&str>) -> StatusCode {
    if model_name.is_some_and(|name| name != handler.name()) {
        return StatusCode::NOT_FOUND;
    }
    if handler.ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Child endpoints handed to a pipeline container, keyed by unit name.
pub fn parse_endpoints(json: &str) -> Result<BTreeMap<String, Endpoint>, DeploymentError> {
    serde_json::from_str(json)
        .map_err(|e| DeploymentError::InvalidConfig(format!("{ENDPOINTS_ENV}: {e}")))
}

/// [`parse_endpoints`] on the process environment. Unset means no children.
pub fn endpoints_from_env() -> Result<BTreeMap<String, Endpoint>, DeploymentError> {
    match std::env::var(ENDPOINTS_ENV) {
        Ok(json) => parse_endpoints(&json),
        Err(_) => Ok(BTreeMap::new()),
    }
}

fn status_for(err: &ComposeError) -> StatusCode {
    match err {
        ComposeError::Encoding(_) => StatusCode::BAD_REQUEST,
        ComposeError::NotReady { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn seldon_predict(State(handler): State<SharedHandler>, body: Bytes) -> Response {
    handle_predict(handler.as_ref(), Protocol::Seldon, None, &body).await
}

async fn seldon_status(State(handler): State<SharedHandler>) -> StatusCode {
    handle_ready(handler.as_ref(), None).await
}

async fn v2_server_ready(State(handler): State<SharedHandler>) -> StatusCode {
    handle_ready(handler.as_ref(), None).await
}

async fn v2_model_ready(
    State(handler): State<SharedHandler>,
    Path(name): Path<String>,
) -> StatusCode {
    handle_ready(handler.as_ref(), Some(&name)).await
}

async fn v2_infer(
    State(handler): State<SharedHandler>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    handle_predict(handler.as_ref(), Protocol::V2, Some(&name), &body).await
}

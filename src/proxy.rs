//! Command proxy: translates inbound JSON command requests into wire
//! payloads and relays them to the remote enqueue API.
//!
//! One translation per inbound request, synchronously from the caller's
//! point of view. Handlers share nothing mutable: the delivery client and
//! credentials are fixed at startup. Every internal failure at any step
//! becomes a JSON error envelope; commands are live and user-initiated,
//! so they bypass the dedup ledger entirely.

use crate::command::{build_command_payload, encode_payload, CommandPayload, CommandRequest};
use crate::deliver::DeliveryClient;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Fixed Basic-auth username inbound callers authenticate with.
const PROXY_AUTH_USER: &str = "micromdm";

/// Immutable per-process proxy configuration.
pub struct ProxyState {
    client: DeliveryClient,
    api_key: String,
}

impl ProxyState {
    /// `api_key` protects the inbound API; the client carries its own
    /// credential for the remote side.
    pub fn new(client: DeliveryClient, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
        }
    }
}

/// JSON envelope returned for every `/v1/commands` request. Exactly one
/// of the two fields is present.
#[derive(Debug, Serialize)]
pub struct CommandResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<CommandPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Builds the proxy router. `/v1/commands` sits behind Basic auth;
/// `/version` is public.
pub fn build_router(state: Arc<ProxyState>) -> Router {
    let protected = Router::new()
        .route("/v1/commands", post(handle_command))
        .layer(from_fn_with_state(state.clone(), basic_auth));

    Router::new()
        .merge(protected)
        .route("/version", get(version))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves until Ctrl+C / SIGTERM.
pub async fn serve(addr: SocketAddr, state: ProxyState) -> std::io::Result<()> {
    let app = build_router(Arc::new(state));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "starting command proxy");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn handle_command(
    State(state): State<Arc<ProxyState>>,
    body: Result<Json<CommandRequest>, JsonRejection>,
) -> Json<CommandResponse> {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!("rejecting command request: {rejection}");
            return Json(CommandResponse {
                payload: None,
                error: Some(rejection.body_text()),
            });
        }
    };

    match relay(&state, request).await {
        Ok(payload) => Json(CommandResponse {
            payload: Some(payload),
            error: None,
        }),
        Err(error) => {
            warn!("command relay failed: {error}");
            Json(CommandResponse {
                payload: None,
                error: Some(error),
            })
        }
    }
}

async fn relay(state: &ProxyState, request: CommandRequest) -> Result<CommandPayload, String> {
    let payload = build_command_payload(request).map_err(|err| err.to_string())?;
    info!(
        udid = %payload.udid,
        request_type = %payload.command.request_type,
        command_uuid = %payload.command_uuid,
        "forwarding command"
    );
    let encoded = encode_payload(&payload).map_err(|err| err.to_string())?;
    state
        .client
        .send_command(&payload.udid, encoded)
        .await
        .map_err(|err| err.to_string())?;
    Ok(payload)
}

async fn basic_auth(
    State(state): State<Arc<ProxyState>>,
    request: Request,
    next: Next,
) -> Response {
    if authorized(&state, &request) {
        return next.run(request).await;
    }
    let mut response = (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"mdmshift\""),
    );
    response
}

fn authorized(state: &ProxyState, request: &Request) -> bool {
    let Some(credentials) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| BASE64_STANDARD.decode(encoded).ok())
    else {
        return false;
    };

    let mut parts = credentials.splitn(2, |&byte| byte == b':');
    let (Some(user), Some(pass)) = (parts.next(), parts.next()) else {
        return false;
    };

    let user_ok = user.ct_eq(PROXY_AUTH_USER.as_bytes());
    let pass_ok = pass.ct_eq(state.api_key.as_bytes());
    (user_ok & pass_ok).into()
}

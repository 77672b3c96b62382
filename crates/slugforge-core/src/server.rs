// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP transport for the controller.
//!
//! Three routes: pushes come in on `/push/{app}`, workers fetch the
//! agent binary from `/builder` during bootstrap, and agents call
//! back on `/conn/{id}`. The call-back route detaches the connection
//! from HTTP via an upgrade and hands the raw stream to the
//! rendezvous matcher; from then on the connection speaks the framed
//! build protocol, not HTTP.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use base64::Engine;
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

use crate::agent_binary::AgentBinary;
use crate::config::Config;
use crate::push;
use crate::rendezvous::MatcherHandle;
use slugforge_platform::PlatformClient;

/// Upgrade protocol token announced on `/conn/{id}` responses.
pub const BUILD_PROTOCOL: &str = "slugforge-build";

/// Shared state for the controller's HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub agent: Arc<AgentBinary>,
    pub matcher: MatcherHandle,
    pub platform: Arc<PlatformClient>,
}

/// Build the controller router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/push/{app}", post(push::handle_push))
        .route("/builder", get(serve_agent_binary))
        .route("/conn/{id}", any(handle_conn))
        .with_state(state)
}

/// `GET /builder` — the raw agent executable.
async fn serve_agent_binary(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        state.agent.bytes(),
    )
}

/// Any method on `/conn/{id}` — agent call-back.
///
/// The connection is upgraded out of HTTP and posted to the matcher
/// as an inbound event. Unknown ids are not rejected here; the
/// matcher closes orphan connections itself, so probing the endpoint
/// reveals nothing about live tokens.
async fn handle_conn(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut req: Request,
) -> Response {
    let Some(on_upgrade) = req.extensions_mut().remove::<hyper::upgrade::OnUpgrade>() else {
        warn!("connection cannot be hijacked from this server stack");
        return (StatusCode::INTERNAL_SERVER_ERROR, "cannot hijack connection\n")
            .into_response();
    };

    let matcher = state.matcher.clone();
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                debug!(id = %id, "agent connection upgraded");
                matcher.inbound(id, Box::new(TokioIo::new(upgraded)));
            }
            Err(e) => warn!(id = %id, "connection upgrade failed: {e}"),
        }
    });

    (
        StatusCode::SWITCHING_PROTOCOLS,
        [
            (header::CONNECTION, "upgrade"),
            (header::UPGRADE, BUILD_PROTOCOL),
        ],
    )
        .into_response()
}

/// Extract the password of a Basic Authorization header. The user
/// part is ignored; an empty password counts as absent.
pub(crate) fn basic_auth_password(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (_user, password) = decoded.split_once(':')?;
    if password.is_empty() {
        return None;
    }
    Some(password.to_string())
}

//! HTTP surface: the `/ws` signaling upgrade with per-IP admission
//! control, and a plain banner for everything else.

use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::ws;

const BANNER: &str = "castgrid signaling node. Connect to /ws for signaling.";

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .fallback(banner)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn banner() -> &'static str {
    BANNER
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let ip = addr.ip();
    let session_id = state.registry.next_session_id();

    if !state.config.ip_allow_list.contains(ip) && !state.registry.try_add_ip(ip).await {
        tracing::info!(session = session_id, %ip, "connection rejected: too many sessions from this address");
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests.").into_response();
    }

    ws.on_upgrade(move |socket| ws::session::run(state, socket, session_id, ip))
}

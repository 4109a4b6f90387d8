use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use super::{auth::OperatorAuth, ApiResult};
use crate::{
    gateway::serve_socket,
    registry::{RegistryStats, TenantConnections},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct RealtimeStats {
    #[serde(flatten)]
    pub stats: RegistryStats,
    pub buckets: Vec<TenantConnections>,
}

pub async fn realtime_stats(
    _auth: OperatorAuth,
    State(state): State<AppState>,
) -> ApiResult<RealtimeStats> {
    let registry = state.gateway.registry();
    Ok(Json(RealtimeStats {
        stats: registry.stats(),
        buckets: registry.list_all(),
    }))
}

/// Sockets authenticate after connecting, through `admin:register` or
/// `client:register`.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| serve_socket(gateway, socket))
}

use std::path::PathBuf;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{auth::OperatorAuth, ApiResult};
use crate::{
    state::AppState,
    supervisor::{RestartOutcome, RunningProcess, StopOutcome, UsageReport},
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct Started {
    pub port: u16,
    pub pid: u32,
}

#[derive(Debug, Serialize)]
pub struct Stopped {
    pub port: u16,
    pub outcome: StopOutcome,
}

#[derive(Debug, Serialize)]
pub struct Restarted {
    pub port: u16,
    pub outcome: RestartOutcome,
}

#[derive(Debug, Serialize)]
pub struct StoppedAll {
    pub stopped: usize,
}

pub async fn list_servers(
    _auth: OperatorAuth,
    State(state): State<AppState>,
) -> ApiResult<Vec<RunningProcess>> {
    Ok(Json(state.supervisor.list()))
}

pub async fn start_server(
    _auth: OperatorAuth,
    State(state): State<AppState>,
    Path(port): Path<u16>,
    body: Option<Json<StartRequest>>,
) -> ApiResult<Started> {
    let work_dir = body.and_then(|Json(body)| body.work_dir);
    let pid = state.supervisor.start(port, work_dir).await?;
    Ok(Json(Started { port, pid }))
}

pub async fn stop_server(
    _auth: OperatorAuth,
    State(state): State<AppState>,
    Path(port): Path<u16>,
) -> ApiResult<Stopped> {
    let outcome = state.supervisor.stop(port).await?;
    Ok(Json(Stopped { port, outcome }))
}

pub async fn restart_server(
    _auth: OperatorAuth,
    State(state): State<AppState>,
    Path(port): Path<u16>,
) -> ApiResult<Restarted> {
    let outcome = state.supervisor.restart(port).await?;
    Ok(Json(Restarted { port, outcome }))
}

pub async fn stop_all_servers(
    _auth: OperatorAuth,
    State(state): State<AppState>,
) -> ApiResult<StoppedAll> {
    let stopped = state.supervisor.stop_all().await;
    Ok(Json(StoppedAll { stopped }))
}

pub async fn usage(
    _auth: OperatorAuth,
    State(state): State<AppState>,
) -> ApiResult<Vec<UsageReport>> {
    Ok(Json(state.supervisor.usage()))
}

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use super::{auth::OperatorAuth, ApiError, ApiResult};
use crate::{
    provision::Provisioned,
    state::AppState,
    store::TenantView,
};

#[derive(Debug, Deserialize)]
pub struct CreateTenantRequest {
    pub name: String,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeDomainRequest {
    pub domain: String,
}

pub async fn create_tenant(
    _auth: OperatorAuth,
    State(state): State<AppState>,
    Json(body): Json<CreateTenantRequest>,
) -> Result<(StatusCode, Json<Provisioned>), ApiError> {
    let provisioned = state
        .provisioner
        .create(&body.name, body.domain.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(provisioned)))
}

pub async fn list_tenants(
    _auth: OperatorAuth,
    State(state): State<AppState>,
) -> ApiResult<Vec<TenantView>> {
    let tenants = state.store.list().await?;
    Ok(Json(tenants.iter().map(TenantView::from).collect()))
}

pub async fn change_domain(
    _auth: OperatorAuth,
    State(state): State<AppState>,
    Path(port): Path<u16>,
    Json(body): Json<ChangeDomainRequest>,
) -> ApiResult<TenantView> {
    let view = state.provisioner.change_domain(port, &body.domain).await?;
    Ok(Json(view))
}

use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Query, Request, State},
    http::{request::Parts, HeaderMap},
    Json,
};
use pier_trust::{
    parse_signed_integer, SignedEnvelope, HEADER_PORT, HEADER_SIGNATURE, HEADER_TIMESTAMP,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use super::{ApiError, ApiResult};
use crate::{
    gateway::{EVENT_CLIENT_STATUS_UPDATE, EVENT_NEW_TICKET, EVENT_TICKET_UPDATE},
    registry::TenantKey,
    state::AppState,
    store::{Tenant, TenantView},
    trust::AuthRejected,
};

const BODY_LIMIT: usize = 1024 * 1024;
const BODY_AUTH_FIELD: &str = "__auth";

/// Tenant authenticated from headers or query parameters.
pub struct SignedTenant(pub Tenant);

/// Tenant authenticated from headers, query parameters, or the body's
/// `__auth` object, plus the remaining body.
pub struct SignedJson<T> {
    pub tenant: Tenant,
    pub payload: T,
}

#[async_trait]
impl FromRequestParts<AppState> for SignedTenant {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let envelope = envelope_from_parts(parts);
        authenticate(state, envelope).await.map(SignedTenant)
    }
}

#[async_trait]
impl<T> FromRequest<AppState> for SignedJson<T>
where
    T: DeserializeOwned + Send,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &AppState) -> Result<Self, Self::Rejection> {
        let (parts, body) = req.into_parts();
        let bytes = axum::body::to_bytes(body, BODY_LIMIT)
            .await
            .map_err(|_| ApiError::BadRequest("request body unreadable".into()))?;
        let mut value: Value = if bytes.is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_slice(&bytes).map_err(|err| ApiError::BadRequest(err.to_string()))?
        };
        let embedded = value
            .as_object_mut()
            .and_then(|object| object.remove(BODY_AUTH_FIELD));

        let envelope = envelope_from_parts(&parts)
            .or_else(|| embedded.and_then(|auth| serde_json::from_value(auth).ok()));
        let tenant = authenticate(state, envelope).await?;

        let payload =
            serde_json::from_value(value).map_err(|err| ApiError::BadRequest(err.to_string()))?;
        Ok(SignedJson { tenant, payload })
    }
}

async fn authenticate(
    state: &AppState,
    envelope: Option<SignedEnvelope>,
) -> Result<Tenant, ApiError> {
    let Some(envelope) = envelope else {
        state.trust.record_rejection(None, &AuthRejected::Missing);
        return Err(ApiError::Unauthorized);
    };
    state.trust.validate(&envelope).await.map_err(|err| match err {
        AuthRejected::Store(err) => ApiError::Internal(err.to_string()),
        _ => ApiError::Unauthorized,
    })
}

#[derive(Debug, Default, Deserialize)]
struct EnvelopeQuery {
    port: Option<String>,
    timestamp: Option<String>,
    signature: Option<String>,
}

fn envelope_from_parts(parts: &Parts) -> Option<SignedEnvelope> {
    from_headers(&parts.headers).or_else(|| {
        let Query(query) = Query::<EnvelopeQuery>::try_from_uri(&parts.uri).ok()?;
        assemble(
            query.port.as_deref()?,
            query.timestamp.as_deref()?,
            query.signature.as_deref()?,
        )
    })
}

fn from_headers(headers: &HeaderMap) -> Option<SignedEnvelope> {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    assemble(
        header(HEADER_PORT)?,
        header(HEADER_TIMESTAMP)?,
        header(HEADER_SIGNATURE)?,
    )
}

fn assemble(port: &str, timestamp: &str, signature: &str) -> Option<SignedEnvelope> {
    Some(SignedEnvelope {
        port: u16::try_from(parse_signed_integer(port)?).ok()?,
        timestamp: parse_signed_integer(timestamp)?,
        signature: signature.trim().to_string(),
    })
}

pub async fn tenant_information(SignedTenant(tenant): SignedTenant) -> Json<TenantView> {
    Json(TenantView::from(&tenant))
}

#[derive(Debug, Serialize)]
pub struct TicketRelayed {
    pub delivered: usize,
}

pub async fn submit_ticket(
    State(state): State<AppState>,
    SignedJson { tenant, payload }: SignedJson<Value>,
) -> ApiResult<TicketRelayed> {
    let key = TenantKey::from(tenant.port);
    let delivered = state.gateway.send_to_admins(&key, EVENT_NEW_TICKET, &payload);
    info!(tenant = %tenant.name, port = tenant.port, delivered, "ticket relayed to admins");
    Ok(Json(TicketRelayed { delivered }))
}

#[derive(Debug, Deserialize)]
pub struct TicketStatusRequest {
    pub ticket: Value,
    #[serde(rename = "customerPhone", default)]
    pub customer_phone: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketStatusRelayed {
    pub admins_notified: usize,
    pub client_notified: bool,
}

pub async fn update_ticket_status(
    State(state): State<AppState>,
    SignedJson { tenant, payload }: SignedJson<TicketStatusRequest>,
) -> ApiResult<TicketStatusRelayed> {
    let key = TenantKey::from(tenant.port);
    let admins_notified = state
        .gateway
        .send_to_admins(&key, EVENT_TICKET_UPDATE, &payload.ticket);
    let client_notified = match payload.customer_phone.as_deref().map(str::trim) {
        Some(phone) if !phone.is_empty() => state.gateway.send_to_client(
            &key,
            phone,
            EVENT_CLIENT_STATUS_UPDATE,
            &payload.ticket,
        ),
        _ => false,
    };
    Ok(Json(TicketStatusRelayed {
        admins_notified,
        client_notified,
    }))
}

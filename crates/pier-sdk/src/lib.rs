//! Asynchronous client for tenant processes spawned by pier.
//!
//! A tenant process learns who it is from the spawn environment and signs every
//! call back into the orchestrator with a fresh [`SignedEnvelope`].

use std::time::Duration;

use pier_trust::{env, SignedEnvelope, HEADER_PORT, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct TenantCredentials {
    pub tenant_id: String,
    pub secret: String,
    pub port: u16,
    pub domain: String,
    pub orchestrator_url: String,
}

impl std::fmt::Debug for TenantCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("secret", &"<redacted>")
            .field("port", &self.port)
            .field("domain", &self.domain)
            .field("orchestrator_url", &self.orchestrator_url)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),
    #[error("environment variable {name} has invalid value {value:?}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
}

impl TenantCredentials {
    pub fn from_env() -> Result<Self, SdkError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds credentials from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SdkError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or(SdkError::MissingEnv(name))
        };

        let raw_port = required(env::TENANT_PORT)?;
        let port = raw_port.parse().map_err(|_| SdkError::InvalidEnv {
            name: env::TENANT_PORT,
            value: raw_port.clone(),
        })?;

        Ok(Self {
            tenant_id: required(env::TENANT_ID)?,
            secret: required(env::TENANT_SECRET)?,
            port,
            domain: required(env::TENANT_DOMAIN)?,
            orchestrator_url: required(env::ORCHESTRATOR_URL)?
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

/// Status change for a ticket, relayed to the tenant's admins and to the customer.
#[derive(Debug, Clone, Serialize)]
pub struct TicketStatusUpdate {
    pub ticket: serde_json::Value,
    #[serde(rename = "customerPhone", skip_serializing_if = "Option::is_none")]
    pub customer_phone: Option<String>,
}

#[derive(Clone)]
pub struct OrchestratorClient {
    http: Client,
    credentials: TenantCredentials,
    timeout: Duration,
}

impl OrchestratorClient {
    pub fn new(credentials: TenantCredentials) -> Self {
        Self {
            http: Client::new(),
            credentials,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn credentials(&self) -> &TenantCredentials {
        &self.credentials
    }

    /// The authenticated tenant record as the orchestrator sees it.
    pub async fn information<T>(&self) -> Result<T, SdkError>
    where
        T: DeserializeOwned,
    {
        self.send(self.http.get(self.url("/tenant/information"))).await
    }

    pub async fn submit_ticket(
        &self,
        ticket: &serde_json::Value,
    ) -> Result<serde_json::Value, SdkError> {
        self.send(self.http.post(self.url("/tenant/tickets")).json(ticket))
            .await
    }

    pub async fn update_ticket_status(
        &self,
        update: &TicketStatusUpdate,
    ) -> Result<serde_json::Value, SdkError> {
        self.send(
            self.http
                .post(self.url("/tenant/tickets/status"))
                .json(update),
        )
        .await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.credentials.orchestrator_url, path)
    }

    async fn send<T>(&self, request: RequestBuilder) -> Result<T, SdkError>
    where
        T: DeserializeOwned,
    {
        let envelope = SignedEnvelope::sign_now(&self.credentials.secret, self.credentials.port);
        debug!(
            port = envelope.port,
            timestamp = envelope.timestamp,
            "signing orchestrator request"
        );
        let res = request
            .timeout(self.timeout)
            .header(HEADER_PORT, envelope.port.to_string())
            .header(HEADER_TIMESTAMP, envelope.timestamp.to_string())
            .header(HEADER_SIGNATURE, envelope.signature)
            .send()
            .await?;

        if res.status().is_success() {
            Ok(res.json::<T>().await?)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(SdkError::UnexpectedStatus { status, body })
        }
    }
}

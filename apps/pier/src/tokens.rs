use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::registry::TenantKey;

/// Issues and verifies the HS256 credentials realtime sockets register with.
#[derive(Clone)]
pub struct RegistrationTokens {
    enc: EncodingKey,
    dec: DecodingKey,
    ttl: Duration,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token missing or malformed")]
    Malformed,
    #[error("token verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("token carries no {0}")]
    MissingIdentity(&'static str),
}

impl TokenError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            TokenError::Malformed => "malformed",
            TokenError::Jwt(err) => match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => "expired",
                jsonwebtoken::errors::ErrorKind::InvalidSignature => "bad_signature",
                _ => "invalid",
            },
            TokenError::MissingIdentity(_) => "missing_identity",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationClaims {
    #[serde(deserialize_with = "port_as_key")]
    pub port: TenantKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(
        rename = "customerPhone",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub customer_phone: Option<String>,
    pub exp: i64,
}

impl RegistrationClaims {
    pub fn admin_email(&self) -> Result<&str, TokenError> {
        non_empty(self.email.as_deref()).ok_or(TokenError::MissingIdentity("email"))
    }

    pub fn customer_phone(&self) -> Result<&str, TokenError> {
        non_empty(self.customer_phone.as_deref()).ok_or(TokenError::MissingIdentity("customerPhone"))
    }
}

impl RegistrationTokens {
    pub fn new(secret: &str) -> Self {
        Self {
            enc: EncodingKey::from_secret(secret.as_bytes()),
            dec: DecodingKey::from_secret(secret.as_bytes()),
            ttl: Duration::hours(12),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn issue_admin(&self, tenant: &TenantKey, email: &str) -> Result<String, TokenError> {
        self.issue(RegistrationClaims {
            port: tenant.clone(),
            email: Some(email.to_string()),
            customer_phone: None,
            exp: (Utc::now() + self.ttl).timestamp(),
        })
    }

    pub fn issue_client(&self, tenant: &TenantKey, phone: &str) -> Result<String, TokenError> {
        self.issue(RegistrationClaims {
            port: tenant.clone(),
            email: None,
            customer_phone: Some(phone.to_string()),
            exp: (Utc::now() + self.ttl).timestamp(),
        })
    }

    fn issue(&self, claims: RegistrationClaims) -> Result<String, TokenError> {
        let header = Header::new(Algorithm::HS256);
        Ok(jsonwebtoken::encode(&header, &claims, &self.enc)?)
    }

    pub fn verify(&self, token: &str) -> Result<RegistrationClaims, TokenError> {
        if token.trim().is_empty() {
            return Err(TokenError::Malformed);
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let data = jsonwebtoken::decode::<RegistrationClaims>(token, &self.dec, &validation)?;
        Ok(data.claims)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn port_as_key<'de, D>(deserializer: D) -> Result<TenantKey, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortClaim {
        Number(u64),
        Text(String),
    }

    Ok(match PortClaim::deserialize(deserializer)? {
        PortClaim::Number(port) => TenantKey::new(port.to_string()),
        PortClaim::Text(port) => TenantKey::new(port),
    })
}

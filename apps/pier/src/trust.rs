use std::{sync::Arc, time::Duration};

use metrics::counter;
use pier_trust::{now_millis, SignedEnvelope, TrustError};
use thiserror::Error;
use tracing::warn;

use crate::store::{StoreError, Tenant, TenantStore};

/// Why a signed call was refused. Only ever logged; callers see a bare 401.
#[derive(Debug, Error)]
pub enum AuthRejected {
    #[error("signed envelope missing or unparseable")]
    Missing,
    #[error("no tenant on port {0}")]
    UnknownPort(u16),
    #[error(transparent)]
    Invalid(#[from] TrustError),
    #[error("tenant lookup failed: {0}")]
    Store(#[from] StoreError),
}

impl AuthRejected {
    pub fn metric_label(&self) -> &'static str {
        match self {
            AuthRejected::Missing => "missing_envelope",
            AuthRejected::UnknownPort(_) => "unknown_port",
            AuthRejected::Invalid(err) => err.metric_label(),
            AuthRejected::Store(_) => "store_unavailable",
        }
    }
}

/// Gate for every call arriving from a tenant process.
pub struct TrustBoundary {
    store: Arc<dyn TenantStore>,
    window: Duration,
}

impl TrustBoundary {
    pub fn new(store: Arc<dyn TenantStore>, window: Duration) -> Self {
        Self { store, window }
    }

    pub async fn validate(&self, envelope: &SignedEnvelope) -> Result<Tenant, AuthRejected> {
        self.validate_at(envelope, now_millis()).await
    }

    pub async fn validate_at(
        &self,
        envelope: &SignedEnvelope,
        now_ms: i64,
    ) -> Result<Tenant, AuthRejected> {
        let result = self.check(envelope, now_ms).await;
        if let Err(err) = &result {
            self.record_rejection(Some(envelope.port), err);
        }
        result
    }

    pub fn record_rejection(&self, port: Option<u16>, err: &AuthRejected) {
        counter!("pier_trust_rejections_total", "reason" => err.metric_label()).increment(1);
        warn!(port, reason = err.metric_label(), error = %err, "signed call rejected");
    }

    async fn check(&self, envelope: &SignedEnvelope, now_ms: i64) -> Result<Tenant, AuthRejected> {
        let tenant = self
            .store
            .find_by_port(envelope.port)
            .await?
            .ok_or(AuthRejected::UnknownPort(envelope.port))?;
        envelope.verify_at(&tenant.secret, now_ms, self.window)?;
        Ok(tenant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{tenant, MemoryTenantStore};
    use pier_trust::REPLAY_WINDOW;

    const NOW: i64 = 1_700_000_000_000;

    fn boundary() -> TrustBoundary {
        let store = MemoryTenantStore::with_tenants([tenant(1001, "acme"), tenant(1002, "beta")])
            .unwrap();
        TrustBoundary::new(Arc::new(store), REPLAY_WINDOW)
    }

    #[test_timeout::tokio_timeout_test]
    async fn accepts_signature_from_owning_tenant() {
        let envelope = SignedEnvelope::sign_at("secret-1001", 1001, NOW - 1_000);
        let tenant = boundary().validate_at(&envelope, NOW).await.unwrap();
        assert_eq!(tenant.name, "acme");
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejects_unknown_port() {
        let envelope = SignedEnvelope::sign_at("secret-9999", 9999, NOW);
        let err = boundary().validate_at(&envelope, NOW).await.unwrap_err();
        assert!(matches!(err, AuthRejected::UnknownPort(9999)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn another_tenants_secret_does_not_verify() {
        let envelope = SignedEnvelope::sign_at("secret-1002", 1001, NOW);
        let err = boundary().validate_at(&envelope, NOW).await.unwrap_err();
        assert!(matches!(
            err,
            AuthRejected::Invalid(TrustError::SignatureMismatch)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn stale_envelope_is_rejected() {
        let envelope = SignedEnvelope::sign_at("secret-1001", 1001, NOW - 60_001);
        let err = boundary().validate_at(&envelope, NOW).await.unwrap_err();
        assert_eq!(err.metric_label(), "stale_timestamp");
    }
}

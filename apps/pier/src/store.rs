use std::{collections::BTreeMap, path::Path};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// A provisioned tenant. The port and secret never change once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub domain: String,
    pub port: u16,
    pub secret: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Tenant record safe to hand out over HTTP.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantView {
    pub id: String,
    pub name: String,
    pub domain: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
}

impl From<&Tenant> for TenantView {
    fn from(tenant: &Tenant) -> Self {
        Self {
            id: tenant.id.clone(),
            name: tenant.name.clone(),
            domain: tenant.domain.clone(),
            port: tenant.port,
            created_at: tenant.created_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("port {0} is already assigned")]
    DuplicatePort(u16),
    #[error("no tenant on port {0}")]
    UnknownPort(u16),
    #[error("failed to read tenant seed {path}: {source}")]
    SeedIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid tenant seed: {0}")]
    SeedFormat(#[from] serde_json::Error),
}

/// Persistence boundary for tenant records.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn find_by_port(&self, port: u16) -> Result<Option<Tenant>, StoreError>;
    async fn find_by_id(&self, id: &str) -> Result<Option<Tenant>, StoreError>;
    /// Highest port ever assigned, if any.
    async fn last_port(&self) -> Result<Option<u16>, StoreError>;
    async fn insert(&self, tenant: Tenant) -> Result<(), StoreError>;
    async fn update_domain(&self, port: u16, domain: &str) -> Result<Tenant, StoreError>;
    async fn list(&self) -> Result<Vec<Tenant>, StoreError>;
}

#[derive(Default)]
pub struct MemoryTenantStore {
    tenants: RwLock<BTreeMap<u16, Tenant>>,
}

impl MemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenants(tenants: impl IntoIterator<Item = Tenant>) -> Result<Self, StoreError> {
        let store = Self::new();
        {
            let mut map = store.tenants.write();
            for tenant in tenants {
                if map.contains_key(&tenant.port) {
                    return Err(StoreError::DuplicatePort(tenant.port));
                }
                map.insert(tenant.port, tenant);
            }
        }
        Ok(store)
    }

    /// Loads a JSON array of tenants.
    pub async fn from_seed_file(path: &Path) -> Result<Self, StoreError> {
        let raw = tokio::fs::read(path)
            .await
            .map_err(|source| StoreError::SeedIo {
                path: path.display().to_string(),
                source,
            })?;
        let tenants: Vec<Tenant> = serde_json::from_slice(&raw)?;
        let store = Self::with_tenants(tenants)?;
        info!(
            path = %path.display(),
            tenants = store.tenants.read().len(),
            "loaded tenant seed"
        );
        Ok(store)
    }
}

#[async_trait]
impl TenantStore for MemoryTenantStore {
    async fn find_by_port(&self, port: u16) -> Result<Option<Tenant>, StoreError> {
        Ok(self.tenants.read().get(&port).cloned())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Tenant>, StoreError> {
        Ok(self
            .tenants
            .read()
            .values()
            .find(|tenant| tenant.id == id)
            .cloned())
    }

    async fn last_port(&self) -> Result<Option<u16>, StoreError> {
        Ok(self.tenants.read().keys().next_back().copied())
    }

    async fn insert(&self, tenant: Tenant) -> Result<(), StoreError> {
        let mut map = self.tenants.write();
        if map.contains_key(&tenant.port) {
            return Err(StoreError::DuplicatePort(tenant.port));
        }
        map.insert(tenant.port, tenant);
        Ok(())
    }

    async fn update_domain(&self, port: u16, domain: &str) -> Result<Tenant, StoreError> {
        let mut map = self.tenants.write();
        let tenant = map.get_mut(&port).ok_or(StoreError::UnknownPort(port))?;
        tenant.domain = domain.to_string();
        Ok(tenant.clone())
    }

    async fn list(&self) -> Result<Vec<Tenant>, StoreError> {
        Ok(self.tenants.read().values().cloned().collect())
    }
}

#[cfg(test)]
pub(crate) fn tenant(port: u16, name: &str) -> Tenant {
    Tenant {
        id: format!("tenant-{port}"),
        name: name.to_string(),
        domain: format!("{name}.localhost"),
        port,
        secret: format!("secret-{port}"),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test_timeout::tokio_timeout_test]
    async fn rejects_duplicate_ports() {
        let store = MemoryTenantStore::new();
        store.insert(tenant(1001, "acme")).await.unwrap();
        let err = store.insert(tenant(1001, "other")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicatePort(1001)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn last_port_tracks_highest_assignment() {
        let store = MemoryTenantStore::with_tenants([tenant(1003, "c"), tenant(1001, "a")]).unwrap();
        assert_eq!(store.last_port().await.unwrap(), Some(1003));
        assert_eq!(MemoryTenantStore::new().last_port().await.unwrap(), None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn update_domain_keeps_port_and_secret() {
        let store = MemoryTenantStore::with_tenants([tenant(1001, "acme")]).unwrap();
        let updated = store.update_domain(1001, "shop.acme.test").await.unwrap();
        assert_eq!(updated.domain, "shop.acme.test");
        assert_eq!(updated.secret, "secret-1001");
        assert!(matches!(
            store.update_domain(1002, "x").await,
            Err(StoreError::UnknownPort(1002))
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn loads_seed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id":"t1","name":"Acme","domain":"acme.test","port":1001,"secret":"abc"}}]"#
        )
        .unwrap();
        let store = MemoryTenantStore::from_seed_file(file.path()).await.unwrap();
        let found = store.find_by_id("t1").await.unwrap().unwrap();
        assert_eq!(found.port, 1001);
        assert_eq!(TenantView::from(&found).domain, "acme.test");
    }
}

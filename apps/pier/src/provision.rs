use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    ports::{PortAllocator, PortError},
    proxy::{normalize_domain, ProxyError, ReverseProxyConfigurator},
    store::{StoreError, Tenant, TenantStore, TenantView},
    supervisor::{ProcessSupervisor, SupervisorError},
};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("tenant name must not be empty")]
    InvalidName,
    #[error("no tenant on port {0}")]
    UnknownTenant(u16),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The tenant record and vhost exist; only the process is missing.
    #[error(
        "tenant {} was created on port {} but its process did not start: {source}",
        tenant.name,
        tenant.port
    )]
    StartFailed {
        tenant: Box<TenantView>,
        source: SupervisorError,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Provisioned {
    pub tenant: TenantView,
    pub link: String,
    pub pid: u32,
}

/// Creates tenants end to end: port, secret, vhost, record, process.
pub struct Provisioner {
    store: Arc<dyn TenantStore>,
    ports: PortAllocator,
    proxy: ReverseProxyConfigurator,
    supervisor: ProcessSupervisor,
    domain_suffix: String,
    // Port allocation reads the last port, so creations must not interleave.
    creation: Mutex<()>,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn TenantStore>,
        proxy: ReverseProxyConfigurator,
        supervisor: ProcessSupervisor,
        domain_suffix: impl Into<String>,
    ) -> Self {
        Self {
            ports: PortAllocator::new(Arc::clone(&store)),
            store,
            proxy,
            supervisor,
            domain_suffix: domain_suffix.into(),
            creation: Mutex::new(()),
        }
    }

    pub async fn create(
        &self,
        name: &str,
        domain: Option<&str>,
    ) -> Result<Provisioned, ProvisionError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ProvisionError::InvalidName);
        }
        let domain = match domain.map(normalize_domain).filter(|d| !d.is_empty()) {
            Some(domain) => domain,
            None => format!("{}.{}", normalize_domain(name), self.domain_suffix),
        };

        let tenant = {
            let _guard = self.creation.lock().await;
            let port = self.ports.next_port().await?;
            let tenant = Tenant {
                id: Uuid::new_v4().to_string(),
                name: name.to_string(),
                domain: domain.clone(),
                port,
                secret: pier_trust::generate_secret(),
                created_at: Utc::now(),
            };
            self.proxy.publish(&tenant.domain, port).await?;
            self.store.insert(tenant.clone()).await?;
            tenant
        };
        info!(tenant = %tenant.name, port = tenant.port, domain = %tenant.domain, "tenant created");

        let pid = match self.supervisor.start(tenant.port, None).await {
            Ok(pid) => pid,
            Err(source) => {
                warn!(
                    tenant = %tenant.name,
                    port = tenant.port,
                    error = %source,
                    "tenant created but not running"
                );
                return Err(ProvisionError::StartFailed {
                    tenant: Box::new(TenantView::from(&tenant)),
                    source,
                });
            }
        };
        Ok(Provisioned {
            link: format!("https://{}", tenant.domain),
            tenant: TenantView::from(&tenant),
            pid,
        })
    }

    /// Points the tenant at a new domain. The running process keeps its port.
    pub async fn change_domain(
        &self,
        port: u16,
        new_domain: &str,
    ) -> Result<TenantView, ProvisionError> {
        let tenant = self
            .store
            .find_by_port(port)
            .await?
            .ok_or(ProvisionError::UnknownTenant(port))?;
        let new_domain = normalize_domain(new_domain);
        self.proxy
            .republish(&tenant.domain, &new_domain, port)
            .await?;
        let updated = self.store.update_domain(port, &new_domain).await?;
        info!(
            tenant = %updated.name,
            port,
            old = %tenant.domain,
            new = %updated.domain,
            "tenant domain changed"
        );
        Ok(TenantView::from(&updated))
    }
}

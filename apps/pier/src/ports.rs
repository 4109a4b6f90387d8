use std::sync::Arc;

use thiserror::Error;

use crate::store::{StoreError, TenantStore};

/// First port handed to a tenant; everything at or below 1000 is reserved.
pub const FIRST_TENANT_PORT: u16 = 1001;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("tenant store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("tenant port range exhausted")]
    Exhausted,
}

/// Hands out tenant ports. Callers serialize creation; nothing here locks.
#[derive(Clone)]
pub struct PortAllocator {
    store: Arc<dyn TenantStore>,
}

impl PortAllocator {
    pub fn new(store: Arc<dyn TenantStore>) -> Self {
        Self { store }
    }

    pub async fn next_port(&self) -> Result<u16, PortError> {
        let last = self.store.last_port().await?;
        next_after(last)
    }
}

pub fn next_after(last: Option<u16>) -> Result<u16, PortError> {
    match last {
        None => Ok(FIRST_TENANT_PORT),
        Some(last) => last
            .checked_add(1)
            .map(|next| next.max(FIRST_TENANT_PORT))
            .ok_or(PortError::Exhausted),
    }
}

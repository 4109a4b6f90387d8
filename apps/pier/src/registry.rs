use std::{collections::HashMap, fmt, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub type SocketId = String;

/// Tenant scope for realtime connections: the tenant port as a trimmed string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantKey(String);

impl TenantKey {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn port(&self) -> Option<u16> {
        self.0.parse().ok()
    }
}

impl From<u16> for TenantKey {
    fn from(port: u16) -> Self {
        Self(port.to_string())
    }
}

impl From<&str> for TenantKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "role", content = "identity", rename_all = "snake_case")]
pub enum Role {
    /// Identified by email.
    Admin(String),
    /// Identified by phone number.
    Client(String),
}

impl Role {
    pub fn identity(&self) -> &str {
        match self {
            Role::Admin(identity) | Role::Client(identity) => identity,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Role::Admin(_) => "admin",
            Role::Client(_) => "client",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub tenant: TenantKey,
    #[serde(flatten)]
    pub role: Role,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub tenants: usize,
    pub admins: usize,
    pub clients: usize,
    pub sockets: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminEntry {
    pub socket_id: SocketId,
    pub email: String,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEntry {
    pub customer_phone: String,
    pub socket_id: SocketId,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantConnections {
    pub tenant: TenantKey,
    pub admins: Vec<AdminEntry>,
    pub clients: Vec<ClientEntry>,
    pub last_activity: DateTime<Utc>,
}

/// Directory of live realtime sockets, scoped by tenant.
///
/// Every socket id maps to exactly one membership, and every
/// (tenant, client identity) pair to at most one socket.
pub trait ConnectionRegistry: Send + Sync {
    fn add_admin(&self, tenant: &TenantKey, socket_id: &str, email: &str) -> Membership;
    /// Replaces any earlier socket registered for the same identity.
    fn add_client(&self, tenant: &TenantKey, phone: &str, socket_id: &str) -> Membership;
    /// Idempotent; unknown sockets are ignored.
    fn remove(&self, socket_id: &str) -> Option<Membership>;
    fn remove_client(&self, tenant: &TenantKey, phone: &str) -> Option<SocketId>;
    fn membership(&self, socket_id: &str) -> Option<Membership>;
    fn admin_sockets(&self, tenant: &TenantKey) -> Vec<SocketId>;
    fn client_socket(&self, tenant: &TenantKey, phone: &str) -> Option<SocketId>;
    fn client_sockets(&self, tenant: &TenantKey) -> Vec<SocketId>;
    /// Drops empty tenant buckets idle for longer than `threshold`.
    fn clean_inactive(&self, threshold: Duration) -> usize;
    fn stats(&self) -> RegistryStats;
    fn list_all(&self) -> Vec<TenantConnections>;
}

#[derive(Debug)]
struct AdminRecord {
    email: String,
    connected_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ClientRecord {
    socket_id: SocketId,
    connected_at: DateTime<Utc>,
}

#[derive(Debug)]
struct TenantBucket {
    admins: HashMap<SocketId, AdminRecord>,
    clients: HashMap<String, ClientRecord>,
    last_activity: DateTime<Utc>,
}

impl Default for TenantBucket {
    fn default() -> Self {
        Self {
            admins: HashMap::new(),
            clients: HashMap::new(),
            last_activity: Utc::now(),
        }
    }
}

impl TenantBucket {
    fn is_empty(&self) -> bool {
        self.admins.is_empty() && self.clients.is_empty()
    }
}

/// Lock order: a tenant bucket is always locked before the socket index.
#[derive(Default)]
pub struct InMemoryRegistry {
    tenants: DashMap<TenantKey, TenantBucket>,
    sockets: DashMap<SocketId, Membership>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn drop_if_empty(&self, tenant: &TenantKey) {
        if self
            .tenants
            .remove_if(tenant, |_, bucket| bucket.is_empty())
            .is_some()
        {
            debug!(tenant = %tenant, "tenant bucket emptied");
        }
    }
}

impl ConnectionRegistry for InMemoryRegistry {
    fn add_admin(&self, tenant: &TenantKey, socket_id: &str, email: &str) -> Membership {
        self.remove(socket_id);

        let now = Utc::now();
        let membership = Membership {
            tenant: tenant.clone(),
            role: Role::Admin(email.to_string()),
            connected_at: now,
        };
        let mut bucket = self.tenants.entry(tenant.clone()).or_default();
        bucket.admins.insert(
            socket_id.to_string(),
            AdminRecord {
                email: email.to_string(),
                connected_at: now,
            },
        );
        bucket.last_activity = now;
        self.sockets
            .insert(socket_id.to_string(), membership.clone());
        drop(bucket);

        info!(tenant = %tenant, socket_id, email, "admin registered");
        membership
    }

    fn add_client(&self, tenant: &TenantKey, phone: &str, socket_id: &str) -> Membership {
        self.remove(socket_id);

        let now = Utc::now();
        let membership = Membership {
            tenant: tenant.clone(),
            role: Role::Client(phone.to_string()),
            connected_at: now,
        };
        let mut bucket = self.tenants.entry(tenant.clone()).or_default();
        let previous = bucket.clients.insert(
            phone.to_string(),
            ClientRecord {
                socket_id: socket_id.to_string(),
                connected_at: now,
            },
        );
        if let Some(previous) = &previous {
            self.sockets.remove(&previous.socket_id);
        }
        bucket.last_activity = now;
        self.sockets
            .insert(socket_id.to_string(), membership.clone());
        drop(bucket);

        if let Some(previous) = previous {
            info!(
                tenant = %tenant,
                phone,
                evicted = %previous.socket_id,
                socket_id,
                "client re-registered; previous socket evicted"
            );
        } else {
            info!(tenant = %tenant, phone, socket_id, "client registered");
        }
        membership
    }

    fn remove(&self, socket_id: &str) -> Option<Membership> {
        let tenant = self.sockets.get(socket_id)?.tenant.clone();

        let removed = {
            let mut bucket = self.tenants.get_mut(&tenant)?;
            // Re-read under the bucket lock; a concurrent re-registration may have moved it.
            let membership = self
                .sockets
                .remove_if(socket_id, |_, membership| membership.tenant == tenant)
                .map(|(_, membership)| membership)?;
            match &membership.role {
                Role::Admin(_) => {
                    bucket.admins.remove(socket_id);
                }
                Role::Client(phone) => {
                    let owned = bucket
                        .clients
                        .get(phone)
                        .is_some_and(|record| record.socket_id == socket_id);
                    if owned {
                        bucket.clients.remove(phone);
                    }
                }
            }
            bucket.last_activity = Utc::now();
            membership
        };

        self.drop_if_empty(&tenant);
        debug!(
            tenant = %tenant,
            socket_id,
            role = removed.role.label(),
            "socket removed"
        );
        Some(removed)
    }

    fn remove_client(&self, tenant: &TenantKey, phone: &str) -> Option<SocketId> {
        let socket_id = {
            let mut bucket = self.tenants.get_mut(tenant)?;
            let record = bucket.clients.remove(phone)?;
            self.sockets.remove(&record.socket_id);
            bucket.last_activity = Utc::now();
            record.socket_id
        };
        self.drop_if_empty(tenant);
        info!(tenant = %tenant, phone, socket_id = %socket_id, "client removed");
        Some(socket_id)
    }

    fn membership(&self, socket_id: &str) -> Option<Membership> {
        self.sockets.get(socket_id).map(|entry| entry.value().clone())
    }

    fn admin_sockets(&self, tenant: &TenantKey) -> Vec<SocketId> {
        self.tenants
            .get(tenant)
            .map(|bucket| bucket.admins.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn client_socket(&self, tenant: &TenantKey, phone: &str) -> Option<SocketId> {
        self.tenants
            .get(tenant)?
            .clients
            .get(phone)
            .map(|record| record.socket_id.clone())
    }

    fn client_sockets(&self, tenant: &TenantKey) -> Vec<SocketId> {
        self.tenants
            .get(tenant)
            .map(|bucket| {
                bucket
                    .clients
                    .values()
                    .map(|record| record.socket_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn clean_inactive(&self, threshold: Duration) -> usize {
        let now = Utc::now();
        let before = self.tenants.len();
        self.tenants.retain(|tenant, bucket| {
            let idle = (now - bucket.last_activity).to_std().unwrap_or_default();
            let stale = bucket.is_empty() && idle > threshold;
            if stale {
                debug!(tenant = %tenant, idle_secs = idle.as_secs(), "dropping idle tenant bucket");
            }
            !stale
        });
        let removed = before.saturating_sub(self.tenants.len());
        if removed > 0 {
            info!(removed, "inactive tenant buckets swept");
        }
        removed
    }

    fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            tenants: self.tenants.len(),
            sockets: self.sockets.len(),
            ..Default::default()
        };
        for bucket in self.tenants.iter() {
            stats.admins += bucket.admins.len();
            stats.clients += bucket.clients.len();
        }
        stats
    }

    fn list_all(&self) -> Vec<TenantConnections> {
        let mut all: Vec<TenantConnections> = self
            .tenants
            .iter()
            .map(|bucket| TenantConnections {
                tenant: bucket.key().clone(),
                admins: bucket
                    .admins
                    .iter()
                    .map(|(socket_id, record)| AdminEntry {
                        socket_id: socket_id.clone(),
                        email: record.email.clone(),
                        connected_at: record.connected_at,
                    })
                    .collect(),
                clients: bucket
                    .clients
                    .iter()
                    .map(|(phone, record)| ClientEntry {
                        customer_phone: phone.clone(),
                        socket_id: record.socket_id.clone(),
                        connected_at: record.connected_at,
                    })
                    .collect(),
                last_activity: bucket.last_activity,
            })
            .collect();
        all.sort_by(|a, b| a.tenant.cmp(&b.tenant));
        all
    }
}

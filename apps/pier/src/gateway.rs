use std::{sync::Arc, time::Duration};

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    registry::{ConnectionRegistry, Membership, Role, SocketId, TenantKey},
    store::{StoreError, TenantStore},
    tokens::{RegistrationTokens, TokenError},
};

pub const EVENT_NEW_TICKET: &str = "admin:new-ticket";
pub const EVENT_TICKET_UPDATE: &str = "admin:ticket-update";
pub const EVENT_CLIENT_STATUS_UPDATE: &str = "client:update-status";

#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Serialize)]
struct OutboundFrame<'a> {
    event: &'a str,
    data: &'a Value,
}

#[derive(Debug, Deserialize)]
struct RegisterPayload {
    #[serde(default)]
    token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterAs {
    Admin,
    Client,
}

impl RegisterAs {
    fn label(self) -> &'static str {
        match self {
            RegisterAs::Admin => "admin",
            RegisterAs::Client => "client",
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("no tenant on port {0}")]
    UnknownTenant(TenantKey),
    #[error("tenant lookup failed: {0}")]
    Store(#[from] StoreError),
}

impl RegistrationError {
    fn metric_label(&self) -> &'static str {
        match self {
            RegistrationError::Token(err) => err.metric_label(),
            RegistrationError::UnknownTenant(_) => "unknown_tenant",
            RegistrationError::Store(_) => "store_unavailable",
        }
    }

    fn public_message(&self) -> &'static str {
        match self {
            RegistrationError::Token(_) => "invalid or expired token",
            RegistrationError::UnknownTenant(_) => "unknown tenant",
            RegistrationError::Store(_) => "registration unavailable",
        }
    }
}

/// Authenticates realtime sockets and routes tenant-scoped events to them.
pub struct RealtimeGateway {
    registry: Arc<dyn ConnectionRegistry>,
    tokens: RegistrationTokens,
    store: Arc<dyn TenantStore>,
    outboxes: DashMap<SocketId, mpsc::UnboundedSender<String>>,
}

impl RealtimeGateway {
    pub fn new(
        registry: Arc<dyn ConnectionRegistry>,
        tokens: RegistrationTokens,
        store: Arc<dyn TenantStore>,
    ) -> Self {
        Self {
            registry,
            tokens,
            store,
            outboxes: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn ConnectionRegistry> {
        &self.registry
    }

    pub fn tokens(&self) -> &RegistrationTokens {
        &self.tokens
    }

    /// Opens an outbox for `socket_id`; frames routed to it arrive on the receiver.
    pub fn attach(&self, socket_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outboxes.insert(socket_id.to_string(), tx);
        gauge!("pier_gateway_connections_active").set(self.outboxes.len() as f64);
        rx
    }

    /// Runs on every disconnect, registered or not.
    pub fn detach(&self, socket_id: &str) {
        self.outboxes.remove(socket_id);
        let removed = self.registry.remove(socket_id);
        gauge!("pier_gateway_connections_active").set(self.outboxes.len() as f64);
        match removed {
            Some(membership) => info!(
                socket_id,
                tenant = %membership.tenant,
                role = membership.role.label(),
                "realtime socket disconnected"
            ),
            None => debug!(socket_id, "unregistered socket disconnected"),
        }
    }

    pub async fn handle_frame(&self, socket_id: &str, text: &str) {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(socket_id, error = %err, "ignoring malformed frame");
                return;
            }
        };

        match frame.event.as_str() {
            "admin:register" => self.on_register(socket_id, RegisterAs::Admin, frame.data).await,
            "client:register" => self.on_register(socket_id, RegisterAs::Client, frame.data).await,
            "tenant:ping" => self.on_ping(socket_id, frame.data).await,
            "admin:get-status" => self.on_admin_status(socket_id),
            "client:get-status" => self.on_client_status(socket_id),
            other => debug!(socket_id, event = other, "ignoring unknown event"),
        }
    }

    pub async fn register(
        &self,
        socket_id: &str,
        role: RegisterAs,
        token: &str,
    ) -> Result<Membership, RegistrationError> {
        let claims = self.tokens.verify(token)?;
        let identity = match role {
            RegisterAs::Admin => claims.admin_email()?,
            RegisterAs::Client => claims.customer_phone()?,
        };

        let known = match claims.port.port() {
            Some(port) => self.store.find_by_port(port).await?.is_some(),
            None => false,
        };
        if !known {
            return Err(RegistrationError::UnknownTenant(claims.port.clone()));
        }

        Ok(match role {
            RegisterAs::Admin => self.registry.add_admin(&claims.port, socket_id, identity),
            RegisterAs::Client => self.registry.add_client(&claims.port, identity, socket_id),
        })
    }

    async fn on_register(&self, socket_id: &str, role: RegisterAs, data: Value) {
        let token = serde_json::from_value::<RegisterPayload>(data)
            .map(|payload| payload.token)
            .unwrap_or_default();

        match self.register(socket_id, role, &token).await {
            Ok(membership) => {
                counter!(
                    "pier_gateway_registrations_total",
                    "role" => role.label(),
                    "outcome" => "success"
                )
                .increment(1);
                let ack = match &membership.role {
                    Role::Admin(email) => json!({
                        "port": membership.tenant,
                        "email": email,
                        "socketId": socket_id,
                    }),
                    Role::Client(phone) => json!({
                        "port": membership.tenant,
                        "customerPhone": phone,
                        "socketId": socket_id,
                    }),
                };
                self.emit(socket_id, &format!("{}:register:success", role.label()), &ack);
            }
            Err(err) => {
                counter!(
                    "pier_gateway_registrations_total",
                    "role" => role.label(),
                    "outcome" => err.metric_label()
                )
                .increment(1);
                warn!(socket_id, role = role.label(), error = %err, "realtime registration rejected");
                self.emit(
                    socket_id,
                    &format!("{}:register:error", role.label()),
                    &json!({ "message": err.public_message() }),
                );
            }
        }
    }

    async fn on_ping(&self, socket_id: &str, data: Value) {
        let key = match data.get("port") {
            Some(Value::Number(port)) => TenantKey::new(port.to_string()),
            Some(Value::String(port)) => TenantKey::new(port),
            _ => match self.registry.membership(socket_id) {
                Some(membership) => membership.tenant,
                None => TenantKey::new(""),
            },
        };
        let exists = match key.port() {
            Some(port) => matches!(self.store.find_by_port(port).await, Ok(Some(_))),
            None => false,
        };
        self.emit(
            socket_id,
            "tenant:pong",
            &json!({
                "port": key,
                "exists": exists,
                "timestamp": pier_trust::now_millis(),
            }),
        );
    }

    fn on_admin_status(&self, socket_id: &str) {
        let status = match self.registry.membership(socket_id) {
            Some(Membership {
                tenant,
                role: Role::Admin(_),
                ..
            }) => json!({
                "connected": true,
                "port": tenant,
                "adminsCount": self.registry.admin_sockets(&tenant).len(),
                "clientsCount": self.registry.client_sockets(&tenant).len(),
            }),
            _ => json!({ "connected": false }),
        };
        self.emit(socket_id, "admin:status", &status);
    }

    fn on_client_status(&self, socket_id: &str) {
        let status = match self.registry.membership(socket_id) {
            Some(Membership {
                tenant,
                role: Role::Client(phone),
                ..
            }) => json!({ "connected": true, "port": tenant, "customerPhone": phone }),
            _ => json!({ "connected": false }),
        };
        self.emit(socket_id, "client:status", &status);
    }

    /// Queues one frame for `socket_id`. False when the socket is gone.
    pub fn emit(&self, socket_id: &str, event: &str, data: &Value) -> bool {
        let Some(outbox) = self.outboxes.get(socket_id) else {
            return false;
        };
        let frame = match serde_json::to_string(&OutboundFrame { event, data }) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event, error = %err, "failed to encode realtime frame");
                return false;
            }
        };
        outbox.send(frame).is_ok()
    }

    /// Fans out to every admin socket of `tenant`; returns how many were reached.
    pub fn send_to_admins(&self, tenant: &TenantKey, event: &str, data: &Value) -> usize {
        let delivered = self
            .registry
            .admin_sockets(tenant)
            .iter()
            .filter(|socket_id| self.emit(socket_id, event, data))
            .count();
        self.record_delivery(event, delivered);
        debug!(tenant = %tenant, event, delivered, "sent to admins");
        delivered
    }

    /// Unicasts to the live socket of one client. Nothing is queued when the
    /// client is offline.
    pub fn send_to_client(&self, tenant: &TenantKey, phone: &str, event: &str, data: &Value) -> bool {
        let delivered = self
            .registry
            .client_socket(tenant, phone)
            .is_some_and(|socket_id| self.emit(&socket_id, event, data));
        if delivered {
            self.record_delivery(event, 1);
        } else {
            info!(tenant = %tenant, phone, event, "client offline; event dropped");
        }
        delivered
    }

    pub fn broadcast_to_tenant(&self, tenant: &TenantKey, event: &str, data: &Value) -> usize {
        let mut sockets = self.registry.admin_sockets(tenant);
        sockets.extend(self.registry.client_sockets(tenant));
        let delivered = sockets
            .iter()
            .filter(|socket_id| self.emit(socket_id, event, data))
            .count();
        self.record_delivery(event, delivered);
        delivered
    }

    fn record_delivery(&self, event: &str, delivered: usize) {
        if delivered > 0 {
            counter!("pier_gateway_events_delivered_total", "event" => event.to_string())
                .increment(delivered as u64);
        }
    }

    /// Periodically drops idle, empty tenant buckets from the registry.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration, idle: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.registry.clean_inactive(idle);
            }
        })
    }
}

/// Drives one upgraded websocket until it closes.
pub async fn serve_socket(gateway: Arc<RealtimeGateway>, socket: WebSocket) {
    let socket_id = Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut outbox = gateway.attach(&socket_id);
    info!(socket_id = %socket_id, "realtime socket connected");

    let writer_socket = socket_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            if ws_tx.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        debug!(socket_id = %writer_socket, "writer task finished");
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => gateway.handle_frame(&socket_id, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(socket_id = %socket_id, error = %err, "websocket read failed");
                break;
            }
        }
    }

    gateway.detach(&socket_id);
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        registry::InMemoryRegistry,
        store::{tenant, MemoryTenantStore},
    };

    fn gateway() -> RealtimeGateway {
        let store =
            MemoryTenantStore::with_tenants([tenant(1001, "acme"), tenant(2002, "beta")]).unwrap();
        RealtimeGateway::new(
            Arc::new(InMemoryRegistry::new()),
            RegistrationTokens::new("realtime-secret"),
            Arc::new(store),
        )
    }

    fn frame(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
        serde_json::from_str(&rx.try_recv().expect("frame queued")).unwrap()
    }

    async fn register_admin(gateway: &RealtimeGateway, socket: &str, port: u16) {
        let token = gateway
            .tokens()
            .issue_admin(&TenantKey::from(port), &format!("{socket}@ops.test"))
            .unwrap();
        let text = json!({ "event": "admin:register", "data": { "token": token } }).to_string();
        gateway.handle_frame(socket, &text).await;
    }

    #[test_timeout::tokio_timeout_test]
    async fn admin_registration_acks_success() {
        let gateway = gateway();
        let mut rx = gateway.attach("a1");
        register_admin(&gateway, "a1", 1001).await;

        let ack = frame(&mut rx);
        assert_eq!(ack["event"], "admin:register:success");
        assert_eq!(ack["data"]["port"], "1001");
        assert_eq!(ack["data"]["email"], "a1@ops.test");
    }

    #[test_timeout::tokio_timeout_test]
    async fn bad_token_acks_error_without_registering() {
        let gateway = gateway();
        let mut rx = gateway.attach("a1");
        gateway
            .handle_frame("a1", r#"{"event":"admin:register","data":{"token":"nope"}}"#)
            .await;

        let ack = frame(&mut rx);
        assert_eq!(ack["event"], "admin:register:error");
        assert_eq!(ack["data"]["message"], "invalid or expired token");
        assert!(gateway.registry().membership("a1").is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn client_token_cannot_register_admin() {
        let gateway = gateway();
        let mut rx = gateway.attach("c1");
        let token = gateway
            .tokens()
            .issue_client(&TenantKey::from(1001), "+15550001")
            .unwrap();
        let err = gateway
            .register("c1", RegisterAs::Admin, &token)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::Token(TokenError::MissingIdentity("email"))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_tenant_is_rejected() {
        let gateway = gateway();
        let token = gateway
            .tokens()
            .issue_admin(&TenantKey::from(3003), "ops@ghost.test")
            .unwrap();
        let err = gateway
            .register("a1", RegisterAs::Admin, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrationError::UnknownTenant(_)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn admin_fan_out_stays_inside_tenant() {
        let gateway = gateway();
        let mut a1 = gateway.attach("a1");
        let mut a2 = gateway.attach("a2");
        let mut b1 = gateway.attach("b1");
        register_admin(&gateway, "a1", 1001).await;
        register_admin(&gateway, "a2", 1001).await;
        register_admin(&gateway, "b1", 2002).await;
        for rx in [&mut a1, &mut a2, &mut b1] {
            frame(rx);
        }

        let delivered =
            gateway.send_to_admins(&TenantKey::from(1001), EVENT_NEW_TICKET, &json!({ "id": 7 }));
        assert_eq!(delivered, 2);
        for rx in [&mut a1, &mut a2] {
            let received = frame(rx);
            assert_eq!(received["event"], EVENT_NEW_TICKET);
            assert_eq!(received["data"]["id"], 7);
        }
        assert!(b1.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn client_unicast_reaches_latest_socket_only() {
        let gateway = gateway();
        let mut old = gateway.attach("c-old");
        let mut new = gateway.attach("c-new");
        let token = gateway
            .tokens()
            .issue_client(&TenantKey::from(1001), "+15550001")
            .unwrap();
        gateway.register("c-old", RegisterAs::Client, &token).await.unwrap();
        gateway.register("c-new", RegisterAs::Client, &token).await.unwrap();

        assert!(gateway.send_to_client(
            &TenantKey::from(1001),
            "+15550001",
            EVENT_CLIENT_STATUS_UPDATE,
            &json!({ "status": "closed" })
        ));
        assert_eq!(frame(&mut new)["data"]["status"], "closed");
        assert!(old.try_recv().is_err());
        assert!(!gateway.send_to_client(
            &TenantKey::from(1001),
            "+15559999",
            EVENT_CLIENT_STATUS_UPDATE,
            &json!({})
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn detach_always_clears_registry() {
        let gateway = gateway();
        let _rx = gateway.attach("a1");
        register_admin(&gateway, "a1", 1001).await;
        gateway.detach("a1");
        gateway.detach("a1");
        gateway.detach("never-attached");
        assert!(gateway.registry().list_all().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn status_and_ping_replies() {
        let gateway = gateway();
        let mut rx = gateway.attach("a1");
        register_admin(&gateway, "a1", 1001).await;
        frame(&mut rx);

        gateway
            .handle_frame("a1", r#"{"event":"admin:get-status"}"#)
            .await;
        let status = frame(&mut rx);
        assert_eq!(status["event"], "admin:status");
        assert_eq!(status["data"]["connected"], true);
        assert_eq!(status["data"]["adminsCount"], 1);
        assert_eq!(status["data"]["clientsCount"], 0);

        gateway
            .handle_frame("a1", r#"{"event":"client:get-status"}"#)
            .await;
        assert_eq!(frame(&mut rx)["data"]["connected"], false);

        gateway
            .handle_frame("a1", r#"{"event":"tenant:ping","data":{"port":2002}}"#)
            .await;
        let pong = frame(&mut rx);
        assert_eq!(pong["event"], "tenant:pong");
        assert_eq!(pong["data"]["port"], "2002");
        assert_eq!(pong["data"]["exists"], true);
    }

    #[test_timeout::tokio_timeout_test]
    async fn broadcast_reaches_admins_and_clients() {
        let gateway = gateway();
        let mut admin = gateway.attach("a1");
        let mut client = gateway.attach("c1");
        register_admin(&gateway, "a1", 1001).await;
        frame(&mut admin);
        let token = gateway
            .tokens()
            .issue_client(&TenantKey::from(1001), "+15550001")
            .unwrap();
        gateway.register("c1", RegisterAs::Client, &token).await.unwrap();

        let delivered =
            gateway.broadcast_to_tenant(&TenantKey::from(1001), "tenant:notice", &json!({}));
        assert_eq!(delivered, 2);
        assert_eq!(frame(&mut admin)["event"], "tenant:notice");
        assert_eq!(frame(&mut client)["event"], "tenant:notice");
    }
}

#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use chrono::Utc;
use clap::Parser;
use futures_util::StreamExt;
use pier::{
    config::{Cli, PierConfig},
    state::AppState,
    store::{MemoryTenantStore, Tenant, TenantStore},
};
use serde_json::Value;
use tempfile::TempDir;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const REALTIME_SECRET: &str = "realtime-test-secret";

pub struct Harness {
    pub addr: SocketAddr,
    pub state: AppState,
    pub sites: TempDir,
    pub workdir: TempDir,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<anyhow::Result<()>>,
}

pub fn tenant(port: u16, name: &str) -> Tenant {
    Tenant {
        id: format!("tenant-{port}"),
        name: name.to_string(),
        domain: format!("{name}.localhost"),
        port,
        secret: format!("secret-{port}"),
        created_at: Utc::now(),
    }
}

impl Harness {
    pub async fn start(tenants: Vec<Tenant>, extra: &[&str]) -> Self {
        let sites = tempfile::tempdir().unwrap();
        let workdir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let listen = addr.to_string();
        let sites_path = sites.path().to_string_lossy().into_owned();
        let workdir_path = workdir.path().to_string_lossy().into_owned();
        let mut args = vec![
            "pier",
            "--listen-addr",
            listen.as_str(),
            "--proxy-sites-dir",
            sites_path.as_str(),
            "--proxy-reload-command",
            "",
            "--tenant-workdir",
            workdir_path.as_str(),
            "--realtime-token-secret",
            REALTIME_SECRET,
        ];
        args.extend_from_slice(extra);
        let config = PierConfig::try_from(Cli::try_parse_from(args).unwrap()).unwrap();

        let store: Arc<dyn TenantStore> =
            Arc::new(MemoryTenantStore::with_tenants(tenants).unwrap());
        let state = AppState::new(&config, store, None);

        let (shutdown, signal) = oneshot::channel::<()>();
        let server = tokio::spawn({
            let state = state.clone();
            async move {
                pier::serve(listener, state, &config, async {
                    let _ = signal.await;
                })
                .await
            }
        });

        Self {
            addr,
            state,
            sites,
            workdir,
            shutdown: Some(shutdown),
            server,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn connect(&self) -> Socket {
        let (socket, _) = connect_async(format!("ws://{}/ws", self.addr))
            .await
            .unwrap();
        socket
    }

    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.server.await.unwrap().unwrap();
    }
}

/// Reads frames until one named `event` arrives and returns its data.
pub async fn next_event(socket: &mut Socket, event: &str) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap_or_else(|_| panic!("no {event} frame within 5s"))
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            if frame["event"] == event {
                return frame["data"].clone();
            }
        }
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..40 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

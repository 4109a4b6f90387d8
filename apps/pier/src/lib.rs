pub mod config;
pub mod gateway;
pub mod monitor;
pub mod ports;
pub mod provision;
pub mod proxy;
pub mod registry;
pub mod routes;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod tokens;
pub mod trust;

use std::{future::Future, sync::Arc};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, signal};
use tracing::info;

use crate::{
    config::PierConfig,
    monitor::{Fleet, ResourceMonitor, SysinfoSampler},
    routes::build_router,
    state::AppState,
    store::{MemoryTenantStore, TenantStore},
};

/// Loads tenants, binds the listener and serves until ctrl-c.
pub async fn run(config: PierConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let store: Arc<dyn TenantStore> = match &config.tenant_seed {
        Some(path) => {
            let store = MemoryTenantStore::from_seed_file(path)
                .await
                .with_context(|| format!("failed to load tenant seed {}", path.display()))?;
            Arc::new(store)
        }
        None => Arc::new(MemoryTenantStore::new()),
    };
    let state = AppState::new(&config, store, metrics);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!(listen_addr = %config.listen_addr, "pier listening");

    serve(listener, state, &config, shutdown_signal()).await
}

/// Serves `state` on `listener` with the background monitor and sweeper
/// running. Once `shutdown` resolves, every tenant process is stopped.
pub async fn serve<F>(
    listener: TcpListener,
    state: AppState,
    config: &PierConfig,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let fleet: Arc<dyn Fleet> = Arc::new(state.supervisor.clone());
    let monitor = Arc::new(ResourceMonitor::new(
        fleet,
        Arc::new(SysinfoSampler::default()),
        config.monitor(),
    ))
    .spawn();
    let sweeper = Arc::clone(&state.gateway).spawn_sweeper(config.sweep_interval, config.idle_threshold);

    let router = build_router(state.clone());
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error");

    monitor.abort();
    sweeper.abort();
    let stopped = state.supervisor.stop_all().await;
    info!(stopped, "graceful shutdown complete");

    served
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tracing::warn;

use crate::{
    config::PierConfig,
    gateway::RealtimeGateway,
    provision::Provisioner,
    proxy::ReverseProxyConfigurator,
    registry::{ConnectionRegistry, InMemoryRegistry},
    store::TenantStore,
    supervisor::ProcessSupervisor,
    tokens::RegistrationTokens,
    trust::TrustBoundary,
};

/// Everything request handlers and background tasks share.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TenantStore>,
    pub supervisor: ProcessSupervisor,
    pub provisioner: Arc<Provisioner>,
    pub trust: Arc<TrustBoundary>,
    pub gateway: Arc<RealtimeGateway>,
    operator_token: Option<Arc<str>>,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        config: &PierConfig,
        store: Arc<dyn TenantStore>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let supervisor = ProcessSupervisor::new(config.supervisor(), Arc::clone(&store));
        let proxy = ReverseProxyConfigurator::new(config.proxy());
        let provisioner = Provisioner::new(
            Arc::clone(&store),
            proxy,
            supervisor.clone(),
            config.domain_suffix.clone(),
        );
        let trust = TrustBoundary::new(Arc::clone(&store), config.replay_window);

        let token_secret = config.realtime_token_secret.clone().unwrap_or_else(|| {
            warn!("PIER_REALTIME_TOKEN_SECRET unset; realtime tokens only valid for this run");
            pier_trust::generate_secret()
        });
        let registry: Arc<dyn ConnectionRegistry> = Arc::new(InMemoryRegistry::new());
        let gateway = RealtimeGateway::new(
            registry,
            RegistrationTokens::new(&token_secret),
            Arc::clone(&store),
        );

        Self {
            store,
            supervisor,
            provisioner: Arc::new(provisioner),
            trust: Arc::new(trust),
            gateway: Arc::new(gateway),
            operator_token: config.operator_token.as_deref().map(Arc::from),
            metrics,
        }
    }

    pub fn operator_token(&self) -> Option<&str> {
        self.operator_token.as_deref()
    }

    pub fn render_metrics(&self) -> String {
        self.metrics
            .as_ref()
            .map(PrometheusHandle::render)
            .unwrap_or_default()
    }
}

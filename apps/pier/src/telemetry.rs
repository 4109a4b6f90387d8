use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{
    Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder,
};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const OTEL_STDOUT_ENV: &str = "PIER_OTEL_STDOUT";

const TICK_DURATION_METRIC: &str = "pier_monitor_tick_duration_ms";
// A tick is one sampling pass plus any restarts it triggers.
const TICK_BUCKETS_MS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// Process-wide logging, tracing and metrics. Dropping it flushes spans.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let recorder = prometheus_recorder()?;
        let metrics_handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|_| anyhow::anyhow!("a global metrics recorder is already installed"))?;
        describe_metrics();

        let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let tracer_provider = if env_truthy(OTEL_STDOUT_ENV) {
            let provider = SdkTracerProvider::builder()
                .with_simple_exporter(SpanExporter::default())
                .with_sampler(Sampler::AlwaysOn)
                .with_resource(
                    Resource::builder()
                        .with_attributes(vec![KeyValue::new("service.name", "pier")])
                        .build(),
                )
                .build();
            let tracer = provider.tracer("pier");
            global::set_tracer_provider(provider.clone());
            tracing_subscriber::registry()
                .with(filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
            Some(provider)
        } else {
            tracing_subscriber::registry()
                .with(filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
            None
        };

        if tracer_provider.is_some() {
            info!("OpenTelemetry stdout exporter enabled ({OTEL_STDOUT_ENV}=1)");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

/// Prometheus recorder with millisecond buckets for the monitor tick histogram.
pub fn prometheus_recorder() -> Result<PrometheusRecorder> {
    let recorder = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(TICK_DURATION_METRIC.to_string()), TICK_BUCKETS_MS)
        .context("invalid histogram buckets")?
        .build_recorder();
    Ok(recorder)
}

/// Registers HELP text and units against whichever recorder is current.
pub fn describe_metrics() {
    describe_gauge!(
        "pier_tenant_processes_running",
        Unit::Count,
        "Tenant processes currently running"
    );
    describe_counter!(
        "pier_tenant_starts_total",
        Unit::Count,
        "Tenant process start attempts by outcome"
    );
    describe_counter!(
        "pier_tenant_stops_total",
        Unit::Count,
        "Tenant process stops by outcome"
    );
    describe_counter!(
        "pier_monitor_restarts_total",
        Unit::Count,
        "Restarts issued by the resource monitor for CPU overuse"
    );
    describe_histogram!(
        TICK_DURATION_METRIC,
        Unit::Milliseconds,
        "Duration of one resource monitor tick"
    );
    describe_counter!(
        "pier_trust_rejections_total",
        Unit::Count,
        "Signed tenant calls rejected by reason"
    );
    describe_gauge!(
        "pier_gateway_connections_active",
        Unit::Count,
        "Open realtime websocket connections"
    );
    describe_counter!(
        "pier_gateway_registrations_total",
        Unit::Count,
        "Realtime registrations by role and outcome"
    );
    describe_counter!(
        "pier_gateway_events_delivered_total",
        Unit::Count,
        "Realtime events delivered to sockets by event name"
    );
    describe_counter!(
        "pier_proxy_reloads_total",
        Unit::Count,
        "Reverse proxy reloads by outcome"
    );
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shut down OpenTelemetry tracer provider");
            }
        }
    }
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|val| {
            matches!(
                val.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::{counter, histogram};

    #[test_timeout::timeout]
    fn tick_histogram_uses_millisecond_buckets() {
        let recorder = prometheus_recorder().unwrap();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            describe_metrics();
            histogram!(TICK_DURATION_METRIC).record(3.0);
            counter!("pier_proxy_reloads_total", "outcome" => "success").increment(1);
        });

        let rendered = handle.render();
        assert!(rendered.contains("# HELP pier_monitor_tick_duration_ms"));
        assert!(rendered.contains("# TYPE pier_monitor_tick_duration_ms histogram"));
        assert!(rendered.contains("pier_monitor_tick_duration_ms_bucket{le=\"1\"} 0"));
        assert!(rendered.contains("pier_monitor_tick_duration_ms_bucket{le=\"5\"} 1"));
        assert!(rendered.contains("# HELP pier_proxy_reloads_total Reverse proxy reloads by outcome"));
    }
}

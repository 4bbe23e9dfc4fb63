use std::borrow::Cow;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

/// Flushes buffered spans when dropped.
///
/// Owns its handle to the SDK provider, so shutdown works even if some
/// other component replaced the global provider in the meantime.
pub struct OtelGuard {
    provider: opentelemetry_sdk::trace::TracerProvider,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        let _ = self.provider.shutdown();
    }
}

/// Feeds every ERROR event into the `tracing_error_events` counter so
/// alerting can key off a single series instead of scraping log lines.
struct ErrorCounterLayer;

impl<S> Layer<S> for ErrorCounterLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::ERROR {
            metrics::counter!("tracing_error_events").increment(1);
        }
    }
}

/// OTLP span export, enabled only when `OTEL_EXPORTER_OTLP_ENDPOINT` is
/// set. Any setup failure degrades to logs + metrics: returns None, and
/// the caller composes without the layer.
fn otel_layer<S>(service_name: &str) -> Option<(impl Layer<S>, OtelGuard)>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    use opentelemetry_otlp::WithExportConfig;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .ok()?;

    // Batch export needs a Tokio runtime; the binary is `#[tokio::main]`.
    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(Resource::new(vec![KeyValue::new(
            "service.name",
            service_name.to_string(),
        )]))
        .build();
    let tracer = provider.tracer("trust_engine");
    let _ = opentelemetry::global::set_tracer_provider(provider.clone());

    Some((
        tracing_opentelemetry::layer().with_tracer(tracer),
        OtelGuard { provider },
    ))
}

/// Assemble the process-wide `tracing` dispatcher:
/// - JSON lines to stdout
/// - `RUST_LOG` filtering, falling back to `default_level`
/// - an ERROR-event counter for alerting
/// - optional OTLP span export (see [`otel_layer`])
///
/// Returns the dispatcher plus the flush guard when export is active;
/// keep the guard alive for the life of the process.
pub fn build_dispatch(
    service_name: impl Into<Cow<'static, str>>,
    default_level: &str,
) -> (tracing::Dispatch, Option<OtelGuard>) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .json();

    let service_name = service_name.into();
    let (export, guard) = match otel_layer(&service_name) {
        Some((layer, guard)) => (Some(layer), Some(guard)),
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(ErrorCounterLayer)
        .with(export);
    (tracing::Dispatch::new(subscriber), guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_dispatch_without_otlp() {
        // No OTEL endpoint in the test environment: no guard expected.
        let (dispatch, guard) = build_dispatch("trust_engine_test", "info");
        assert!(guard.is_none());
        // The dispatch is usable as a scoped default.
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::info!("dispatch works");
        });
    }
}

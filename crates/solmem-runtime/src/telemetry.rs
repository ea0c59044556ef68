//! Tracing initialisation for the `solmem` driver.
//!
//! Call [`init_tracing`] once at process startup. Spans opened by the
//! orchestrator (`tick`, `stage`) and the per-photo fan-out are exported over
//! OTLP when a collector is configured.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP collector base URL (e.g. `http://localhost:4318`). When set the OTLP HTTP exporter is activated. |
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `SOLMEM_LOG_FORMAT=json` | Emit newline-delimited JSON logs. |
//!
//! # Example
//!
//! ```rust,no_run
//! let _guard = solmem_runtime::telemetry::init_tracing("solmem");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Console output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    /// Interpret a `SOLMEM_LOG_FORMAT` value; anything but `json` is compact.
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

/// Initialise the global `tracing` subscriber with an optional OTLP exporter.
///
/// The returned [`TracerProviderGuard`] must be held for the lifetime of the
/// process; dropping it flushes pending spans.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format =
        LogFormat::from_env_value(std::env::var("SOLMEM_LOG_FORMAT").ok().as_deref());

    let provider = build_provider(service_name);
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("solmem")));

    // Option<Layer> is itself a layer, so exactly one formatter is active.
    tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with((format == LogFormat::Json).then(|| tracing_subscriber::fmt::layer().json()))
        .with((format == LogFormat::Compact).then(|| tracing_subscriber::fmt::layer().compact()))
        .init();

    TracerProviderGuard(provider)
}

/// RAII guard that shuts down the OTel [`SdkTracerProvider`] on drop.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("[solmem] OpenTelemetry provider shutdown error: {e}");
            }
        }
    }
}

/// Build an [`SdkTracerProvider`] when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
fn build_provider(service_name: &str) -> Option<SdkTracerProvider> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[solmem] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            // Tracing is initialised before the Tokio runtime exists, so the
            // exporter must not spawn tasks.
            .with_simple_exporter(exporter)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parsing() {
        assert_eq!(LogFormat::from_env_value(None), LogFormat::Compact);
        assert_eq!(LogFormat::from_env_value(Some("JSON")), LogFormat::Json);
        assert_eq!(LogFormat::from_env_value(Some(" json ")), LogFormat::Json);
        assert_eq!(LogFormat::from_env_value(Some("pretty")), LogFormat::Compact);
    }

    #[test]
    fn build_provider_returns_none_without_endpoint() {
        // SAFETY: no other test in this crate reads this variable.
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
        assert!(build_provider("solmem-test").is_none());
    }

    #[test]
    fn empty_guard_drops_cleanly() {
        drop(TracerProviderGuard(None));
    }
}

use std::io::IsTerminal;

use anyhow::Context as _;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::Sampler;
use serde::Deserialize;
use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{DefaultFields, Format, Full, Json, JsonFields};
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

/// Config for [`init_tracing`], loaded as part of `FisoConfig.observability`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: Option<String>,
    pub json_logs: bool,
    pub otel_endpoint: Option<String>,
    pub service_name: Option<String>,
}

/// Keeps the non-blocking log writer and (if otel is enabled) the tracer
/// provider alive for the life of the process. Dropping this shuts logging
/// down cleanly.
pub struct FlushGuard {
    _writer: tracing_appender::non_blocking::WorkerGuard,
    _tracer_provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

/// Helper so we can pick plain-text or JSON event formatting without boxing
/// a `dyn FormatEvent`.
enum JsonOrPlain {
    Plain(Format<Full>),
    Json(Format<Json>),
}

impl<S, N> FormatEvent<S, N> for JsonOrPlain
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'w> tracing_subscriber::fmt::FormatFields<'w> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        match self {
            JsonOrPlain::Plain(f) => f.format_event(ctx, writer, event),
            JsonOrPlain::Json(f) => f.format_event(ctx, writer, event),
        }
    }
}

/// Configures the process-global `tracing` subscriber: an `EnvFilter` level
/// gate, a stderr fmt layer (plain or JSON), and, if `otel_endpoint` is
/// configured, an OpenTelemetry tracing layer exporting spans over
/// OTLP/gRPC. May only be called once per process.
pub fn init_tracing(cfg: &ObservabilityConfig) -> anyhow::Result<FlushGuard> {
    let filter = match &cfg.log_level {
        Some(level) => EnvFilter::try_new(level).context("invalid log_level directive")?,
        None => EnvFilter::default().add_directive(LevelFilter::INFO.into()),
    };

    let stderr = std::io::stderr();
    let ansi = stderr.is_terminal();
    let (writer, guard) = tracing_appender::non_blocking(stderr);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi);
    let fmt_layer = if cfg.json_logs {
        fmt_layer
            .event_format(JsonOrPlain::Json(Format::default().json()))
            .fmt_fields(JsonFields::new())
            .boxed()
    } else {
        fmt_layer
            .event_format(JsonOrPlain::Plain(Format::default()))
            .fmt_fields(DefaultFields::new())
            .boxed()
    };

    let (otel_layer, tracer_provider) = match &cfg.otel_endpoint {
        Some(endpoint) => {
            let service_name = cfg.service_name.clone().unwrap_or_else(|| "fiso".to_string());
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint.clone())
                .build()
                .context("failed to build OTLP span exporter")?;
            let processor = opentelemetry_sdk::trace::span_processor_with_async_runtime::BatchSpanProcessor::builder(
                exporter,
                opentelemetry_sdk::runtime::Tokio,
            )
            .build();
            let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::AlwaysOn)))
                .with_resource(
                    opentelemetry_sdk::Resource::builder_empty()
                        .with_attribute(opentelemetry::KeyValue::new("service.name", service_name))
                        .build(),
                )
                .with_span_processor(processor)
                .build();
            let tracer = provider.tracer("fiso");
            (
                Some(tracing_opentelemetry::layer().with_tracer(tracer)),
                Some(provider),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .context("tracing subscriber already initialized")?;

    Ok(FlushGuard {
        _writer: guard,
        _tracer_provider: tracer_provider,
    })
}

//! Observability glue for fiso: logging/tracing provider init, W3C trace
//! context propagation over a plain string map, and a process metrics
//! registry. No component in the pipeline/source/sink/transform core
//! depends on this crate beyond the `carrier` module — the core only talks
//! to the `tracing` facade; wiring a concrete subscriber is the binary's job.

pub mod carrier;
pub mod logging;
pub mod metrics_init;

pub use carrier::{attach_span_context, TraceContextExtractor, TraceContextInjector};
pub use logging::{init_tracing, FlushGuard, ObservabilityConfig};
pub use metrics_init::init_metrics;

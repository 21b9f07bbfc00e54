//! A string-map carrier for W3C Trace Context (`traceparent`/`tracestate`),
//! used to extract ingress trace context from event headers and inject
//! egress trace context into sink-layer headers/metadata.

use std::collections::BTreeMap;
use std::ops::Deref;

use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::TraceContextExt;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing::span::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Wraps a header map and implements [`Extractor`] so `traceparent`/
/// `tracestate` can be pulled off an inbound [`fiso_core::Event`].
#[derive(Debug)]
pub struct TraceContextExtractor<'a> {
    inner: &'a BTreeMap<String, String>,
}

impl<'a> TraceContextExtractor<'a> {
    pub fn new(headers: &'a BTreeMap<String, String>) -> Self {
        Self { inner: headers }
    }
}

impl Extractor for TraceContextExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.inner
            .iter()
            .find_map(|(k, v)| k.eq_ignore_ascii_case(key).then_some(v.as_str()))
    }

    fn keys(&self) -> Vec<&str> {
        self.inner.keys().map(String::as_str).collect()
    }
}

/// Wraps an owned header map and implements [`Injector`] so the current
/// span's context can be written into outbound headers/metadata.
#[derive(Clone, Debug, Default)]
pub struct TraceContextInjector {
    inner: BTreeMap<String, String>,
}

impl TraceContextInjector {
    pub fn new(headers: BTreeMap<String, String>) -> Self {
        Self { inner: headers }
    }

    /// Returns a new injector seeded from `headers`, extracts any trace
    /// context already present, attaches it to the current span, then
    /// injects the (possibly new) current span context back in. This is
    /// the egress path used by sinks: carry forward whatever was on
    /// ingress, layered under the sink-call span.
    pub fn new_with_extracted(headers: &BTreeMap<String, String>) -> Self {
        attach_span_context(headers);
        let mut injector = Self::new(headers.clone());
        injector.inject_context();
        injector
    }

    /// Injects the current span's context into the headers.
    pub fn inject_context(&mut self) {
        let propagator = TraceContextPropagator::new();
        propagator.inject_context(&Span::current().context(), self);
    }

    pub fn into_headers(self) -> BTreeMap<String, String> {
        self.inner
    }
}

impl Injector for TraceContextInjector {
    fn set(&mut self, key: &str, value: String) {
        self.inner.insert(key.to_owned(), value);
    }
}

impl Deref for TraceContextInjector {
    type Target = BTreeMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Extracts a trace context from `headers` and sets it as the parent of the
/// current tracing span. A no-op (not an error) if `headers` carries no
/// valid `traceparent`.
pub fn attach_span_context(headers: &BTreeMap<String, String>) {
    let propagator = TraceContextPropagator::new();
    let extractor = TraceContextExtractor::new(headers);
    let parent_ctx = propagator.extract(&extractor);
    if parent_ctx.span().span_context().is_valid() {
        Span::current().set_parent(parent_ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_trace_id() {
        let mut headers = BTreeMap::new();
        headers.insert(
            "traceparent".to_string(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
        );
        let injector = TraceContextInjector::new_with_extracted(&headers);
        let out = injector.into_headers();
        let tp = out.get("traceparent").expect("traceparent present");
        assert!(tp.contains("4bf92f3577b34da6a3ce929d0e0e4736"));
    }

    #[test]
    fn extractor_lookup_is_case_insensitive() {
        let mut headers = BTreeMap::new();
        headers.insert("TraceParent".to_string(), "00-x-y-01".to_string());
        let extractor = TraceContextExtractor::new(&headers);
        assert_eq!(extractor.get("traceparent"), Some("00-x-y-01"));
    }
}

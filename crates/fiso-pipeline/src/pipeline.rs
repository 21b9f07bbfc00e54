use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use fiso_core::correlation::HDR_FISO_CORRELATION_ID;
use fiso_core::source::Source;
use fiso_core::{derive_correlation_id, CloudEvent, ErrorHandling, Event, EventHandler, FisoError, FisoResult, FlowDefinition, Sink};
use fiso_dlq::DeadLetterHandler;
use fiso_transform::Transformer;
use fiso_tracing::carrier::{attach_span_context, TraceContextInjector};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;

use crate::backoff::delays;

/// Wires one flow's source, optional transform, and sink together (§4.1).
/// `run` consumes the pipeline and blocks for the flow's lifetime.
pub struct Pipeline {
    flow: FlowDefinition,
    source: Box<dyn Source>,
    transformer: Option<Arc<dyn Transformer>>,
    sink: Arc<dyn Sink>,
    dlq: Option<Arc<DeadLetterHandler>>,
}

impl Pipeline {
    pub fn new(
        flow: FlowDefinition,
        source: Box<dyn Source>,
        transformer: Option<Arc<dyn Transformer>>,
        sink: Arc<dyn Sink>,
        dlq: Option<Arc<DeadLetterHandler>>,
    ) -> Self {
        Self {
            flow,
            source,
            transformer,
            sink,
            dlq,
        }
    }

    /// Starts the source with a handler that implements the per-event
    /// pipeline algorithm, and blocks until the source drains and returns
    /// (§4.1, §5 cancellation).
    pub async fn run(mut self, cancel: CancellationToken) -> FisoResult<()> {
        let handler: Arc<dyn EventHandler> = Arc::new(FlowHandler {
            flow_name: self.flow.name.clone(),
            event_type: self.flow.event_type(),
            transformer: self.transformer.clone(),
            sink: Arc::clone(&self.sink),
            dlq: self.dlq.clone(),
            error_handling: self.flow.error_handling.clone(),
            cancel: cancel.clone(),
        });
        self.source.run(handler, cancel).await
    }
}

struct FlowHandler {
    flow_name: String,
    event_type: String,
    transformer: Option<Arc<dyn Transformer>>,
    sink: Arc<dyn Sink>,
    dlq: Option<Arc<DeadLetterHandler>>,
    error_handling: ErrorHandling,
    cancel: CancellationToken,
}

#[async_trait]
impl EventHandler for FlowHandler {
    #[tracing::instrument(skip_all, fields(flow = %self.flow_name, correlation_id = tracing::field::Empty))]
    async fn handle(&self, event: Event) -> FisoResult<()> {
        let correlation_id = derive_correlation_id(&event.headers);
        tracing::Span::current().record("correlation_id", correlation_id.as_str());
        attach_span_context(&event.headers);

        let data: serde_json::Value = match serde_json::from_slice(&event.value) {
            Ok(data) => data,
            Err(err) => {
                let reason = FisoError::Permanent(format!("malformed payload: {err}"));
                return self
                    .divert_or_fail(&event.value, &event.headers, event.topic.as_deref(), reason, 0)
                    .await;
            }
        };

        let envelope = match CloudEvent::new(&self.flow_name, &self.event_type, &correlation_id, data.clone()) {
            Ok(envelope) => envelope,
            Err(err) => {
                return self
                    .divert_or_fail(&event.value, &event.headers, event.topic.as_deref(), err, 0)
                    .await
            }
        };
        let pre_transform_bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                return self
                    .divert_or_fail(&event.value, &event.headers, event.topic.as_deref(), err, 0)
                    .await
            }
        };

        let final_data = match &self.transformer {
            Some(transformer) => match transformer.apply(data, &event.headers).await {
                Ok(transformed) => transformed,
                Err(err) => {
                    return self
                        .divert_or_fail(&pre_transform_bytes, &event.headers, event.topic.as_deref(), err, 0)
                        .await
                }
            },
            None => envelope.data().cloned().unwrap_or(serde_json::Value::Null),
        };

        let envelope = match envelope.with_data(final_data) {
            Ok(envelope) => envelope,
            Err(err) => {
                return self
                    .divert_or_fail(&pre_transform_bytes, &event.headers, event.topic.as_deref(), err, 0)
                    .await
            }
        };
        let body = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                return self
                    .divert_or_fail(&pre_transform_bytes, &event.headers, event.topic.as_deref(), err, 0)
                    .await
            }
        };

        let mut sink_headers = event.headers.clone();
        sink_headers.insert(HDR_FISO_CORRELATION_ID.to_string(), correlation_id.clone());
        let sink_headers = TraceContextInjector::new_with_extracted(&sink_headers).into_headers();

        let attempts = if self.error_handling.max_retries <= 0 {
            1
        } else {
            self.error_handling.max_retries as usize
        };
        let backoff_delays = delays(
            attempts.saturating_sub(1),
            self.error_handling.initial_interval,
            self.error_handling.max_interval,
        );

        let start = Instant::now();
        let mut last_err = None;
        let mut attempts_made = 0i64;

        for attempt in 0..attempts {
            attempts_made = attempt as i64 + 1;
            match self.sink.deliver(body.clone(), sink_headers.clone()).await {
                Ok(()) => {
                    histogram!("fiso_sink_latency_seconds", "flow" => self.flow_name.clone())
                        .record(start.elapsed().as_secs_f64());
                    counter!("fiso_events_processed_total", "flow" => self.flow_name.clone(), "outcome" => "success")
                        .increment(1);
                    tracing::info!(attempt = attempts_made, "event delivered");
                    return Ok(());
                }
                Err(err) => {
                    let transient = err.is_transient();
                    last_err = Some(err);
                    if !transient || attempt + 1 >= attempts {
                        break;
                    }
                    counter!("fiso_retries_total", "flow" => self.flow_name.clone()).increment(1);
                    tracing::info!(attempt = attempts_made, "sink delivery failed, retrying");
                    if let Some(delay) = backoff_delays.get(attempt) {
                        tokio::select! {
                            _ = self.cancel.cancelled() => return Err(FisoError::Cancelled),
                            _ = tokio::time::sleep(*delay) => {}
                        }
                    }
                }
            }
        }

        histogram!("fiso_sink_latency_seconds", "flow" => self.flow_name.clone()).record(start.elapsed().as_secs_f64());
        let err = last_err.expect("the attempt loop always runs at least once");
        tracing::error!(%err, attempts = attempts_made, "sink delivery failed terminally");
        self.divert_or_fail(&body, &sink_headers, event.topic.as_deref(), err, attempts_made)
            .await
    }
}

impl FlowHandler {
    /// On terminal failure: diverts to the configured DLQ if one is
    /// configured, otherwise returns the error so the source does not
    /// commit (§4.1 commit discipline, §8 "no silent loss on DLQ failure").
    async fn divert_or_fail(
        &self,
        body: &[u8],
        headers: &BTreeMap<String, String>,
        original_topic: Option<&str>,
        err: FisoError,
        retry_count: i64,
    ) -> FisoResult<()> {
        counter!("fiso_events_processed_total", "flow" => self.flow_name.clone(), "outcome" => "failure").increment(1);

        let (Some(dlq), Some(topic)) = (&self.dlq, &self.error_handling.dead_letter_topic) else {
            return Err(err);
        };

        let reason = err.dlq_reason();
        match dlq
            .handle(topic, body.to_vec(), headers, &reason, &self.flow_name, original_topic, retry_count)
            .await
        {
            Ok(()) => {
                counter!("fiso_dlq_sends_total", "flow" => self.flow_name.clone()).increment(1);
                tracing::info!(topic = %topic, %reason, "event diverted to dead-letter topic");
                Ok(())
            }
            Err(dlq_err) => {
                tracing::error!(%dlq_err, "dead-letter publish failed, event will not be committed");
                Err(dlq_err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use fiso_core::{SinkConfig, SourceConfig};
    use tokio::sync::Mutex;

    use super::*;

    /// A source that replays a fixed list of events to the handler, one at
    /// a time, recording whether each call committed (returned `Ok`) before
    /// moving to the next — mirrors the real sources' "commit only after
    /// handler success" contract without needing a transport.
    struct ScriptedSource {
        events: Vec<Event>,
        commits: Arc<Mutex<Vec<bool>>>,
    }

    #[async_trait]
    impl Source for ScriptedSource {
        async fn run(&mut self, handler: Arc<dyn EventHandler>, cancel: CancellationToken) -> FisoResult<()> {
            for event in self.events.drain(..) {
                if cancel.is_cancelled() {
                    break;
                }
                let result = handler.handle(event).await;
                self.commits.lock().await.push(result.is_ok());
                if let Err(FisoError::Cancelled) = result {
                    break;
                }
            }
            Ok(())
        }
    }

    /// A sink whose `deliver` outcome is scripted per call index, so tests
    /// can exercise "fails N times then succeeds" without a real transport.
    struct ScriptedSink {
        outcomes: Mutex<Vec<FisoResult<()>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSink {
        fn new(outcomes: Vec<FisoResult<()>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Sink for ScriptedSink {
        async fn deliver(&self, _body: Vec<u8>, _headers: BTreeMap<String, String>) -> FisoResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().await;
            if outcomes.is_empty() {
                return Ok(());
            }
            outcomes.remove(0)
        }
    }

    fn test_flow(error_handling: ErrorHandling) -> FlowDefinition {
        FlowDefinition {
            name: "orders".to_string(),
            source: SourceConfig::Http {
                addr: "127.0.0.1:0".to_string(),
                path: "/ingest".to_string(),
            },
            transform: None,
            sink: SinkConfig::Http {
                url: "http://example.invalid/sink".to_string(),
                method: "POST".to_string(),
                headers: Vec::new(),
            },
            error_handling,
            event_type: None,
        }
    }

    fn json_event(body: &str) -> Event {
        Event::new(body.as_bytes().to_vec())
    }

    async fn run_pipeline(
        flow: FlowDefinition,
        sink: Arc<ScriptedSink>,
        events: Vec<Event>,
    ) -> Vec<bool> {
        let commits = Arc::new(Mutex::new(Vec::new()));
        let source = Box::new(ScriptedSource {
            events,
            commits: Arc::clone(&commits),
        });
        let pipeline = Pipeline::new(flow, source, None, sink, None);
        pipeline.run(CancellationToken::new()).await.expect("pipeline run");
        Arc::try_unwrap(commits).expect("sole owner").into_inner()
    }

    #[test_log::test(tokio::test)]
    async fn happy_path_delivers_on_first_attempt_and_commits() {
        let sink = Arc::new(ScriptedSink::new(vec![Ok(())]));
        let commits = run_pipeline(
            test_flow(ErrorHandling::default()),
            Arc::clone(&sink),
            vec![json_event(r#"{"order_id": "1"}"#)],
        )
        .await;

        assert_eq!(commits, vec![true]);
        assert_eq!(sink.call_count(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn transient_failure_retries_then_succeeds() {
        let sink = Arc::new(ScriptedSink::new(vec![
            Err(FisoError::Transient("connection reset".into())),
            Err(FisoError::Transient("connection reset".into())),
            Ok(()),
        ]));
        let error_handling = ErrorHandling {
            max_retries: 5,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            ..Default::default()
        };
        let commits = run_pipeline(
            test_flow(error_handling),
            Arc::clone(&sink),
            vec![json_event(r#"{"order_id": "2"}"#)],
        )
        .await;

        assert_eq!(commits, vec![true]);
        assert_eq!(sink.call_count(), 3);
    }

    #[test_log::test(tokio::test)]
    async fn permanent_failure_without_dlq_does_not_commit() {
        let sink = Arc::new(ScriptedSink::new(vec![Err(FisoError::Permanent("400 bad request".into()))]));
        let error_handling = ErrorHandling {
            max_retries: 5,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            ..Default::default()
        };
        let commits = run_pipeline(
            test_flow(error_handling),
            Arc::clone(&sink),
            vec![json_event(r#"{"order_id": "3"}"#)],
        )
        .await;

        // A permanent error never retries, even with budget left.
        assert_eq!(commits, vec![false]);
        assert_eq!(sink.call_count(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn exhausted_retries_without_dlq_does_not_commit() {
        let sink = Arc::new(ScriptedSink::new(vec![
            Err(FisoError::Transient("timeout".into())),
            Err(FisoError::Transient("timeout".into())),
            Err(FisoError::Transient("timeout".into())),
        ]));
        let error_handling = ErrorHandling {
            max_retries: 3,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            ..Default::default()
        };
        let commits = run_pipeline(
            test_flow(error_handling),
            Arc::clone(&sink),
            vec![json_event(r#"{"order_id": "4"}"#)],
        )
        .await;

        assert_eq!(commits, vec![false]);
        assert_eq!(sink.call_count(), 3);
    }

    #[test_log::test(tokio::test)]
    async fn malformed_payload_is_a_permanent_failure_before_any_sink_call() {
        let sink = Arc::new(ScriptedSink::new(vec![Ok(())]));
        let commits = run_pipeline(
            test_flow(ErrorHandling::default()),
            Arc::clone(&sink),
            vec![json_event("not json")],
        )
        .await;

        assert_eq!(commits, vec![false]);
        assert_eq!(sink.call_count(), 0, "a malformed payload never reaches the sink");
    }

    #[test_log::test(tokio::test)]
    async fn cancellation_during_backoff_stops_the_retry_loop() {
        let sink = Arc::new(ScriptedSink::new(vec![
            Err(FisoError::Transient("timeout".into())),
            Err(FisoError::Transient("timeout".into())),
        ]));
        let error_handling = ErrorHandling {
            max_retries: 5,
            initial_interval: Duration::from_secs(60),
            max_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let flow = test_flow(error_handling);
        let cancel = CancellationToken::new();
        let handler = Arc::new(FlowHandler {
            flow_name: flow.name.clone(),
            event_type: flow.event_type(),
            transformer: None,
            sink: sink.clone() as Arc<dyn Sink>,
            dlq: None,
            error_handling: flow.error_handling.clone(),
            cancel: cancel.clone(),
        });

        let handle = tokio::spawn(async move { handler.handle(json_event(r#"{"order_id": "5"}"#)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = handle.await.expect("join");
        assert!(matches!(result, Err(FisoError::Cancelled)));
        assert_eq!(sink.call_count(), 1, "cancelled during the first backoff wait");
    }
}

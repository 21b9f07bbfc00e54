use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fiso_core::source::Source;
use fiso_core::{ClusterConfig, Event, EventHandler, FisoError, FisoResult, OffsetReset};
use rskafka::client::partition::{OffsetAt, PartitionClient, UnknownTopicHandling};
use rskafka::client::ClientBuilder;
use tokio_util::sync::CancellationToken;

/// One fetched record, independent of the underlying client library (§9
/// "Dynamic interface abstractions").
pub struct RawRecord {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub offset: i64,
}

/// Injectable consume/commit capability. rskafka implements the wire
/// protocol for fetching records but not the consumer-group coordinator
/// protocol, so there is no broker-side group to rejoin on restart —
/// `commit` here is a local bookkeeping call, not a group commit RPC. Tests
/// substitute a fake; the real binary wires [`RskafkaConsumer`].
#[async_trait]
pub trait LogConsumer: Send + Sync {
    async fn fetch(&self, offset: i64) -> FisoResult<Vec<RawRecord>>;
    async fn commit(&self, offset: i64) -> FisoResult<()>;
    async fn start_offset(&self, reset: OffsetReset) -> FisoResult<i64>;
}

/// A [`LogConsumer`] backed by a single rskafka partition client (always
/// partition 0, matching the producer side in `fiso-publisher-pool`).
pub struct RskafkaConsumer {
    partition_client: PartitionClient,
    committed: AtomicI64,
}

impl RskafkaConsumer {
    pub async fn connect(cfg: &ClusterConfig, topic: &str) -> FisoResult<Self> {
        if cfg.brokers.is_empty() {
            return Err(FisoError::Config(
                "cluster config must list at least one broker".into(),
            ));
        }
        let client = ClientBuilder::new(cfg.brokers.clone())
            .build()
            .await
            .map_err(|err| FisoError::Transient(format!("failed to connect to kafka cluster: {err}")))?;
        let partition_client = client
            .partition_client(topic, 0, UnknownTopicHandling::Error)
            .await
            .map_err(|err| {
                FisoError::Transient(format!("failed to open partition client for {topic}: {err}"))
            })?;
        Ok(Self {
            partition_client,
            committed: AtomicI64::new(0),
        })
    }

    pub fn committed_offset(&self) -> i64 {
        self.committed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogConsumer for RskafkaConsumer {
    async fn fetch(&self, offset: i64) -> FisoResult<Vec<RawRecord>> {
        let (records, _high_watermark) = self
            .partition_client
            .fetch_records(offset, 1..1_000_000, 1_000)
            .await
            .map_err(|err| FisoError::Transient(format!("kafka fetch failed: {err}")))?;
        Ok(records
            .into_iter()
            .map(|r| RawRecord {
                key: r.record.key,
                value: r.record.value.unwrap_or_default(),
                headers: r
                    .record
                    .headers
                    .into_iter()
                    .map(|(k, v)| (k, String::from_utf8_lossy(&v).into_owned()))
                    .collect(),
                offset: r.offset,
            })
            .collect())
    }

    async fn commit(&self, offset: i64) -> FisoResult<()> {
        self.committed.store(offset, Ordering::SeqCst);
        Ok(())
    }

    async fn start_offset(&self, reset: OffsetReset) -> FisoResult<i64> {
        let at = match reset {
            OffsetReset::Earliest => OffsetAt::Earliest,
            OffsetReset::Latest => OffsetAt::Latest,
        };
        self.partition_client
            .get_offset(at)
            .await
            .map_err(|err| FisoError::Transient(format!("kafka offset lookup failed: {err}")))
    }
}

/// The message-log source (§4.2): a long-poll fetch loop over a
/// [`LogConsumer`]. Auto-commit is disabled — a record is only marked for
/// commit once the handler returns successfully, and commits flush after
/// every record rather than batching, trading a little throughput for a
/// simple at-least-once story.
pub struct MessageLogSource {
    consumer: Arc<dyn LogConsumer>,
    topic: String,
    offset_reset: OffsetReset,
    fetch_backoff: Duration,
}

impl MessageLogSource {
    pub fn new(consumer: Arc<dyn LogConsumer>, topic: impl Into<String>, offset_reset: OffsetReset) -> Self {
        Self {
            consumer,
            topic: topic.into(),
            offset_reset,
            fetch_backoff: Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl Source for MessageLogSource {
    async fn run(&mut self, handler: Arc<dyn EventHandler>, cancel: CancellationToken) -> FisoResult<()> {
        let mut offset = self.consumer.start_offset(self.offset_reset).await?;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let records = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = self.consumer.fetch(offset) => result,
            };

            let records = match records {
                Ok(records) => records,
                Err(err) => {
                    tracing::warn!(topic = %self.topic, %err, "message-log fetch failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.fetch_backoff) => {}
                    }
                    continue;
                }
            };

            if records.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.fetch_backoff) => {}
                }
                continue;
            }

            for record in records {
                let event = Event {
                    key: record.key,
                    value: record.value,
                    headers: record.headers,
                    offset: Some(record.offset),
                    topic: Some(self.topic.clone()),
                    correlation_id: String::new(),
                };
                if let Err(err) = handler.handle(event).await {
                    tracing::error!(topic = %self.topic, offset = record.offset, %err, "handler failed for message-log record");
                } else {
                    self.consumer.commit(record.offset + 1).await?;
                    offset = record.offset + 1;
                }
                if cancel.is_cancelled() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeConsumer {
        records: AsyncMutex<Vec<RawRecord>>,
        committed: StdMutex<Option<i64>>,
    }

    #[async_trait]
    impl LogConsumer for FakeConsumer {
        async fn fetch(&self, _offset: i64) -> FisoResult<Vec<RawRecord>> {
            Ok(self.records.lock().await.drain(..).collect())
        }

        async fn commit(&self, offset: i64) -> FisoResult<()> {
            *self.committed.lock().unwrap() = Some(offset);
            Ok(())
        }

        async fn start_offset(&self, _reset: OffsetReset) -> FisoResult<i64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn commits_only_after_successful_handle() {
        let consumer = Arc::new(FakeConsumer {
            records: AsyncMutex::new(vec![RawRecord {
                key: None,
                value: b"payload".to_vec(),
                headers: BTreeMap::new(),
                offset: 41,
            }]),
            committed: StdMutex::new(None),
        });
        let mut source = MessageLogSource::new(Arc::clone(&consumer) as Arc<dyn LogConsumer>, "orders", OffsetReset::Latest);
        source.fetch_backoff = Duration::from_millis(10);

        let cancel = CancellationToken::new();
        let handler_cancel = cancel.clone();
        let handled = Arc::new(AtomicI64::new(0));
        let handled_for_handler = Arc::clone(&handled);
        let handler: Arc<dyn EventHandler> = Arc::new(move |event: Event| {
            handled_for_handler.store(event.offset.unwrap_or(-1), Ordering::SeqCst);
            handler_cancel.cancel();
            Ok(())
        });

        source.run(handler, cancel).await.expect("run");
        assert_eq!(handled.load(Ordering::SeqCst), 41);
        assert_eq!(*consumer.committed.lock().unwrap(), Some(42));
    }
}

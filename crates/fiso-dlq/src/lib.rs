//! The dead-letter handler (§4.5): diverts an event that has exhausted its
//! retry budget (or failed permanently) to a configured topic, with failure
//! metadata attached as headers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fiso_core::{FisoError, FisoResult};
use fiso_publisher_pool::PublisherPool;

/// DLQ publish is retried this many times before giving up (§4.5); backoff
/// between attempts is a short fixed delay rather than exponential — the
/// contract calls it "brief backoff" and doesn't otherwise constrain it.
const MAX_DLQ_RETRIES: u32 = 3;
const DLQ_RETRY_DELAY: Duration = Duration::from_millis(250);

pub const HDR_FAILURE_REASON: &str = "x-failure-reason";
pub const HDR_FAILURE_FLOW: &str = "x-failure-flow";
pub const HDR_ORIGINAL_TOPIC: &str = "x-original-topic";
pub const HDR_RETRY_COUNT: &str = "x-retry-count";

/// Publishes failed events to their flow's configured dead-letter topic.
/// Holds no state of its own beyond the cluster it publishes through;
/// multiple flows share one handler per cluster via the publisher pool.
pub struct DeadLetterHandler {
    pool: Arc<PublisherPool>,
    cluster: String,
}

impl DeadLetterHandler {
    pub fn new(pool: Arc<PublisherPool>, cluster: impl Into<String>) -> Self {
        Self {
            pool,
            cluster: cluster.into(),
        }
    }

    /// Publishes `original_bytes` to `dead_letter_topic` with the original
    /// headers plus failure metadata. Retries up to [`MAX_DLQ_RETRIES`]
    /// times; the last error is returned to the caller so the pipeline
    /// knows not to ack the source event (§4.1 "not acked to the source").
    pub async fn handle(
        &self,
        dead_letter_topic: &str,
        original_bytes: Vec<u8>,
        original_headers: &BTreeMap<String, String>,
        reason: &str,
        flow_name: &str,
        original_topic: Option<&str>,
        retry_count: i64,
    ) -> FisoResult<()> {
        let mut headers = original_headers.clone();
        headers.insert(HDR_FAILURE_REASON.to_string(), reason.to_string());
        headers.insert(HDR_FAILURE_FLOW.to_string(), flow_name.to_string());
        if let Some(topic) = original_topic {
            headers.insert(HDR_ORIGINAL_TOPIC.to_string(), topic.to_string());
        }
        headers.insert(HDR_RETRY_COUNT.to_string(), retry_count.to_string());

        let producer = self.pool.producer(&self.cluster).await?;

        let mut last_err = None;
        for attempt in 0..MAX_DLQ_RETRIES {
            match producer
                .publish(dead_letter_topic, None, original_bytes.clone(), &headers)
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        flow = flow_name,
                        topic = dead_letter_topic,
                        attempt,
                        %err,
                        "dlq publish attempt failed"
                    );
                    last_err = Some(err);
                    if attempt + 1 < MAX_DLQ_RETRIES {
                        tokio::time::sleep(DLQ_RETRY_DELAY).await;
                    }
                }
            }
        }

        let err = last_err.unwrap_or_else(|| FisoError::Transient("dlq publish failed".into()));
        tracing::error!(flow = flow_name, topic = dead_letter_topic, %err, "dlq publish exhausted retries");
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fiso_core::ClusterConfig;

    #[tokio::test]
    async fn unknown_cluster_surfaces_as_config_error_without_retrying() {
        let pool = Arc::new(PublisherPool::new());
        let handler = DeadLetterHandler::new(pool, "missing-cluster");
        let err = handler
            .handle(
                "orders-dlq",
                b"payload".to_vec(),
                &BTreeMap::new(),
                "http status 503",
                "orders",
                Some("orders-in"),
                3,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FisoError::Config(_)));
    }

    #[tokio::test]
    async fn registered_but_unreachable_cluster_exhausts_dlq_retries() {
        let pool = Arc::new(PublisherPool::new());
        pool.register_cluster(
            "primary",
            ClusterConfig {
                brokers: vec!["127.0.0.1:1".to_string()],
                auth: None,
                tls: None,
            },
        )
        .await;
        let handler = DeadLetterHandler::new(pool, "primary");
        let err = handler
            .handle(
                "orders-dlq",
                b"payload".to_vec(),
                &BTreeMap::new(),
                "http status 503",
                "orders",
                Some("orders-in"),
                3,
            )
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::FisoResult;

/// Common capability every sink kind implements (§4.4): HTTP, gRPC,
/// message-log publisher, workflow engine. `deliver` hands the CloudEvent
/// envelope bytes and the event headers (already augmented with
/// `fiso-correlation-id` and injected trace context by the pipeline); the
/// sink's own job is only the wire-protocol mapping and its retry-relevant
/// error classification.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, body: Vec<u8>, headers: BTreeMap<String, String>) -> FisoResult<()>;

    async fn close(&self) -> FisoResult<()> {
        Ok(())
    }
}

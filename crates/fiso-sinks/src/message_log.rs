use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use cel_interpreter::{Context, Program, Value};
use fiso_core::{CloudEvent, FisoError, FisoResult, Sink};
use fiso_publisher_pool::PublisherPool;

/// The message-log sink (§4.4): publishes the envelope bytes to a single
/// topic via the shared [`PublisherPool`]. The key, if `key_expr` is
/// configured, is a CEL expression evaluated over the envelope's `data`
/// field; otherwise the record key is empty.
pub struct MessageLogSink {
    pool: Arc<PublisherPool>,
    cluster: String,
    topic: String,
    key_expr: Option<Program>,
}

impl MessageLogSink {
    pub fn new(
        pool: Arc<PublisherPool>,
        cluster: impl Into<String>,
        topic: impl Into<String>,
        key_expr: Option<&str>,
    ) -> FisoResult<Self> {
        let key_expr = key_expr
            .map(Program::compile)
            .transpose()
            .map_err(|err| FisoError::Config(format!("invalid key expression: {err}")))?;
        Ok(Self {
            pool,
            cluster: cluster.into(),
            topic: topic.into(),
            key_expr,
        })
    }
}

#[async_trait]
impl Sink for MessageLogSink {
    async fn deliver(&self, body: Vec<u8>, headers: BTreeMap<String, String>) -> FisoResult<()> {
        let key = match &self.key_expr {
            Some(program) => Some(evaluate_key(program, &body)?),
            None => None,
        };
        let producer = self.pool.producer(&self.cluster).await?;
        producer.publish(&self.topic, key, body, &headers).await?;
        Ok(())
    }
}

fn evaluate_key(program: &Program, envelope_bytes: &[u8]) -> FisoResult<Vec<u8>> {
    let envelope = CloudEvent::from_bytes(envelope_bytes)?;
    let data = envelope.data().cloned().unwrap_or(serde_json::Value::Null);

    let mut context = Context::default();
    let data_value = Value::try_from(data)
        .map_err(|err| FisoError::Permanent(format!("invalid payload for key expression: {err}")))?;
    context
        .add_variable("data", data_value)
        .map_err(|err| FisoError::Permanent(format!("failed to bind `data`: {err}")))?;

    let result = program
        .execute(&context)
        .map_err(|err| FisoError::Permanent(format!("key expression evaluation failed: {err}")))?;

    let json = serde_json::to_value(result)
        .map_err(|err| FisoError::Permanent(format!("key expression result is not JSON: {err}")))?;
    Ok(match json {
        serde_json::Value::String(s) => s.into_bytes(),
        other => other.to_string().into_bytes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_key_expression_at_construction() {
        let pool = Arc::new(PublisherPool::new());
        let result = MessageLogSink::new(pool, "primary", "orders-out", Some("data +"));
        assert!(result.is_err());
    }
}

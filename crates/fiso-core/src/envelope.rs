use chrono::Utc;
use cloudevents::event::Data;
use cloudevents::{Event as CdEvent, EventBuilder, EventBuilderV10};

use crate::error::{FisoError, FisoResult};

/// The CloudEvent envelope exchanged between transform and sink.
///
/// Wraps the `cloudevents-sdk` builder with the fixed shape fiso requires:
/// `specversion=1.0`, `id` equal to the correlation id, and a `source` of
/// `fiso-flow/<flow-name>`.
#[derive(Debug, Clone)]
pub struct CloudEvent(CdEvent);

impl CloudEvent {
    /// Builds the envelope for one event. `data` is the (possibly
    /// transformed) JSON payload.
    pub fn new(
        flow_name: &str,
        event_type: &str,
        correlation_id: &str,
        data: serde_json::Value,
    ) -> FisoResult<Self> {
        let event = EventBuilderV10::new()
            .id(correlation_id)
            .source(format!("fiso-flow/{flow_name}"))
            .ty(event_type)
            .time(Utc::now())
            .data("application/json", data)
            .build()
            .map_err(|err| FisoError::Internal(format!("failed to build CloudEvent: {err}")))?;
        Ok(Self(event))
    }

    pub fn id(&self) -> &str {
        self.0.id()
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        match self.0.data() {
            Some(Data::Json(v)) => Some(v),
            _ => None,
        }
    }

    /// Serializes the envelope to structured-mode JSON bytes, the form that
    /// travels on the wire between transform and sink.
    pub fn to_bytes(&self) -> FisoResult<Vec<u8>> {
        serde_json::to_vec(&self.0)
            .map_err(|err| FisoError::Internal(format!("failed to serialize CloudEvent: {err}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> FisoResult<Self> {
        let event: CdEvent = serde_json::from_slice(bytes)
            .map_err(|err| FisoError::Internal(format!("failed to parse CloudEvent: {err}")))?;
        Ok(Self(event))
    }

    /// Replaces the `data` field, used by the transform step.
    pub fn with_data(self, data: serde_json::Value) -> FisoResult<Self> {
        let (id, source, ty) = (
            self.0.id().to_owned(),
            self.0.source().to_string(),
            self.0.ty().to_owned(),
        );
        let event = EventBuilderV10::from(self.0)
            .id(id)
            .source(source)
            .ty(ty)
            .data("application/json", data)
            .build()
            .map_err(|err| FisoError::Internal(format!("failed to rebuild CloudEvent: {err}")))?;
        Ok(Self(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_bytes() {
        let env = CloudEvent::new(
            "orders",
            "order.created",
            "abc-123",
            json!({"event_id": "abc-123", "action": "created"}),
        )
        .expect("build");
        let bytes = env.to_bytes().expect("serialize");
        let parsed = CloudEvent::from_bytes(&bytes).expect("parse");
        assert_eq!(parsed.id(), "abc-123");
        assert_eq!(
            parsed.data(),
            Some(&json!({"event_id": "abc-123", "action": "created"}))
        );
    }

    #[test]
    fn with_data_replaces_payload_only() {
        let env = CloudEvent::new("orders", "order.created", "abc-123", json!({"a": 1})).unwrap();
        let replaced = env.with_data(json!({"transformed": true})).unwrap();
        assert_eq!(replaced.id(), "abc-123");
        assert_eq!(replaced.data(), Some(&json!({"transformed": true})));
    }
}

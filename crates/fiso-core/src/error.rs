/// Convenience alias used across the fiso core contracts.
pub type FisoResult<T> = Result<T, FisoError>;

/// The error taxonomy described in the error-handling design: a closed set
/// the pipeline's retry classifier can match on, instead of string-sniffing
/// an `anyhow::Error` at the sink boundary.
#[derive(Debug, thiserror::Error)]
pub enum FisoError {
    /// Surfaced at startup; the process should exit non-zero.
    #[error("configuration error: {0}")]
    Config(String),

    /// Retryable: network errors, 5xx, 429, timeouts.
    #[error("transient delivery error: {0}")]
    Transient(String),

    /// Not retryable: 4xx except 429, malformed payload, sink precondition
    /// errors. `reason` is used verbatim as the DLQ `x-failure-reason`.
    #[error("permanent delivery error: {0}")]
    Permanent(String),

    /// A transform step failed; always permanent, reason is always
    /// `transform-failed` on the wire (see [`FisoError::dlq_reason`]).
    #[error("transform error: {0}")]
    Transform(String),

    /// Cooperative cancellation observed mid-operation (e.g. during a
    /// sink's retry backoff wait).
    #[error("operation cancelled")]
    Cancelled,

    /// An internal invariant was violated (duplicate route registration,
    /// double port allocation, ...). Fatal at the component boundary.
    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl FisoError {
    /// Whether the pipeline should retry this error under the configured
    /// retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, FisoError::Transient(_))
    }

    /// The string the DLQ handler puts in `x-failure-reason`.
    pub fn dlq_reason(&self) -> String {
        match self {
            FisoError::Transform(_) => "transform-failed".to_string(),
            FisoError::Transient(msg) | FisoError::Permanent(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// Classifies an HTTP status code per the permanent/transient split in
    /// the error-handling design: 2xx is not an error at all (callers
    /// shouldn't reach this), 4xx except 429 is permanent, 429 and 5xx are
    /// transient.
    pub fn from_http_status(status: u16) -> Option<FisoError> {
        match status {
            200..=299 => None,
            429 => Some(FisoError::Transient(format!("http status {status}"))),
            400..=499 => Some(FisoError::Permanent(format!("http status {status}"))),
            500..=599 => Some(FisoError::Transient(format!("http status {status}"))),
            other => Some(FisoError::Transient(format!("http status {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_statuses() {
        assert!(FisoError::from_http_status(200).is_none());
        assert!(FisoError::from_http_status(503).unwrap().is_transient());
        assert!(FisoError::from_http_status(429).unwrap().is_transient());
        assert!(!FisoError::from_http_status(400).unwrap().is_transient());
        assert!(!FisoError::from_http_status(404).unwrap().is_transient());
    }

    #[test]
    fn transform_errors_report_fixed_dlq_reason() {
        let err = FisoError::Transform("boom".into());
        assert_eq!(err.dlq_reason(), "transform-failed");
    }
}

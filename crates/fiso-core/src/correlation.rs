use std::collections::BTreeMap;

use uuid::Uuid;

/// Header names recognized on ingress, in priority order, plus the header
/// the runtime always sets on egress.
pub const HDR_FISO_CORRELATION_ID: &str = "fiso-correlation-id";
pub const HDR_X_CORRELATION_ID: &str = "x-correlation-id";
pub const HDR_X_REQUEST_ID: &str = "x-request-id";
pub const HDR_TRACEPARENT: &str = "traceparent";

/// Derives (or mints) the correlation id for an inbound event.
///
/// Priority: `fiso-correlation-id` > `x-correlation-id` > `x-request-id` >
/// the trace id embedded in `traceparent` > a freshly minted UUID. The
/// result is immutable for the lifetime of the event once assigned by the
/// pipeline.
pub fn derive_correlation_id(headers: &BTreeMap<String, String>) -> String {
    if let Some(v) = find_case_insensitive(headers, HDR_FISO_CORRELATION_ID) {
        return v.to_owned();
    }
    if let Some(v) = find_case_insensitive(headers, HDR_X_CORRELATION_ID) {
        return v.to_owned();
    }
    if let Some(v) = find_case_insensitive(headers, HDR_X_REQUEST_ID) {
        return v.to_owned();
    }
    if let Some(traceparent) = find_case_insensitive(headers, HDR_TRACEPARENT) {
        if let Some(trace_id) = trace_id_from_traceparent(traceparent) {
            return trace_id;
        }
    }
    Uuid::new_v4().to_string()
}

fn find_case_insensitive<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Extracts the 32-hex trace id from a W3C `traceparent` header
/// (`version-traceid-spanid-flags`). Returns `None` if the header doesn't
/// look like a valid traceparent.
fn trace_id_from_traceparent(traceparent: &str) -> Option<String> {
    let mut parts = traceparent.split('-');
    let _version = parts.next()?;
    let trace_id = parts.next()?;
    if trace_id.len() == 32 && trace_id.bytes().all(|b| b.is_ascii_hexdigit()) && trace_id != "0".repeat(32) {
        Some(trace_id.to_owned())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn prefers_fiso_correlation_id() {
        let h = headers(&[
            ("fiso-correlation-id", "a"),
            ("x-correlation-id", "b"),
            ("x-request-id", "c"),
        ]);
        assert_eq!(derive_correlation_id(&h), "a");
    }

    #[test]
    fn falls_back_through_priority_chain() {
        assert_eq!(
            derive_correlation_id(&headers(&[("x-correlation-id", "b"), ("x-request-id", "c")])),
            "b"
        );
        assert_eq!(derive_correlation_id(&headers(&[("x-request-id", "c")])), "c");
    }

    #[test]
    fn extracts_trace_id_from_traceparent() {
        let h = headers(&[(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        )]);
        assert_eq!(
            derive_correlation_id(&h),
            "4bf92f3577b34da6a3ce929d0e0e4736"
        );
    }

    #[test]
    fn mints_uuid_when_nothing_present() {
        let id = derive_correlation_id(&BTreeMap::new());
        assert_eq!(id.len(), 36);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let h = headers(&[("Fiso-Correlation-Id", "xyz")]);
        assert_eq!(derive_correlation_id(&h), "xyz");
    }
}

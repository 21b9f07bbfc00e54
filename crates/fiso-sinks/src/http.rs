use std::collections::BTreeMap;

use async_trait::async_trait;
use fiso_core::{FisoError, FisoResult, Sink};
use http::Method;

/// The HTTP sink (§4.4): a configurable method/URL/static-header delivery
/// target. A single call is one attempt; the retry/backoff loop around
/// repeated attempts lives in the pipeline runtime (see `fiso-pipeline`),
/// not here — this keeps the sink's own contract to "one attempt in,
/// classified result out".
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    method: Method,
    static_headers: Vec<(String, String)>,
}

impl HttpSink {
    pub fn new(url: impl Into<String>, method: &str, static_headers: Vec<(String, String)>) -> FisoResult<Self> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|err| FisoError::Config(format!("invalid http method {method:?}: {err}")))?;
        Ok(Self {
            client: reqwest::Client::new(),
            url: url.into(),
            method,
            static_headers,
        })
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn deliver(&self, body: Vec<u8>, headers: BTreeMap<String, String>) -> FisoResult<()> {
        let mut request = self.client.request(self.method.clone(), &self.url);
        for (name, value) in &self.static_headers {
            request = request.header(name, value);
        }
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        let response = request
            .body(body)
            .send()
            .await
            .map_err(|err| FisoError::Transient(format!("http sink request failed: {err}")))?;
        match FisoError::from_http_status(response.status().as_u16()) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn success_status_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let sink = HttpSink::new(format!("{}/ingest", server.uri()), "POST", vec![]).unwrap();
        sink.deliver(b"payload".to_vec(), BTreeMap::new()).await.unwrap();
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let sink = HttpSink::new(format!("{}/ingest", server.uri()), "POST", vec![]).unwrap();
        let err = sink.deliver(b"payload".to_vec(), BTreeMap::new()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn client_error_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let sink = HttpSink::new(format!("{}/ingest", server.uri()), "POST", vec![]).unwrap();
        let err = sink.deliver(b"payload".to_vec(), BTreeMap::new()).await.unwrap_err();
        assert!(!err.is_transient());
    }
}

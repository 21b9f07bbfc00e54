use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use cel_interpreter::{Context, Program, Value};
use fiso_core::flow::WorkflowMode;
use fiso_core::{CloudEvent, FisoError, FisoResult, Sink};

/// The capability a workflow-engine sink needs from its client library
/// (§9 "Dynamic interface abstractions"): starting a new workflow execution
/// or signaling a running one. Concrete bindings to a specific engine's SDK
/// are adapter code outside this crate's core; [`HttpWorkflowClient`] is
/// the one adapter this crate ships, talking a small JSON-over-HTTP
/// protocol rather than any one vendor's wire format.
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    async fn start_workflow(
        &self,
        workflow_type: &str,
        workflow_id: &str,
        task_queue: &str,
        args: Vec<serde_json::Value>,
    ) -> FisoResult<()>;

    async fn signal_workflow(
        &self,
        workflow_id: &str,
        signal_name: &str,
        args: Vec<serde_json::Value>,
    ) -> FisoResult<()>;
}

/// A JSON-over-HTTP adapter to a workflow engine's control-plane API.
/// `base_url` is expected to expose `POST /workflows/start` and
/// `POST /workflows/signal`.
pub struct HttpWorkflowClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpWorkflowClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl WorkflowClient for HttpWorkflowClient {
    async fn start_workflow(
        &self,
        workflow_type: &str,
        workflow_id: &str,
        task_queue: &str,
        args: Vec<serde_json::Value>,
    ) -> FisoResult<()> {
        let body = serde_json::json!({
            "workflowType": workflow_type,
            "workflowId": workflow_id,
            "taskQueue": task_queue,
            "args": args,
        });
        self.post(&format!("{}/workflows/start", self.base_url), body).await
    }

    async fn signal_workflow(
        &self,
        workflow_id: &str,
        signal_name: &str,
        args: Vec<serde_json::Value>,
    ) -> FisoResult<()> {
        let body = serde_json::json!({
            "workflowId": workflow_id,
            "signalName": signal_name,
            "args": args,
        });
        self.post(&format!("{}/workflows/signal", self.base_url), body).await
    }
}

impl HttpWorkflowClient {
    async fn post(&self, url: &str, body: serde_json::Value) -> FisoResult<()> {
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| FisoError::Transient(format!("workflow client request failed: {err}")))?;
        match FisoError::from_http_status(response.status().as_u16()) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// The workflow-engine sink (§4.4). Two modes: `start` issues a new
/// execution, `signal` targets a running one by the same resolved id.
pub struct WorkflowSink {
    client: Arc<dyn WorkflowClient>,
    workflow_type: String,
    task_queue: String,
    mode: WorkflowMode,
    id_expr: Option<String>,
    params: Vec<Program>,
}

impl WorkflowSink {
    pub fn new(
        client: Arc<dyn WorkflowClient>,
        workflow_type: impl Into<String>,
        task_queue: impl Into<String>,
        mode: WorkflowMode,
        id_expr: Option<String>,
        params: &[String],
    ) -> FisoResult<Self> {
        let params = params
            .iter()
            .map(|expr| Program::compile(expr))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| FisoError::Config(format!("invalid workflow param expression: {err}")))?;
        Ok(Self {
            client,
            workflow_type: workflow_type.into(),
            task_queue: task_queue.into(),
            mode,
            id_expr,
            params,
        })
    }
}

#[async_trait]
impl Sink for WorkflowSink {
    async fn deliver(&self, body: Vec<u8>, _headers: BTreeMap<String, String>) -> FisoResult<()> {
        let envelope = CloudEvent::from_bytes(&body)?;
        let data = envelope.data().cloned().unwrap_or(serde_json::Value::Null);

        let workflow_id = match &self.id_expr {
            Some(template) if !template.is_empty() => resolve_template(template, &data),
            _ => default_workflow_id(&self.workflow_type),
        };

        let args = if self.params.is_empty() {
            // §4.4: with no params configured, the full envelope (not just
            // its `data` field) is passed as a single map argument.
            let envelope_value: serde_json::Value = serde_json::from_slice(&body)
                .map_err(|err| FisoError::Permanent(format!("envelope is not valid JSON: {err}")))?;
            vec![envelope_value]
        } else {
            self.params
                .iter()
                .map(|program| evaluate_param(program, &data))
                .collect::<FisoResult<Vec<_>>>()?
        };

        match self.mode {
            WorkflowMode::Start => {
                self.client
                    .start_workflow(&self.workflow_type, &workflow_id, &self.task_queue, args)
                    .await
            }
            WorkflowMode::Signal => {
                self.client
                    .signal_workflow(&workflow_id, &self.workflow_type, args)
                    .await
            }
        }
    }
}

fn evaluate_param(program: &Program, data: &serde_json::Value) -> FisoResult<serde_json::Value> {
    let mut context = Context::default();
    let data_value = Value::try_from(data.clone())
        .map_err(|err| FisoError::Permanent(format!("invalid payload for workflow param: {err}")))?;
    context
        .add_variable("data", data_value)
        .map_err(|err| FisoError::Permanent(format!("failed to bind `data`: {err}")))?;
    let result = program
        .execute(&context)
        .map_err(|err| FisoError::Permanent(format!("workflow param evaluation failed: {err}")))?;
    serde_json::to_value(result)
        .map_err(|err| FisoError::Permanent(format!("workflow param is not JSON: {err}")))
}

fn default_workflow_id(workflow_type: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{workflow_type}-{nanos}")
}

/// Resolves a tiny `{{.field}}` placeholder template over the top-level
/// fields of `data` (§4.4 `order-{{.orderId}}`). This is not a general
/// template engine — it only substitutes single top-level field references,
/// which is all the contract calls for.
fn resolve_template(template: &str, data: &serde_json::Value) -> String {
    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{.") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        match after.find("}}") {
            Some(end) => {
                let field = &after[..end];
                if let Some(value) = data.get(field) {
                    out.push_str(&scalar_to_string(value));
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Mutex;

    struct RecordingClient {
        started: Mutex<Vec<(String, String, String, Vec<serde_json::Value>)>>,
    }

    #[async_trait]
    impl WorkflowClient for RecordingClient {
        async fn start_workflow(
            &self,
            workflow_type: &str,
            workflow_id: &str,
            task_queue: &str,
            args: Vec<serde_json::Value>,
        ) -> FisoResult<()> {
            self.started.lock().await.push((
                workflow_type.to_string(),
                workflow_id.to_string(),
                task_queue.to_string(),
                args,
            ));
            Ok(())
        }

        async fn signal_workflow(
            &self,
            _workflow_id: &str,
            _signal_name: &str,
            _args: Vec<serde_json::Value>,
        ) -> FisoResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn resolves_workflow_id_from_template() {
        let client = Arc::new(RecordingClient {
            started: Mutex::new(Vec::new()),
        });
        let sink = WorkflowSink::new(
            Arc::clone(&client) as Arc<dyn WorkflowClient>,
            "TestWF",
            "test-queue",
            WorkflowMode::Start,
            Some("order-{{.orderId}}".to_string()),
            &[],
        )
        .unwrap();

        let envelope = CloudEvent::new("orders", "orders.event", "cid", json!({"orderId": "12345"})).unwrap();
        sink.deliver(envelope.to_bytes().unwrap(), BTreeMap::new()).await.unwrap();

        let started = client.started.lock().await;
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].1, "order-12345");
        assert_eq!(started[0].2, "test-queue");
    }

    #[test]
    fn template_substitution_handles_multiple_fields() {
        let data = json!({"a": "x", "b": 7});
        assert_eq!(resolve_template("{{.a}}-{{.b}}", &data), "x-7");
    }
}

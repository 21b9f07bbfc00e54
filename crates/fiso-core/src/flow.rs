use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FisoError, FisoResult};

fn default_initial_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_max_interval() -> Duration {
    Duration::from_secs(30)
}

/// Static, immutable-after-start configuration for one flow (source +
/// optional transform + sink + error handling).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    pub source: SourceConfig,
    #[serde(default)]
    pub transform: Option<TransformConfig>,
    pub sink: SinkConfig,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    /// CloudEvent `type` field; defaults to `<flow-name>.event` when absent.
    #[serde(default)]
    pub event_type: Option<String>,
}

impl FlowDefinition {
    pub fn validate(&self) -> FisoResult<()> {
        if self.name.trim().is_empty() {
            return Err(FisoError::Config("flow name must not be empty".into()));
        }
        if self.error_handling.max_retries < 0 {
            return Err(FisoError::Config("maxRetries must be >= 0".into()));
        }
        Ok(())
    }

    pub fn event_type(&self) -> String {
        self.event_type
            .clone()
            .unwrap_or_else(|| format!("{}.event", self.name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    MessageLog {
        cluster: String,
        topic: String,
        group: String,
        #[serde(default)]
        offset_reset: OffsetReset,
    },
    Http {
        addr: String,
        path: String,
    },
    Grpc {
        addr: String,
    },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OffsetReset {
    Earliest,
    #[default]
    Latest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformConfig {
    Expr { expr: String },
    Wasm { wasm_module: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    Http {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
        #[serde(default)]
        headers: Vec<(String, String)>,
    },
    Grpc {
        addr: String,
    },
    MessageLog {
        cluster: String,
        topic: String,
        #[serde(default)]
        key_expr: Option<String>,
    },
    Workflow {
        addr: String,
        workflow_type: String,
        task_queue: String,
        #[serde(default)]
        mode: WorkflowMode,
        #[serde(default)]
        id_expr: Option<String>,
        #[serde(default)]
        params: Vec<String>,
    },
}

fn default_http_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowMode {
    #[default]
    Start,
    Signal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandling {
    #[serde(default)]
    pub dead_letter_topic: Option<String>,
    #[serde(default)]
    pub max_retries: i64,
    /// First retry delay for a transient sink error (§4.4). Exponential
    /// backoff doubles this each attempt, capped at `max_interval`, with
    /// ±20% symmetric jitter (§9).
    #[serde(default = "default_initial_interval", with = "humantime_serde")]
    pub initial_interval: Duration,
    #[serde(default = "default_max_interval", with = "humantime_serde")]
    pub max_interval: Duration,
}

impl Default for ErrorHandling {
    fn default() -> Self {
        Self {
            dead_letter_topic: None,
            max_retries: 0,
            initial_interval: default_initial_interval(),
            max_interval: default_max_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_flow_from_yaml() {
        let yaml = r#"
name: orders
source:
  type: message_log
  cluster: primary
  topic: orders-in
  group: fiso-orders
transform:
  kind: expr
  expr: "data"
sink:
  type: http
  url: "http://localhost:8080/ingest"
error_handling:
  dead_letter_topic: orders-dlq
  max_retries: 3
"#;
        let flow: FlowDefinition = serde_yaml::from_str(yaml).expect("parse flow");
        flow.validate().expect("valid");
        assert_eq!(flow.name, "orders");
        assert_eq!(flow.error_handling.max_retries, 3);
        assert_eq!(flow.event_type(), "orders.event");
    }

    #[test]
    fn rejects_negative_retries() {
        let flow = FlowDefinition {
            name: "x".into(),
            source: SourceConfig::Http {
                addr: "127.0.0.1:0".into(),
                path: "/x".into(),
            },
            transform: None,
            sink: SinkConfig::Http {
                url: "http://x".into(),
                method: "POST".into(),
                headers: vec![],
            },
            error_handling: ErrorHandling {
                max_retries: -1,
                ..Default::default()
            },
            event_type: None,
        };
        assert!(flow.validate().is_err());
    }
}

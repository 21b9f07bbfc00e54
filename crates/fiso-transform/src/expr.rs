use std::collections::BTreeMap;

use async_trait::async_trait;
use cel_interpreter::{Context, Program, Value};
use fiso_core::{FisoError, FisoResult};

use crate::Transformer;

/// A CEL-like expression transformer (§4.3). The expression is compiled
/// once at pipeline construction — compile errors are config errors, not
/// transform errors, because they're caught before the flow ever runs.
/// Evaluation happens over a single bound variable, `data`, set to the
/// event payload parsed as JSON.
pub struct ExprTransformer {
    program: Program,
}

impl ExprTransformer {
    /// Compiles `expr`. Returns a config error on a syntax error so
    /// `FlowDefinition` construction fails fast rather than deferring to
    /// the first event.
    pub fn compile(expr: &str) -> FisoResult<Self> {
        let program = Program::compile(expr)
            .map_err(|err| FisoError::Config(format!("invalid transform expression: {err}")))?;
        Ok(Self { program })
    }
}

#[async_trait]
impl Transformer for ExprTransformer {
    async fn apply(
        &self,
        data: serde_json::Value,
        _headers: &BTreeMap<String, String>,
    ) -> FisoResult<serde_json::Value> {
        let mut context = Context::default();
        let data_value = Value::try_from(data)
            .map_err(|err| FisoError::Transform(format!("invalid payload for expression: {err}")))?;
        context
            .add_variable("data", data_value)
            .map_err(|err| FisoError::Transform(format!("failed to bind `data`: {err}")))?;

        let result = self
            .program
            .execute(&context)
            .map_err(|err| FisoError::Transform(format!("expression evaluation failed: {err}")))?;

        serde_json::to_value(result)
            .map_err(|err| FisoError::Transform(format!("expression result is not JSON: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn wraps_payload_under_a_new_key() {
        let transformer = ExprTransformer::compile("{\"transformed\": true, \"original\": data}")
            .expect("compile");
        let out = transformer
            .apply(json!({"event_id": "abc-123"}), &BTreeMap::new())
            .await
            .expect("apply");
        assert_eq!(
            out,
            json!({"transformed": true, "original": {"event_id": "abc-123"}})
        );
    }

    #[test]
    fn rejects_malformed_expressions_at_compile_time() {
        assert!(ExprTransformer::compile("data +").is_err());
    }

    #[tokio::test]
    async fn field_access_on_the_bound_payload() {
        let transformer = ExprTransformer::compile("data.action == \"created\"").expect("compile");
        let out = transformer
            .apply(json!({"action": "created"}), &BTreeMap::new())
            .await
            .expect("apply");
        assert_eq!(out, json!(true));
    }
}

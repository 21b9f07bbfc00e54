use std::collections::BTreeMap;

use async_trait::async_trait;
use fiso_core::{FisoError, FisoResult};
use fiso_wasm_runtime::{CallRuntime, CallRuntimeConfig};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::Transformer;

/// A sandboxed WASM transform step (§4.3). The module sees
/// `{payload, headers, direction: "transform"}` on stdin and is expected to
/// write `{payload, headers}` on stdout; headers returned by the module are
/// currently advisory only — the transform contract changes `data`, not the
/// envelope's header map.
pub struct WasmTransformer {
    runtime: CallRuntime,
}

impl WasmTransformer {
    pub fn compile(wasm_bytes: &[u8], timeout: std::time::Duration) -> FisoResult<Self> {
        let runtime = CallRuntime::compile(wasm_bytes, CallRuntimeConfig { timeout })?;
        Ok(Self { runtime })
    }
}

#[async_trait]
impl Transformer for WasmTransformer {
    async fn apply(
        &self,
        data: serde_json::Value,
        headers: &BTreeMap<String, String>,
    ) -> FisoResult<serde_json::Value> {
        let input = json!({
            "payload": data,
            "headers": headers,
            "direction": "transform",
        });
        let output = self.runtime.call(input, CancellationToken::new()).await?;
        output
            .get("payload")
            .cloned()
            .ok_or_else(|| FisoError::Transform("wasm output missing `payload` field".into()))
    }
}

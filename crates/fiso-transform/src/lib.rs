//! Stateless event transformers (§4.3): a compiled CEL-like expression
//! evaluated over `{data: <payload>}`, or a sandboxed WASM module invoked
//! with `{payload, headers, direction}` on stdin. Both kinds share one
//! capability: `apply(data) -> data'`; any failure is always a permanent
//! transform error (§7), never retried, straight to the DLQ.

mod expr;
mod wasm;

pub use expr::ExprTransformer;
pub use wasm::WasmTransformer;

use async_trait::async_trait;
use fiso_core::FisoResult;

/// Common capability for the transform step (§4.3). `headers` are passed
/// read-only so a WASM transform can inspect them; neither kind may add or
/// remove headers — only the payload changes.
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn apply(
        &self,
        data: serde_json::Value,
        headers: &std::collections::BTreeMap<String, String>,
    ) -> FisoResult<serde_json::Value>;
}

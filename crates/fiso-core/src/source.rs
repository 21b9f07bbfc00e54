use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::FisoResult;
use crate::handler::EventHandler;

/// Common capability every source kind implements (§4.2): message-log
/// fetch loop, pooled HTTP listener, gRPC unary listener. `run` blocks
/// until `cancel` fires, invoking `handler` once per record; on
/// cancellation it finishes the in-flight record, attempts a final
/// commit, and returns.
#[async_trait]
pub trait Source: Send {
    async fn run(
        &mut self,
        handler: Arc<dyn EventHandler>,
        cancel: CancellationToken,
    ) -> FisoResult<()>;
}

use async_trait::async_trait;

use crate::event::Event;
use crate::error::FisoResult;

/// The per-event callback a source invokes. Shared by every source kind
/// (message-log fetch loop, pooled HTTP route, gRPC unary call) and by the
/// shared-listener multiplexer in `fiso-server-pool`, so all of them agree
/// on one seam: `Ok(())` means "commit this event", `Err` means apply the
/// retry/DLQ policy.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> FisoResult<()>;
}

#[async_trait]
impl<F> EventHandler for F
where
    F: Fn(Event) -> FisoResult<()> + Send + Sync,
{
    async fn handle(&self, event: Event) -> FisoResult<()> {
        self(event)
    }
}

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use fiso_core::source::Source;
use fiso_core::{EventHandler, FisoError, FisoResult};
use fiso_server_pool::{RouteHandle, ServerPool};
use tokio_util::sync::CancellationToken;

/// A pooled HTTP source (§4.2, §4.6): pre-reserves `(addr, path)` on the
/// shared server pool at construction, then `run` just attaches the real
/// handler and blocks on cancellation — the pool's own listener drives
/// request dispatch.
pub struct HttpSource {
    route: RouteHandle,
}

impl HttpSource {
    /// Pre-registers `path` on `addr` against `pool`. Call this before the
    /// pool starts listening so the route answers `503` rather than `404`
    /// during the gap between registration and `SetHandler`.
    pub async fn pre_register(pool: &ServerPool, addr: SocketAddr, path: impl Into<String>) -> FisoResult<Self> {
        let route = pool.pre_register(addr, path).await?;
        Ok(Self { route })
    }

    pub fn addr(&self) -> SocketAddr {
        self.route.addr()
    }

    pub fn path(&self) -> &str {
        self.route.path()
    }
}

#[async_trait]
impl Source for HttpSource {
    async fn run(&mut self, handler: Arc<dyn EventHandler>, cancel: CancellationToken) -> FisoResult<()> {
        self.route
            .set_handler(handler)
            .await
            .map_err(|err| FisoError::Internal(format!("failed to attach http source handler: {err}")))?;
        cancel.cancelled().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fiso_core::Event;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn attaches_handler_and_unblocks_on_cancel() {
        let pool = Arc::new(ServerPool::new());
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut source = HttpSource::pre_register(&pool, addr, "/in").await.expect("pre-register");
        pool.start().await.expect("start");
        pool.wait_ready().await;
        let bound = pool.listen_addr(addr).await.expect("bound");

        let count = Arc::new(AtomicUsize::new(0));
        let count_for_handler = Arc::clone(&count);
        let handler: Arc<dyn EventHandler> = Arc::new(move |_event: Event| {
            count_for_handler.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let run_task = tokio::spawn(async move { source.run(handler, run_cancel).await });

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://{bound}/in"))
            .body("x")
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        cancel.cancel();
        run_task.await.expect("join").expect("run returns ok");
        pool.close().await.expect("close");
    }
}

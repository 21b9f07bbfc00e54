use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use fiso_core::{EventHandler as RouteHandler, FisoResult};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::RwLock;

use crate::server::SharedServer;

/// The shared-listener HTTP multiplexer. One `SharedServer` per bound
/// address; a pool of paths is pre-registered against it before any
/// listener opens (see §4.6).
#[derive(Default)]
pub struct ServerPool {
    servers: RwLock<HashMap<SocketAddr, Arc<SharedServer>>>,
}

/// A handle to a pre-registered `(addr, path)` slot. Holds no server
/// resources directly; callers use it only to attach the real handler once
/// it is ready, and to look up the address the slot lives on.
pub struct RouteHandle {
    server: Arc<SharedServer>,
    path: String,
}

impl RouteHandle {
    pub async fn set_handler(&self, handler: Arc<dyn RouteHandler>) -> FisoResult<()> {
        self.server.set_handler(&self.path, handler).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.addr()
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl ServerPool {
    pub fn new() -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
        }
    }

    /// Reserves `path` on the `SharedServer` for `addr`, creating it if this
    /// is the first route registered at that address. A duplicate
    /// `(addr, path)` returns an error synchronously.
    pub async fn pre_register(
        &self,
        addr: SocketAddr,
        path: impl Into<String>,
    ) -> FisoResult<RouteHandle> {
        let path = path.into();
        let server = self.server_for(addr).await;
        server.register_path(&path).await?;
        Ok(RouteHandle { server, path })
    }

    /// Registers a `GET path` Prometheus exposition-format endpoint on the
    /// shared server for `addr`, creating it if this is the first route at
    /// that address.
    pub async fn register_metrics(
        &self,
        addr: SocketAddr,
        path: impl Into<String>,
        handle: PrometheusHandle,
    ) -> FisoResult<()> {
        let server = self.server_for(addr).await;
        server.register_metrics(&path.into(), handle).await
    }

    async fn server_for(&self, addr: SocketAddr) -> Arc<SharedServer> {
        if let Some(server) = self.servers.read().await.get(&addr) {
            return Arc::clone(server);
        }
        let mut servers = self.servers.write().await;
        Arc::clone(servers.entry(addr).or_insert_with(|| SharedServer::new(addr)))
    }

    /// Opens a TCP listener for every `SharedServer` that isn't already
    /// listening and starts serving requests in the background. Idempotent.
    pub async fn start(&self) -> FisoResult<()> {
        let servers: Vec<_> = self.servers.read().await.values().cloned().collect();
        for server in servers {
            server.start().await?;
        }
        Ok(())
    }

    /// Blocks until every `SharedServer`'s listener has bound. Tests and
    /// callers that need to discover the concrete bound address call this
    /// after `start`.
    pub async fn wait_ready(&self) {
        let mut receivers: Vec<_> = {
            let servers = self.servers.read().await;
            servers.values().map(|s| s.ready_rx()).collect()
        };
        for rx in &mut receivers {
            let _ = rx.wait_for(Option::is_some).await;
        }
    }

    /// Returns the concrete bound address for the server registered under
    /// `config_addr`, or `None` if it isn't listening yet (or doesn't
    /// exist).
    pub async fn listen_addr(&self, config_addr: SocketAddr) -> Option<SocketAddr> {
        let server = self.servers.read().await.get(&config_addr)?.clone();
        server.bound_addr().await
    }

    pub async fn server_count(&self) -> usize {
        self.servers.read().await.len()
    }

    pub async fn route_count(&self) -> usize {
        let servers: Vec<_> = self.servers.read().await.values().cloned().collect();
        let mut total = 0;
        for server in servers {
            total += server.route_count().await;
        }
        total
    }

    /// Shuts every listening server down gracefully. A no-op for servers
    /// that were only pre-registered and never started.
    pub async fn close(&self) -> FisoResult<()> {
        let servers: Vec<_> = self.servers.read().await.values().cloned().collect();
        for server in servers {
            server.shutdown().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use fiso_core::Event;

    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn pre_register_gap_returns_503_then_200_after_set_handler() {
        let pool = ServerPool::new();
        let addr = loopback();
        let handle = pool.pre_register(addr, "/a").await.expect("pre-register");
        pool.start().await.expect("start");
        pool.wait_ready().await;
        let bound = pool.listen_addr(addr).await.expect("bound addr");

        let client = reqwest::Client::new();
        let url = format!("http://{bound}/a");
        let resp = client.post(&url).body("x").send().await.expect("request");
        assert_eq!(resp.status().as_u16(), 503);

        handle
            .set_handler(Arc::new(|_event: Event| Ok(())))
            .await
            .expect("set handler");

        let resp = client.post(&url).body("x").send().await.expect("request");
        assert_eq!(resp.status().as_u16(), 200);

        pool.close().await.expect("close");
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn duplicate_path_registration_errors() {
        let pool = ServerPool::new();
        let addr = loopback();
        pool.pre_register(addr, "/a").await.expect("first register");
        assert!(pool.pre_register(addr, "/a").await.is_err());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn concurrent_requests_across_two_routes_on_one_server() {
        let pool = Arc::new(ServerPool::new());
        let addr = loopback();
        let handle_a = pool.pre_register(addr, "/a").await.expect("register /a");
        let handle_b = pool.pre_register(addr, "/b").await.expect("register /b");
        pool.start().await.expect("start");
        pool.wait_ready().await;
        let bound = pool.listen_addr(addr).await.expect("bound addr");

        assert_eq!(pool.server_count().await, 1);
        assert_eq!(pool.route_count().await, 2);

        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));
        {
            let count_a = count_a.clone();
            handle_a
                .set_handler(Arc::new(move |_event: Event| {
                    count_a.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
                .await
                .expect("set handler a");
        }
        {
            let count_b = count_b.clone();
            handle_b
                .set_handler(Arc::new(move |_event: Event| {
                    count_b.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
                .await
                .expect("set handler b");
        }

        let client = reqwest::Client::new();
        let mut tasks = Vec::new();
        for path in ["/a", "/b"] {
            for _ in 0..10 {
                let client = client.clone();
                let url = format!("http://{bound}{path}");
                tasks.push(tokio::spawn(async move {
                    client.post(&url).body("x").send().await.map(|r| r.status().as_u16())
                }));
            }
        }
        for task in tasks {
            let status = task.await.expect("join").expect("request");
            assert_eq!(status, 200);
        }

        assert_eq!(count_a.load(Ordering::SeqCst), 10);
        assert_eq!(count_b.load(Ordering::SeqCst), 10);

        pool.close().await.expect("close");
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn metrics_route_shares_the_listener_with_pooled_sources() {
        use metrics_exporter_prometheus::PrometheusBuilder;

        let pool = ServerPool::new();
        let addr = loopback();
        let handle = pool.pre_register(addr, "/ingest").await.expect("register /ingest");
        handle
            .set_handler(Arc::new(|_event: Event| Ok(())))
            .await
            .expect("set handler");

        let prometheus_handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("install recorder");
        pool.register_metrics(addr, "/metrics", prometheus_handle)
            .await
            .expect("register metrics");

        pool.start().await.expect("start");
        pool.wait_ready().await;
        let bound = pool.listen_addr(addr).await.expect("bound addr");
        assert_eq!(pool.server_count().await, 1, "metrics shares the one listener");

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://{bound}/metrics"))
            .send()
            .await
            .expect("metrics request");
        assert_eq!(resp.status().as_u16(), 200);

        let resp = client
            .get(format!("http://{bound}/ingest"))
            .send()
            .await
            .expect("GET on a POST route");
        assert_eq!(resp.status().as_u16(), 405, "a registered POST route rejects GET, it isn't shadowed by the metrics 404");

        pool.close().await.expect("close");
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn close_on_never_started_pool_is_a_noop() {
        let pool = ServerPool::new();
        pool.pre_register(loopback(), "/a").await.expect("register");
        // Never call start().
        tokio::time::timeout(Duration::from_secs(1), pool.close())
            .await
            .expect("close should not hang")
            .expect("close should succeed");
    }
}

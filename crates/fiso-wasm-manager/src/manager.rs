use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fiso_config::WasmAppConfig;
use fiso_core::{FisoError, FisoResult};
use fiso_wasm_runtime::{AppRuntime, AppRuntimeConfig};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::port_pool::PortPool;

const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(10);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PORT_RANGE: (u16, u16) = (20000, 29999);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Starting,
    Healthy,
    Unhealthy,
    Stopped,
}

/// One supervised app (§3 WASM AppInstance).
struct AppEntry {
    config: WasmAppConfig,
    runtime: Arc<AppRuntime>,
    addr: SocketAddr,
    health: Health,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    health_task: Option<tokio::task::AbortHandle>,
}

#[derive(Debug, Clone)]
pub struct AppInstanceInfo {
    pub name: String,
    pub addr: SocketAddr,
    pub health: Health,
    pub started_at: DateTime<Utc>,
}

/// The WASM app manager (§4.8): supervises a set of long-running apps keyed
/// by name, allocating ports from a shared pool and gating proxy access on
/// health. A single top-level lock guards the apps map (§5); health updates
/// take it only briefly, per probe.
pub struct AppManager {
    apps: RwLock<HashMap<String, Mutex<AppEntry>>>,
    ports: PortPool,
    http: reqwest::Client,
}

impl Default for AppManager {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_RANGE.0, DEFAULT_PORT_RANGE.1)
    }
}

impl AppManager {
    pub fn new(port_min: u16, port_max: u16) -> Self {
        Self {
            apps: RwLock::new(HashMap::new()),
            ports: PortPool::new(port_min, port_max),
            http: reqwest::Client::new(),
        }
    }

    /// Starts one app. Errors if `cfg.name` is already running. Releases
    /// the allocated port on any failure after allocation so a failed start
    /// never leaks a port. Takes `self` wrapped in `Arc` because a
    /// configured health check spawns a prober that reports back into this
    /// same map.
    pub async fn start_app(self: &Arc<Self>, cfg: WasmAppConfig) -> FisoResult<()> {
        if self.apps.read().await.contains_key(&cfg.name) {
            return Err(FisoError::Internal(format!(
                "app {:?} is already running",
                cfg.name
            )));
        }

        let owns_port = cfg.port.is_none();
        let port = match cfg.port {
            Some(p) => p,
            None => self.ports.allocate().await?,
        };

        let wasm_bytes = match std::fs::read(&cfg.module_path) {
            Ok(bytes) => bytes,
            Err(err) => {
                if owns_port {
                    self.ports.release(port).await;
                }
                return Err(FisoError::Config(format!(
                    "failed to read wasm module {:?}: {err}",
                    cfg.module_path
                )));
            }
        };

        let runtime_cfg = AppRuntimeConfig {
            port,
            env: cfg.env.clone(),
            memory_limit_mb: cfg.memory_limit_mb,
            preopened_dirs: Vec::new(),
        };
        let runtime = match AppRuntime::compile(&wasm_bytes, runtime_cfg) {
            Ok(runtime) => Arc::new(runtime),
            Err(err) => {
                if owns_port {
                    self.ports.release(port).await;
                }
                return Err(err);
            }
        };

        let cancel = CancellationToken::new();
        let addr = match runtime.start(cancel.clone()).await {
            Ok(addr) => addr,
            Err(err) => {
                if owns_port {
                    self.ports.release(port).await;
                }
                return Err(err);
            }
        };

        let health = if cfg.health_check.is_some() {
            Health::Starting
        } else {
            Health::Healthy
        };

        let health_task = cfg.health_check.as_ref().map(|check| {
            let manager = Arc::clone(self);
            let name = cfg.name.clone();
            let path = check.path.clone();
            let interval = check.interval.unwrap_or(DEFAULT_HEALTH_INTERVAL);
            tokio::spawn(async move { manager.health_loop(name, addr, path, interval).await })
                .abort_handle()
        });

        let entry = AppEntry {
            config: cfg.clone(),
            runtime,
            addr,
            health,
            started_at: Utc::now(),
            cancel,
            health_task,
        };

        self.apps
            .write()
            .await
            .insert(cfg.name.clone(), Mutex::new(entry));
        tracing::info!(app = %cfg.name, %addr, "wasm app started");
        Ok(())
    }

    /// Periodic prober for one app: GETs `http://addr/<path>` on `interval`
    /// with a 5s per-probe timeout; `2xx` marks healthy, anything else
    /// (including a timeout or connection failure) marks unhealthy.
    async fn health_loop(self: Arc<Self>, name: String, addr: SocketAddr, path: String, interval: Duration) {
        let url = format!("http://{addr}{}", normalize_path(&path));
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let healthy = probe_healthy(&self.http, &url).await;
            self.set_health(
                &name,
                if healthy {
                    Health::Healthy
                } else {
                    Health::Unhealthy
                },
            )
            .await;
        }
    }

    async fn set_health(&self, name: &str, health: Health) {
        let apps = self.apps.read().await;
        if let Some(entry) = apps.get(name) {
            entry.lock().await.health = health;
        }
    }

    /// Signals the health prober to stop, stops the runtime, releases the
    /// port, and removes the entry.
    pub async fn stop_app(&self, name: &str) -> FisoResult<()> {
        let entry = self.apps.write().await.remove(name);
        let Some(entry) = entry else {
            return Err(FisoError::Internal(format!("app {name:?} is not running")));
        };
        let entry = entry.into_inner();
        if let Some(task) = entry.health_task {
            task.abort();
        }
        entry.cancel.cancel();
        entry.runtime.stop().await;
        if entry.config.port.is_none() {
            self.ports.release(entry.addr.port()).await;
        }
        tracing::info!(app = %name, "wasm app stopped");
        Ok(())
    }

    /// Best-effort stop of every running app; returns the first error
    /// encountered (if any) but always attempts every app.
    pub async fn stop_all(&self) -> FisoResult<()> {
        let names: Vec<String> = self.apps.read().await.keys().cloned().collect();
        let mut first_err = None;
        for name in names {
            if let Err(err) = self.stop_app(&name).await {
                tracing::error!(app = %name, %err, "failed to stop wasm app");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn info(&self, name: &str) -> Option<AppInstanceInfo> {
        let apps = self.apps.read().await;
        let entry = apps.get(name)?.lock().await;
        Some(AppInstanceInfo {
            name: name.to_string(),
            addr: entry.addr,
            health: entry.health,
            started_at: entry.started_at,
        })
    }

    pub async fn list(&self) -> Vec<AppInstanceInfo> {
        let apps = self.apps.read().await;
        let mut out = Vec::with_capacity(apps.len());
        for (name, entry) in apps.iter() {
            let entry = entry.lock().await;
            out.push(AppInstanceInfo {
                name: name.clone(),
                addr: entry.addr,
                health: entry.health,
                started_at: entry.started_at,
            });
        }
        out
    }

    /// Forwards an HTTP request to `name`'s app, preserving method, headers,
    /// and body. A missing app is a permanent error (maps to 404 at the
    /// caller); an unhealthy app is transient (maps to 503).
    pub async fn proxy(
        &self,
        name: &str,
        method: reqwest::Method,
        path: &str,
        headers: http::HeaderMap,
        body: Vec<u8>,
    ) -> FisoResult<(http::StatusCode, http::HeaderMap, Vec<u8>)> {
        let (addr, health) = {
            let apps = self.apps.read().await;
            let Some(entry) = apps.get(name) else {
                return Err(FisoError::Permanent(format!("no such app {name:?}")));
            };
            let entry = entry.lock().await;
            (entry.addr, entry.health)
        };
        if health != Health::Healthy {
            return Err(FisoError::Transient(format!("app {name:?} is not healthy")));
        }

        let url = format!("http://{addr}{path}");
        let mut req = self.http.request(method, &url);
        for (name, value) in headers.iter() {
            req = req.header(name, value);
        }
        let resp = req
            .body(body)
            .send()
            .await
            .map_err(|err| FisoError::Transient(format!("proxy request failed: {err}")))?;
        let status = resp.status();
        let response_headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|err| FisoError::Transient(format!("failed to read proxy response: {err}")))?
            .to_vec();
        Ok((status, response_headers, body))
    }
}

/// A 2xx response marks the app healthy; anything else — including a
/// timeout or connection failure — marks it unhealthy.
async fn probe_healthy(http: &reqwest::Client, url: &str) -> bool {
    tokio::time::timeout(HEALTH_PROBE_TIMEOUT, http.get(url).send())
        .await
        .ok()
        .and_then(|r| r.ok())
        .map(|r| r.status().is_success())
        .unwrap_or(false)
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_app_on_unknown_name_errors() {
        let manager = AppManager::default();
        let err = manager.stop_app("missing").await.unwrap_err();
        assert!(matches!(err, FisoError::Internal(_)));
    }

    #[tokio::test]
    async fn proxy_to_unknown_app_is_permanent() {
        let manager = AppManager::default();
        let err = manager
            .proxy("missing", reqwest::Method::GET, "/", http::HeaderMap::new(), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FisoError::Permanent(_)));
    }

    #[tokio::test]
    async fn list_and_info_on_empty_manager() {
        let manager = AppManager::default();
        assert!(manager.list().await.is_empty());
        assert!(manager.info("missing").await.is_none());
    }

    #[tokio::test]
    async fn stop_all_on_empty_manager_is_ok() {
        let manager = AppManager::default();
        assert!(manager.stop_all().await.is_ok());
    }

    #[test]
    fn normalize_path_adds_leading_slash() {
        assert_eq!(normalize_path("healthz"), "/healthz");
        assert_eq!(normalize_path("/healthz"), "/healthz");
    }

    #[tokio::test]
    async fn probe_healthy_on_2xx() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/healthz"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/healthz", server.uri());
        assert!(probe_healthy(&client, &url).await);
    }

    #[tokio::test]
    async fn probe_unhealthy_on_5xx() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/healthz"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/healthz", server.uri());
        assert!(!probe_healthy(&client, &url).await);
    }

    #[tokio::test]
    async fn probe_unhealthy_on_connection_failure() {
        let client = reqwest::Client::new();
        assert!(!probe_healthy(&client, "http://127.0.0.1:1").await);
    }
}

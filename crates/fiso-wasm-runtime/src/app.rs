use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use fiso_core::{FisoError, FisoResult};
use tokio::net::TcpListener as TokioTcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use wasmtime::{Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::WasiCtxBuilder;

use crate::engine::{new_engine, spawn_epoch_ticker};

/// Static config for one long-running app instance (§4.7, §4.8). The host
/// binds `port` before the guest ever runs and hands it over as a
/// preopened socket (the same mechanism `wasmtime serve --tcplisten`
/// uses) — the guest just accepts connections on it, discovering the port
/// from the `PORT` env var like any twelve-factor server.
#[derive(Debug, Clone)]
pub struct AppRuntimeConfig {
    pub port: u16,
    pub env: BTreeMap<String, String>,
    pub memory_limit_mb: Option<u64>,
    pub preopened_dirs: Vec<(String, PathBuf)>,
}

struct Running {
    addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
    epoch_ticker: tokio::task::AbortHandle,
}

/// Store data for a running app: the WASI context plus the resource
/// limiter, bundled so `Store::limiter` can borrow the latter without
/// reaching for shared/static state.
struct AppState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
}

/// The long-running app executor (§4.7 "App runtime"). One instance per
/// supervised app; `start`/`stop` drive its lifecycle, `addr`/`is_running`
/// answer the app manager's health loop and proxy.
pub struct AppRuntime {
    engine: Engine,
    module: Module,
    config: AppRuntimeConfig,
    state: Mutex<Option<Running>>,
}

impl AppRuntime {
    pub fn compile(wasm_bytes: &[u8], config: AppRuntimeConfig) -> FisoResult<Self> {
        let engine = new_engine()?;
        let module = Module::new(&engine, wasm_bytes)
            .map_err(|err| FisoError::Config(format!("failed to compile wasm app module: {err}")))?;
        Ok(Self {
            engine,
            module,
            config,
            state: Mutex::new(None),
        })
    }

    /// Binds the configured port, wires it to the guest as a preopened
    /// socket, and spawns `_start` in the background. `cancel` aborts the
    /// running instance as soon as it fires (used by the app manager to
    /// stop the app on supervisor shutdown as well as on explicit `StopApp`).
    pub async fn start(&self, cancel: CancellationToken) -> FisoResult<SocketAddr> {
        let mut guard = self.state.lock().await;
        if let Some(running) = guard.as_ref() {
            return Ok(running.addr);
        }

        let listener = TokioTcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .map_err(|err| FisoError::Internal(format!("failed to bind app port {}: {err}", self.config.port)))?;
        let addr = listener
            .local_addr()
            .map_err(|err| FisoError::Internal(format!("failed to read bound app address: {err}")))?;
        let std_listener = listener
            .into_std()
            .map_err(|err| FisoError::Internal(format!("failed to convert listener: {err}")))?;
        std_listener
            .set_nonblocking(false)
            .map_err(|err| FisoError::Internal(format!("failed to configure app listener: {err}")))?;

        let mut builder = WasiCtxBuilder::new();
        builder.inherit_stdio();
        builder.env("PORT", addr.port().to_string());
        for (key, value) in &self.config.env {
            builder.env(key, value);
        }
        for (guest_path, host_path) in &self.config.preopened_dirs {
            builder
                .preopened_dir(
                    host_path,
                    guest_path,
                    wasmtime_wasi::DirPerms::all(),
                    wasmtime_wasi::FilePerms::all(),
                )
                .map_err(|err| {
                    FisoError::Config(format!("failed to preopen {guest_path:?}: {err}"))
                })?;
        }
        builder.preopened_socket(3, std_listener).map_err(|err| {
            FisoError::Internal(format!("failed to hand the bound port to the wasm app: {err}"))
        })?;
        let wasi_ctx: WasiP1Ctx = builder.build_p1();

        let mut linker: Linker<AppState> = Linker::new(&self.engine);
        preview1::add_to_linker_async(&mut linker, |state: &mut AppState| &mut state.wasi)
            .map_err(|err| FisoError::Internal(format!("failed to wire WASI imports: {err}")))?;

        let app_state = AppState {
            wasi: wasi_ctx,
            limits: store_limits(self.config.memory_limit_mb),
        };
        let mut store = Store::new(&self.engine, app_state);
        store.limiter(|state| &mut state.limits);

        let module = self.module.clone();
        let epoch_ticker = spawn_epoch_ticker(&self.engine).abort_handle();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(%addr, "wasm app stopped by cancellation");
                }
                result = run_command(&mut store, &linker, &module) => {
                    if let Err(err) = result {
                        tracing::error!(%addr, %err, "wasm app exited with an error");
                    }
                }
            }
        });

        *guard = Some(Running {
            addr,
            task,
            epoch_ticker,
        });
        tracing::info!(%addr, "wasm app listening");
        Ok(addr)
    }

    pub async fn stop(&self) {
        if let Some(running) = self.state.lock().await.take() {
            running.task.abort();
            running.epoch_ticker.abort();
        }
    }

    pub async fn addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.as_ref().map(|r| r.addr)
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }
}

async fn run_command(
    store: &mut Store<AppState>,
    linker: &Linker<AppState>,
    module: &Module,
) -> FisoResult<()> {
    let instance = linker
        .instantiate_async(&mut *store, module)
        .await
        .map_err(|err| FisoError::Internal(format!("failed to instantiate wasm app: {err}")))?;
    let start = instance
        .get_typed_func::<(), ()>(&mut *store, "_start")
        .map_err(|err| FisoError::Internal(format!("wasm app has no `_start` export: {err}")))?;
    start
        .call_async(&mut *store, ())
        .await
        .map_err(|err| FisoError::Internal(format!("wasm app trapped: {err}")))
}

fn store_limits(memory_limit_mb: Option<u64>) -> StoreLimits {
    let mut builder = StoreLimitsBuilder::new();
    if let Some(mb) = memory_limit_mb {
        builder = builder.memory_size((mb as usize) * 1024 * 1024);
    }
    builder.build()
}

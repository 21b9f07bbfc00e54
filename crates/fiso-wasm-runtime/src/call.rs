use std::time::Duration;

use fiso_core::{FisoError, FisoResult};
use tokio_util::sync::CancellationToken;
use wasmtime::{Engine, Linker, Module, Store};
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::WasiCtxBuilder;

use crate::engine::{new_engine, spawn_epoch_ticker};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_STDOUT_BYTES: usize = 16 * 1024 * 1024;
const MAX_STDERR_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct CallRuntimeConfig {
    pub timeout: Duration,
}

impl Default for CallRuntimeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// The per-call WASM runtime (§4.7): compiles a module once at
/// construction, then instantiates a fresh, anonymous module for every
/// call so concurrent calls never share state. The module reads a JSON
/// object on stdin and is expected to write a JSON object on stdout; any
/// non-zero exit, stderr-surfaced error, or malformed JSON output is a
/// transform error.
pub struct CallRuntime {
    engine: Engine,
    module: Module,
    epoch_ticker: tokio::task::AbortHandle,
    timeout: Duration,
}

impl CallRuntime {
    pub fn compile(wasm_bytes: &[u8], config: CallRuntimeConfig) -> FisoResult<Self> {
        let engine = new_engine()?;
        let module = Module::new(&engine, wasm_bytes)
            .map_err(|err| FisoError::Config(format!("failed to compile wasm module: {err}")))?;
        let epoch_ticker = spawn_epoch_ticker(&engine).abort_handle();
        Ok(Self {
            engine,
            module,
            epoch_ticker,
            timeout: config.timeout,
        })
    }

    /// Runs one call: `input` is serialized to stdin, `cancel` aborts as
    /// soon as it's observed, and the configured `timeout` aborts the call
    /// regardless of cancellation.
    pub async fn call(
        &self,
        input: serde_json::Value,
        cancel: CancellationToken,
    ) -> FisoResult<serde_json::Value> {
        let input_bytes = serde_json::to_vec(&input)
            .map_err(|err| FisoError::Transform(format!("failed to encode wasm input: {err}")))?;

        let stdout = MemoryOutputPipe::new(MAX_STDOUT_BYTES);
        let stderr = MemoryOutputPipe::new(MAX_STDERR_BYTES);
        let wasi_ctx: WasiP1Ctx = WasiCtxBuilder::new()
            .stdin(MemoryInputPipe::new(input_bytes))
            .stdout(stdout.clone())
            .stderr(stderr.clone())
            .build_p1();

        let mut linker: Linker<WasiP1Ctx> = Linker::new(&self.engine);
        preview1::add_to_linker_async(&mut linker, |ctx| ctx)
            .map_err(|err| FisoError::Internal(format!("failed to wire WASI imports: {err}")))?;

        let mut store = Store::new(&self.engine, wasi_ctx);
        store.set_epoch_deadline(self.timeout.as_secs().max(1) + 1);

        let run = async {
            let instance = linker
                .instantiate_async(&mut store, &self.module)
                .await
                .map_err(|err| FisoError::Transform(format!("failed to instantiate wasm module: {err}")))?;
            let start = instance
                .get_typed_func::<(), ()>(&mut store, "_start")
                .map_err(|err| FisoError::Transform(format!("wasm module has no `_start` export: {err}")))?;
            start
                .call_async(&mut store, ())
                .await
                .map_err(|err| FisoError::Transform(format!("wasm module trapped: {err}")))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FisoError::Cancelled),
            result = tokio::time::timeout(self.timeout, run) => {
                match result {
                    Err(_elapsed) => return Err(FisoError::Transform("wasm call timed out".into())),
                    Ok(inner) => inner?,
                }
            }
        }

        let stderr_bytes = stderr.contents();
        if !stderr_bytes.is_empty() {
            let message = String::from_utf8_lossy(&stderr_bytes).trim().to_string();
            if !message.is_empty() {
                return Err(FisoError::Transform(format!("wasm stderr: {message}")));
            }
        }

        let stdout_bytes = stdout.contents();
        serde_json::from_slice(&stdout_bytes)
            .map_err(|err| FisoError::Transform(format!("malformed wasm JSON output: {err}")))
    }

    /// Releases compiled-module resources: stops the background epoch
    /// ticker. Safe to call more than once.
    pub fn close(&self) {
        self.epoch_ticker.abort();
    }
}

impl Drop for CallRuntime {
    fn drop(&mut self) {
        self.close();
    }
}

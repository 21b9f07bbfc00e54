use fiso_core::{FisoError, FisoResult};
use wasmtime::{Config, Engine};

/// One `Engine` configuration shared by both runtime shapes: async support
/// (so guest calls can be driven by tokio and cancelled), and epoch-based
/// interruption so a timeout can actually preempt a runaway guest instead
/// of only gating the call future.
pub(crate) fn new_engine() -> FisoResult<Engine> {
    let mut config = Config::new();
    config.async_support(true);
    config.epoch_interruption(true);
    Engine::new(&config)
        .map_err(|err| FisoError::Internal(format!("failed to create wasm engine: {err}")))
}

/// Ticks the engine's epoch counter once a second on a background task so
/// `Store::set_epoch_deadline` timeouts actually fire. Returns a handle
/// that stops the ticker on drop.
pub(crate) fn spawn_epoch_ticker(engine: &Engine) -> tokio::task::JoinHandle<()> {
    let engine = engine.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            engine.increment_epoch();
        }
    })
}

//! Loads the `fiso.yaml` configuration root into typed structs.
//!
//! This is deliberately thin: a serde layer plus the invariant checks §3 of
//! the spec calls out. The pipeline core never reads YAML directly — it
//! only ever sees the `FlowDefinition`/`ClusterConfig` types this loader
//! produces.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use fiso_core::{ClusterConfig, FlowDefinition};
use fiso_tracing::ObservabilityConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct FisoConfig {
    pub flows: Vec<FlowDefinition>,
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterConfig>,
    #[serde(default)]
    pub wasm_apps: Vec<WasmAppConfig>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub default_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WasmAppConfig {
    pub name: String,
    pub module_path: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    pub path: String,
    #[serde(default, with = "humantime_serde::option")]
    pub interval: Option<Duration>,
}

/// Loads and validates a `fiso.yaml` file at `path`. Returns a config error
/// (wrapped with file context) on malformed YAML or a failed invariant;
/// callers at the binary boundary should exit `1` on `Err`, per §6.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<FisoConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("failed to load config file {}", path.display()))
}

pub fn parse_config(raw: &str) -> anyhow::Result<FisoConfig> {
    let config: FisoConfig = serde_yaml::from_str(raw).context("failed to parse config YAML")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &FisoConfig) -> anyhow::Result<()> {
    for flow in &config.flows {
        flow.validate()
            .with_context(|| format!("invalid flow {:?}", flow.name))?;
    }
    for (name, cluster) in &config.clusters {
        cluster
            .validate()
            .with_context(|| format!("invalid cluster config {name:?}"))?;
    }
    let mut seen = std::collections::HashSet::new();
    for app in &config.wasm_apps {
        if !seen.insert(&app.name) {
            anyhow::bail!("duplicate wasm app name {:?}", app.name);
        }
    }
    Ok(())
}

//! Translates a loaded [`fiso_config::FisoConfig`] into running components:
//! one [`fiso_pipeline::Pipeline`] per flow, a shared [`ServerPool`] for
//! pooled HTTP sources, a shared [`PublisherPool`] for message-log
//! producers, and the [`AppManager`] for any configured WASM apps.
//!
//! This module is the "adapter code outside the core" the design notes
//! (§9) call for: it is the only place that knows how a `SourceConfig`/
//! `SinkConfig`/`TransformConfig` maps onto a concrete `fiso_core::Source`/
//! `Sink`/`Transformer` implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use fiso_core::{
    ClusterConfig, FisoError, FisoResult, FlowDefinition, Sink, SinkConfig, SourceConfig,
    Source, TransformConfig,
};
use fiso_dlq::DeadLetterHandler;
use fiso_publisher_pool::PublisherPool;
use fiso_server_pool::ServerPool;
use fiso_sinks::{GrpcSink, HttpSink, HttpWorkflowClient, MessageLogSink, WorkflowClient, WorkflowSink};
use fiso_sources::{GrpcSource, HttpSource, MessageLogSource, RskafkaConsumer};
use fiso_transform::{ExprTransformer, Transformer, WasmTransformer};

const DEFAULT_WASM_TRANSFORM_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to run one flow: the built source, optional
/// transformer, sink, and DLQ handler, still un-started.
pub struct BuiltFlow {
    pub flow: FlowDefinition,
    pub source: Box<dyn Source>,
    pub transformer: Option<Arc<dyn Transformer>>,
    pub sink: Arc<dyn Sink>,
    pub dlq: Option<Arc<DeadLetterHandler>>,
}

/// Builds every flow in `config`, pre-registering any pooled HTTP sources
/// against `server_pool` as it goes. Does not start anything — callers
/// start `server_pool` once every flow is built, so a route never 404s
/// mid-startup (§4.6).
pub async fn build_flows(
    config: &fiso_config::FisoConfig,
    server_pool: &Arc<ServerPool>,
    publisher_pool: &Arc<PublisherPool>,
) -> anyhow::Result<Vec<BuiltFlow>> {
    for (name, cluster) in &config.clusters {
        publisher_pool
            .register_cluster(name.clone(), cluster.clone())
            .await;
    }

    let mut built = Vec::with_capacity(config.flows.len());
    for flow in &config.flows {
        built.push(build_flow(flow, config, server_pool, publisher_pool).await?);
    }
    Ok(built)
}

async fn build_flow(
    flow: &FlowDefinition,
    config: &fiso_config::FisoConfig,
    server_pool: &Arc<ServerPool>,
    publisher_pool: &Arc<PublisherPool>,
) -> anyhow::Result<BuiltFlow> {
    let source = build_source(&flow.source, &flow.name, config, server_pool)
        .await
        .with_context(|| format!("failed to build source for flow {:?}", flow.name))?;
    let transformer = build_transform(flow.transform.as_ref())
        .await
        .with_context(|| format!("failed to build transform for flow {:?}", flow.name))?;
    let sink = build_sink(&flow.sink, config, publisher_pool)
        .await
        .with_context(|| format!("failed to build sink for flow {:?}", flow.name))?;
    let dlq = build_dlq(flow, config, publisher_pool)
        .await
        .with_context(|| format!("failed to build dead-letter handler for flow {:?}", flow.name))?;

    Ok(BuiltFlow {
        flow: flow.clone(),
        source,
        transformer,
        sink,
        dlq,
    })
}

async fn build_source(
    cfg: &SourceConfig,
    flow_name: &str,
    config: &fiso_config::FisoConfig,
    server_pool: &Arc<ServerPool>,
) -> anyhow::Result<Box<dyn Source>> {
    match cfg {
        SourceConfig::MessageLog {
            cluster,
            topic,
            offset_reset,
            ..
        } => {
            let cluster_cfg = lookup_cluster(config, cluster)?;
            let consumer = RskafkaConsumer::connect(&cluster_cfg, topic)
                .await
                .context("failed to connect message-log source consumer")?;
            Ok(Box::new(MessageLogSource::new(
                Arc::new(consumer),
                topic.clone(),
                *offset_reset,
            )))
        }
        SourceConfig::Http { addr, path } => {
            let addr: SocketAddr = addr
                .parse()
                .with_context(|| format!("invalid http source addr {addr:?} for flow {flow_name:?}"))?;
            let source = HttpSource::pre_register(server_pool, addr, path.clone())
                .await
                .context("failed to pre-register http source route")?;
            Ok(Box::new(source))
        }
        SourceConfig::Grpc { addr } => {
            let addr: SocketAddr = addr
                .parse()
                .with_context(|| format!("invalid grpc source addr {addr:?} for flow {flow_name:?}"))?;
            Ok(Box::new(GrpcSource::new(addr)))
        }
    }
}

async fn build_transform(cfg: Option<&TransformConfig>) -> anyhow::Result<Option<Arc<dyn Transformer>>> {
    let Some(cfg) = cfg else {
        return Ok(None);
    };
    let transformer: Arc<dyn Transformer> = match cfg {
        TransformConfig::Expr { expr } => Arc::new(
            ExprTransformer::compile(expr).map_err(|err| anyhow::anyhow!(err))?,
        ),
        TransformConfig::Wasm { wasm_module } => {
            let bytes = std::fs::read(wasm_module)
                .with_context(|| format!("failed to read wasm transform module {wasm_module:?}"))?;
            Arc::new(
                WasmTransformer::compile(&bytes, DEFAULT_WASM_TRANSFORM_TIMEOUT)
                    .map_err(|err| anyhow::anyhow!(err))?,
            )
        }
    };
    Ok(Some(transformer))
}

async fn build_sink(
    cfg: &SinkConfig,
    config: &fiso_config::FisoConfig,
    publisher_pool: &Arc<PublisherPool>,
) -> anyhow::Result<Arc<dyn Sink>> {
    let sink: Arc<dyn Sink> = match cfg {
        SinkConfig::Http { url, method, headers } => {
            Arc::new(HttpSink::new(url.clone(), method, headers.clone()).map_err(|err| anyhow::anyhow!(err))?)
        }
        SinkConfig::Grpc { addr } => Arc::new(
            GrpcSink::connect(addr.clone())
                .await
                .map_err(|err| anyhow::anyhow!(err))?,
        ),
        SinkConfig::MessageLog { cluster, topic, key_expr } => Arc::new(
            MessageLogSink::new(Arc::clone(publisher_pool), cluster.clone(), topic.clone(), key_expr.as_deref())
                .map_err(|err| anyhow::anyhow!(err))?,
        ),
        SinkConfig::Workflow {
            addr,
            workflow_type,
            task_queue,
            mode,
            id_expr,
            params,
        } => {
            let client: Arc<dyn WorkflowClient> = Arc::new(HttpWorkflowClient::new(addr.clone()));
            Arc::new(
                WorkflowSink::new(client, workflow_type.clone(), task_queue.clone(), *mode, id_expr.clone(), params)
                    .map_err(|err| anyhow::anyhow!(err))?,
            )
        }
    };
    let _ = config;
    Ok(sink)
}

/// Resolves which cluster a flow's dead-letter publish goes through. The
/// contract (§4.5) only names a topic, not a cluster, so we infer one: the
/// flow's own message-log source or sink cluster if it has one, otherwise
/// the single cluster registered in the config (ambiguous with zero or
/// more than one candidate). See DESIGN.md for the rationale.
async fn build_dlq(
    flow: &FlowDefinition,
    config: &fiso_config::FisoConfig,
    publisher_pool: &Arc<PublisherPool>,
) -> anyhow::Result<Option<Arc<DeadLetterHandler>>> {
    let Some(_topic) = &flow.error_handling.dead_letter_topic else {
        return Ok(None);
    };

    let cluster = match (&flow.source, &flow.sink) {
        (SourceConfig::MessageLog { cluster, .. }, _) => cluster.clone(),
        (_, SinkConfig::MessageLog { cluster, .. }) => cluster.clone(),
        _ => {
            let mut names = config.clusters.keys();
            let only = names.next().cloned();
            if names.next().is_some() || only.is_none() {
                bail!(
                    "flow {:?} configures a dead-letter topic but has no message-log source/sink \
                     and the config doesn't register exactly one cluster to infer a DLQ cluster from",
                    flow.name
                );
            }
            only.expect("checked above")
        }
    };

    Ok(Some(Arc::new(DeadLetterHandler::new(Arc::clone(publisher_pool), cluster))))
}

fn lookup_cluster(config: &fiso_config::FisoConfig, name: &str) -> FisoResult<ClusterConfig> {
    config
        .clusters
        .get(name)
        .cloned()
        .ok_or_else(|| FisoError::Config(format!("unknown cluster {name:?}")))
}

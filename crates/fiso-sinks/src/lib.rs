//! Event deliverers (§4.4): HTTP, gRPC, message-log publisher, and
//! workflow-engine sinks. Each implements [`fiso_core::Sink`] as a single
//! delivery attempt; the pipeline runtime owns retry/backoff around it.

mod grpc;
mod http;
mod message_log;
mod workflow;

pub use grpc::GrpcSink;
pub use http::HttpSink;
pub use message_log::MessageLogSink;
pub use workflow::{HttpWorkflowClient, WorkflowClient, WorkflowSink};

//! Shared data model for the fiso event-pipeline fabric.
//!
//! This crate carries no I/O of its own: it defines the wire/data shapes
//! (`Event`, `CloudEvent`, `FlowDefinition`, `ClusterConfig`, ...), the
//! correlation-id derivation rule, and the error taxonomy used to classify
//! delivery failures as retryable or not. Everything else in the workspace
//! depends on this crate; this crate depends on nothing in the workspace.

pub mod cluster;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod event;
pub mod flow;
pub mod grpc;
pub mod handler;
pub mod sink;
pub mod source;

pub use cluster::{AuthMechanism, ClusterConfig, SaslAuth, TlsConfig};
pub use correlation::derive_correlation_id;
pub use envelope::CloudEvent;
pub use error::{FisoError, FisoResult};
pub use event::Event;
pub use flow::{ErrorHandling, FlowDefinition, SinkConfig, SourceConfig, TransformConfig};
pub use grpc::{RawCodec, DELIVER_METHOD};
pub use handler::EventHandler;
pub use sink::Sink;
pub use source::Source;

//! Long-lived event ingesters (§4.2): a message-log fetch loop, a pooled
//! HTTP listener built on `fiso-server-pool`, and a raw-codec gRPC unary
//! listener. All three implement [`fiso_core::Source`].

mod grpc;
mod http;
mod message_log;

pub use grpc::GrpcSource;
pub use http::HttpSource;
pub use message_log::{LogConsumer, MessageLogSource, RawRecord, RskafkaConsumer};

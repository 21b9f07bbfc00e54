use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use fiso_core::grpc::{RawCodec, DELIVER_METHOD};
use fiso_core::{FisoError, FisoResult, Sink};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The gRPC sink (§4.4): one unary call at the fixed
/// `/fiso.v1.EventService/Deliver` method, raw-bytes codec, headers mapped
/// onto gRPC metadata.
pub struct GrpcSink {
    channel: Channel,
    timeout: Duration,
}

impl GrpcSink {
    pub async fn connect(addr: impl Into<String>) -> FisoResult<Self> {
        Self::connect_with_timeout(addr, DEFAULT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(addr: impl Into<String>, timeout: Duration) -> FisoResult<Self> {
        let endpoint = Endpoint::from_shared(addr.into())
            .map_err(|err| FisoError::Config(format!("invalid grpc sink address: {err}")))?;
        let channel = endpoint
            .connect()
            .await
            .map_err(|err| FisoError::Transient(format!("failed to connect grpc sink: {err}")))?;
        Ok(Self { channel, timeout })
    }
}

#[async_trait]
impl Sink for GrpcSink {
    async fn deliver(&self, body: Vec<u8>, headers: BTreeMap<String, String>) -> FisoResult<()> {
        let mut request = Request::new(body);
        for (name, value) in &headers {
            let (Ok(key), Ok(value)) = (
                tonic::metadata::MetadataKey::from_bytes(name.as_bytes()),
                tonic::metadata::MetadataValue::try_from(value.as_str()),
            ) else {
                continue;
            };
            request.metadata_mut().insert(key, value);
        }

        let mut client = tonic::client::Grpc::new(self.channel.clone());
        client
            .ready()
            .await
            .map_err(|err| FisoError::Transient(format!("grpc sink channel not ready: {err}")))?;

        let path = http::uri::PathAndQuery::try_from(DELIVER_METHOD)
            .map_err(|err| FisoError::Internal(format!("invalid grpc deliver path: {err}")))?;

        match tokio::time::timeout(self.timeout, client.unary(request, path, RawCodec)).await {
            Err(_) => Err(FisoError::Transient("grpc sink call timed out".into())),
            Ok(Ok(_response)) => Ok(()),
            Ok(Err(status)) => Err(classify_status(status)),
        }
    }
}

fn classify_status(status: Status) -> FisoError {
    match status.code() {
        Code::Ok => unreachable!("Grpc::unary only returns Err on a non-ok status"),
        Code::InvalidArgument
        | Code::NotFound
        | Code::AlreadyExists
        | Code::PermissionDenied
        | Code::FailedPrecondition
        | Code::OutOfRange
        | Code::Unimplemented
        | Code::Unauthenticated => FisoError::Permanent(format!("grpc status {status}")),
        _ => FisoError::Transient(format!("grpc status {status}")),
    }
}

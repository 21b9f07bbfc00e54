use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use fiso_core::grpc::RawCodec;
use fiso_core::source::Source;
use fiso_core::{Event, EventHandler, FisoError, FisoResult};
use tokio_util::sync::CancellationToken;
use tonic::body::BoxBody;
use tonic::metadata::KeyAndValueRef;
use tonic::server::{Grpc, NamedService, UnaryService};
use tonic::{Request as GrpcRequest, Response as GrpcResponse, Status};
use tower::Service;

/// The service name half of `DELIVER_METHOD` (§6): `fiso.v1.EventService`.
/// `tonic`'s router dispatches by this name, the method name within it is
/// fixed and unchecked since the raw codec recognizes only one RPC.
const SERVICE_NAME: &str = "fiso.v1.EventService";

struct DeliverMethod {
    handler: Arc<dyn EventHandler>,
}

impl UnaryService<Vec<u8>> for DeliverMethod {
    type Response = Vec<u8>;
    type Future = Pin<Box<dyn Future<Output = Result<GrpcResponse<Vec<u8>>, Status>> + Send>>;

    fn call(&mut self, request: GrpcRequest<Vec<u8>>) -> Self::Future {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            let mut headers = BTreeMap::new();
            for kv in request.metadata().iter() {
                if let KeyAndValueRef::Ascii(key, value) = kv {
                    if let Ok(value) = value.to_str() {
                        headers.insert(key.as_str().to_string(), value.to_string());
                    }
                }
            }
            let event = Event {
                value: request.into_inner(),
                headers,
                topic: Some("grpc".to_string()),
                ..Default::default()
            };
            match handler.handle(event).await {
                Ok(()) => Ok(GrpcResponse::new(Vec::new())),
                Err(err) => Err(Status::internal(err.to_string())),
            }
        })
    }
}

/// Raw-codec unary service, hand-written rather than generated by
/// `tonic-build` since the wire payload carries no protobuf schema (§4.2,
/// §6) — there is nothing to generate a message type from.
#[derive(Clone)]
struct DeliverService {
    handler: Arc<dyn EventHandler>,
}

impl NamedService for DeliverService {
    const NAME: &'static str = SERVICE_NAME;
}

impl Service<http::Request<BoxBody>> for DeliverService {
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<BoxBody>) -> Self::Future {
        let method = DeliverMethod {
            handler: Arc::clone(&self.handler),
        };
        let mut grpc = Grpc::new(RawCodec::default());
        Box::pin(async move { Ok(grpc.unary(method, req).await) })
    }
}

/// The gRPC source (§4.2): accepts unary calls at the fixed
/// `fiso.v1.EventService/Deliver` method, extracts ASCII metadata into the
/// header map, and dispatches to the handler per call.
pub struct GrpcSource {
    addr: SocketAddr,
}

impl GrpcSource {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl Source for GrpcSource {
    async fn run(&mut self, handler: Arc<dyn EventHandler>, cancel: CancellationToken) -> FisoResult<()> {
        let service = DeliverService { handler };
        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_shutdown(self.addr, cancel.cancelled())
            .await
            .map_err(|err| FisoError::Internal(format!("grpc source server failed: {err}")))
    }
}

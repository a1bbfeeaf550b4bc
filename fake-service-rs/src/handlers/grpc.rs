//! gRPC transport

use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use tonic::{Code, Request, Response, Status};
use tracing::error;

use crate::api;
use crate::api::fake_service_server::{FakeService, FakeServiceServer};
use crate::orchestrator::{Handled, Inbound, RequestOrchestrator};

/// Implements the `FakeService` RPC interface
#[derive(Debug, Clone)]
pub struct FakeServer {
    orchestrator: Arc<RequestOrchestrator>,
}

impl FakeServer {
    pub fn new(orchestrator: Arc<RequestOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn into_service(self) -> FakeServiceServer<Self> {
        FakeServiceServer::new(self)
    }
}

/// Encode a handled request as an RPC result
///
/// Errors carry the serialized tree as status details so callers keep the
/// full diagnostic context.
pub fn encode(handled: Handled) -> Result<api::Response, Status> {
    let message = handled.response.to_json().map_err(|e| {
        error!(error = %e, "Unable to serialize response");
        Status::internal(e.to_string())
    })?;

    if !handled.terminal.is_error() {
        return Ok(api::Response { message });
    }

    let code = Code::from_i32(handled.response.code);
    let description = handled.response.error.unwrap_or_default();
    let details = api::Response { message }.encode_to_vec();

    Err(Status::with_details(code, description, Bytes::from(details)))
}

#[tonic::async_trait]
impl FakeService for FakeServer {
    async fn handle(&self, _request: Request<api::Request>) -> Result<Response<api::Response>, Status> {
        let handled = self.orchestrator.handle(Inbound::grpc()).await;
        encode(handled).map(Response::new)
    }
}

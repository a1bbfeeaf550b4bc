//! gRPC upstream client backed by tonic

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tonic::metadata::MetadataMap;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;
use tracing::debug;

use super::flatten_headers;
use crate::api::fake_service_client::FakeServiceClient;
use crate::api::Request;
use crate::error::{Result, ServiceError};

/// Scheme prefix used in `UPSTREAM_URIS` for gRPC targets
pub const GRPC_SCHEME: &str = "grpc://";

/// A successful call
#[derive(Debug, Clone, Default)]
pub struct GrpcReply {
    /// JSON encoded response tree of the upstream
    pub message: String,
    pub headers: HashMap<String, String>,
}

/// Interface for calling a single gRPC upstream
#[async_trait]
pub trait GrpcClient: Send + Sync {
    async fn handle(&self, data: Vec<u8>) -> std::result::Result<GrpcReply, Status>;
}

/// tonic implementation of [`GrpcClient`]; the channel connects on first use
#[derive(Debug, Clone)]
pub struct TonicClient {
    client: FakeServiceClient<Channel>,
}

impl TonicClient {
    /// Create a lazily connected client for a `grpc://host:port` target
    pub fn connect_lazy(uri: &str, timeout: Duration) -> Result<Self> {
        let address = format!("http://{}", uri.strip_prefix(GRPC_SCHEME).unwrap_or(uri));

        let endpoint = Endpoint::from_shared(address)
            .map_err(|e| ServiceError::configuration(format!("Invalid gRPC upstream {}: {}", uri, e)))?
            .timeout(timeout)
            .connect_timeout(timeout);

        debug!(uri = %uri, "Created lazy gRPC channel");

        Ok(Self {
            client: FakeServiceClient::new(endpoint.connect_lazy()),
        })
    }
}

#[async_trait]
impl GrpcClient for TonicClient {
    async fn handle(&self, data: Vec<u8>) -> std::result::Result<GrpcReply, Status> {
        // channels are cheap to clone and multiplex over one connection
        let mut client = self.client.clone();
        let response = client.handle(Request { data }).await?;

        let headers = metadata_headers(response.metadata());
        Ok(GrpcReply {
            message: response.into_inner().message,
            headers,
        })
    }
}

/// Printable metadata entries; binary entries are skipped
pub fn metadata_headers(metadata: &MetadataMap) -> HashMap<String, String> {
    let headers = metadata.clone().into_headers();
    flatten_headers(headers.iter().map(|(name, value)| (name.as_str(), value.to_str().ok())))
}

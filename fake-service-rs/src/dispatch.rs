//! # Upstream Dispatch
//!
//! Routes a target URI to the HTTP or gRPC client and turns the reply into a
//! response fragment for the caller's tree.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use tonic::Status;
use tracing::{error, warn};

use crate::api;
use crate::client::grpc::metadata_headers;
use crate::client::{ForwardContext, GrpcClient, HttpClient, HttpReply, UpstreamRequest};
use crate::error::UpstreamError;
use crate::response::{ResponseTree, ServiceType};
use crate::worker::{Dispatch, Dispatched};

/// gRPC clients keyed by their configured upstream URI
pub type GrpcClients = HashMap<String, Arc<dyn GrpcClient>>;

/// True when the target is called over HTTP
pub fn is_http_target(uri: &str) -> bool {
    uri.starts_with("http://") || uri.starts_with("https://")
}

/// Dispatches one request's upstream calls
///
/// Built per inbound request since the generated body and forwarded context
/// belong to that request.
#[derive(Clone)]
pub struct UpstreamDispatcher {
    http: Arc<dyn HttpClient>,
    grpc: Arc<GrpcClients>,
    body: Option<Bytes>,
    forward: Option<ForwardContext>,
}

impl UpstreamDispatcher {
    pub fn new(http: Arc<dyn HttpClient>, grpc: Arc<GrpcClients>) -> Self {
        Self {
            http,
            grpc,
            body: None,
            forward: None,
        }
    }

    /// Payload sent to every upstream
    pub fn with_body(mut self, body: Option<Bytes>) -> Self {
        self.body = body.filter(|b| !b.is_empty());
        self
    }

    /// Inbound context that HTTP upstreams may receive
    pub fn with_forward(mut self, forward: Option<ForwardContext>) -> Self {
        self.forward = forward;
        self
    }

    async fn dispatch_http(&self, uri: &str) -> Dispatched {
        let reply = self
            .http
            .call(UpstreamRequest {
                uri: uri.to_string(),
                body: self.body.clone(),
                forward: self.forward.clone(),
            })
            .await;

        http_fragment(uri, reply)
    }

    async fn dispatch_grpc(&self, uri: &str) -> Dispatched {
        let Some(client) = self.grpc.get(uri) else {
            error!(uri = %uri, "No gRPC client configured for upstream");
            let err = UpstreamError::NoClient(uri.to_string());

            let mut fragment = ResponseTree {
                uri: uri.to_string(),
                service_type: Some(ServiceType::Grpc),
                ..ResponseTree::default()
            };
            fragment.set_error(tonic::Code::Internal as i32, err.to_string());
            return Dispatched::failed(fragment, err);
        };

        let data = self.body.as_ref().map(|b| b.to_vec()).unwrap_or_default();
        match client.handle(data).await {
            Ok(reply) => {
                let mut fragment = parse_fragment(uri, reply.message.as_bytes());
                fragment.uri = uri.to_string();
                fragment.service_type = Some(ServiceType::Grpc);
                fragment.headers = reply.headers;
                Dispatched::ok(fragment)
            }
            Err(status) => grpc_failure(uri, status),
        }
    }
}

#[async_trait]
impl Dispatch for UpstreamDispatcher {
    async fn dispatch(&self, uri: &str) -> Dispatched {
        if is_http_target(uri) {
            self.dispatch_http(uri).await
        } else {
            self.dispatch_grpc(uri).await
        }
    }
}

/// Build the fragment for an HTTP reply
///
/// The upstream's own tree is kept when it parses; the transport level
/// fields always come from the reply itself.
fn http_fragment(uri: &str, reply: HttpReply) -> Dispatched {
    let mut fragment = match reply.body.as_deref() {
        Some(body) if !body.is_empty() => parse_fragment(uri, body),
        _ => ResponseTree::default(),
    };

    fragment.uri = uri.to_string();
    fragment.code = reply.status;
    fragment.headers = reply.headers;
    fragment.cookies = reply.cookies;

    match reply.error {
        Some(err) => {
            fragment.set_error(reply.status, err.to_string());
            Dispatched::failed(fragment, err)
        }
        None => Dispatched::ok(fragment),
    }
}

/// Build the fragment for a failed RPC, recovering the upstream tree from the
/// status details when present
fn grpc_failure(uri: &str, status: Status) -> Dispatched {
    let mut fragment = match api::Response::decode(status.details()) {
        Ok(details) if !details.message.is_empty() => parse_fragment(uri, details.message.as_bytes()),
        _ => ResponseTree::default(),
    };

    let code = status.code() as i32;
    let err = UpstreamError::Rpc {
        code,
        message: format!("rpc error: code = {:?} desc = {}", status.code(), status.message()),
    };

    fragment.uri = uri.to_string();
    fragment.service_type = Some(ServiceType::Grpc);
    fragment.headers = metadata_headers(status.metadata());
    fragment.set_error(code, err.to_string());

    Dispatched::failed(fragment, err)
}

fn parse_fragment(uri: &str, data: &[u8]) -> ResponseTree {
    ResponseTree::from_json(data).unwrap_or_else(|e| {
        warn!(uri = %uri, error = %e, "Unable to read response JSON");
        ResponseTree::default()
    })
}

//! Upstream clients
//!
//! Thin transport wrappers behind traits so the orchestrator can be driven by
//! mock clients in tests.

pub mod grpc;
pub mod http;

use std::collections::HashMap;

pub use grpc::{GrpcClient, GrpcReply, TonicClient};
pub use http::{ForwardContext, HttpClient, HttpClientSettings, HttpReply, ReqwestClient, UpstreamRequest};

/// Flatten a header map into `name -> value`, joining repeated names with a comma
pub(crate) fn flatten_headers<'a, I>(headers: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
{
    let mut out: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        let Some(value) = value else { continue };
        out.entry(name.to_string())
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

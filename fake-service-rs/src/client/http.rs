//! HTTP upstream client backed by reqwest

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use tracing::debug;

use super::flatten_headers;
use crate::error::{Result, ServiceError, UpstreamError};

/// Status reported when the upstream could not be reached at all
pub const NO_RESPONSE_CODE: i32 = -1;

// Never copied from the inbound request
const HOP_BY_HOP: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "te",
    "trailer",
    "proxy-authorization",
    "proxy-connection",
];

/// Parts of the inbound HTTP request that may be forwarded upstream
#[derive(Debug, Clone, Default)]
pub struct ForwardContext {
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
}

/// One outbound call
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub uri: String,
    /// GET when absent, POST otherwise
    pub body: Option<Bytes>,
    pub forward: Option<ForwardContext>,
}

/// Raw upstream reply; body, headers and cookies are kept even on error
#[derive(Debug, Clone, Default)]
pub struct HttpReply {
    pub status: i32,
    pub body: Option<Bytes>,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub error: Option<UpstreamError>,
}

impl HttpReply {
    fn unreachable(error: UpstreamError) -> Self {
        Self {
            status: NO_RESPONSE_CODE,
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Interface for upstream HTTP requests
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn call(&self, request: UpstreamRequest) -> HttpReply;
}

/// Client construction settings
#[derive(Debug, Clone)]
pub struct HttpClientSettings {
    pub keep_alives: bool,
    /// Append the inbound path and headers to upstream calls
    pub append_request: bool,
    pub timeout: Duration,
    pub allow_insecure: bool,
}

impl Default for HttpClientSettings {
    fn default() -> Self {
        Self {
            keep_alives: false,
            append_request: true,
            timeout: Duration::from_secs(30),
            allow_insecure: false,
        }
    }
}

/// Concrete reqwest implementation of [`HttpClient`]
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
    append_request: bool,
}

impl ReqwestClient {
    pub fn new(settings: &HttpClientSettings) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(settings.timeout)
            .danger_accept_invalid_certs(settings.allow_insecure);

        if !settings.keep_alives {
            builder = builder.pool_max_idle_per_host(0);
        }

        let client = builder
            .build()
            .map_err(|e| ServiceError::configuration(format!("Unable to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            append_request: settings.append_request,
        })
    }

    fn build_url(&self, request: &UpstreamRequest) -> std::result::Result<Url, UpstreamError> {
        let mut url = Url::parse(&request.uri).map_err(|e| UpstreamError::InvalidTarget {
            uri: request.uri.clone(),
            reason: e.to_string(),
        })?;

        if let Some(forward) = request.forward.as_ref().filter(|_| self.append_request) {
            append_path(&mut url, forward);
        }

        Ok(url)
    }

    fn build_headers(&self, request: &UpstreamRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();

        let Some(forward) = request.forward.as_ref().filter(|_| self.append_request) else {
            return headers;
        };

        for (name, value) in &forward.headers {
            if HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }

            let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) else {
                continue;
            };

            if !headers.contains_key(&name) {
                headers.insert(name, value);
            }
        }

        headers
    }
}

/// Append the inbound path (and query when the target has none) to the target URL
fn append_path(url: &mut Url, forward: &ForwardContext) {
    if !forward.path.is_empty() && forward.path != "/" {
        let joined = format!("{}{}", url.path().trim_end_matches('/'), forward.path);
        url.set_path(&joined);
    }

    if url.query().is_none() {
        if let Some(query) = forward.query.as_deref().filter(|q| !q.is_empty()) {
            url.set_query(Some(query));
        }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn call(&self, request: UpstreamRequest) -> HttpReply {
        let url = match self.build_url(&request) {
            Ok(url) => url,
            Err(e) => return HttpReply::unreachable(e),
        };

        let method = match request.body {
            Some(ref body) if !body.is_empty() => Method::POST,
            _ => Method::GET,
        };

        debug!(method = %method, url = %url, "Calling upstream");

        let mut builder = self
            .client
            .request(method, url.clone())
            .headers(self.build_headers(&request));

        if let Some(body) = request.body.filter(|b| !b.is_empty()) {
            builder = builder.body(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return HttpReply::unreachable(UpstreamError::Communication(e.to_string())),
        };

        let status = i32::from(response.status().as_u16());

        let headers = flatten_headers(
            response
                .headers()
                .iter()
                .map(|(name, value)| (name.as_str(), value.to_str().ok())),
        );

        let cookies = response
            .cookies()
            .map(|c| (c.name().to_string(), c.value().to_string()))
            .collect();

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                return HttpReply {
                    status,
                    headers,
                    cookies,
                    error: Some(UpstreamError::ReadBody(e.to_string())),
                    ..HttpReply::default()
                }
            }
        };

        let error = (status != 200).then(|| UpstreamError::UnexpectedStatus {
            uri: url.to_string(),
            code: status,
        });

        HttpReply {
            status,
            body: Some(body),
            headers,
            cookies,
            error,
        }
    }
}

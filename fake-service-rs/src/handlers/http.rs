//! HTTP transport
//!
//! Every path that is not a management endpoint is handled by the
//! orchestrator, so the service can stand in for any API.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::{HeaderName, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use tower_http::cors::{AllowHeaders, AllowOrigin, Any, CorsLayer};
use tracing::{error, warn};

use super::config::config_handler;
use super::health::health_handler;
use super::ready::ready_handler;
use super::{status_code, Health, Readiness};
use crate::client::ForwardContext;
use crate::orchestrator::{Inbound, RequestOrchestrator};

/// Shared state for the HTTP routes
#[derive(Debug, Clone)]
pub struct AppState {
    pub orchestrator: Arc<RequestOrchestrator>,
    pub readiness: Arc<Readiness>,
    pub health: Arc<Health>,
}

/// Cross-origin settings for the HTTP listener
#[derive(Debug, Clone)]
pub struct CorsSettings {
    pub allowed_origins: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
}

impl Default for CorsSettings {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_headers: vec![
                "Accept".to_string(),
                "Accept-Language".to_string(),
                "Content-Language".to_string(),
                "Origin".to_string(),
                "Content-Type".to_string(),
            ],
            allow_credentials: false,
        }
    }
}

/// Create the router with all routes and middleware
pub fn create_router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/config/:parameter/:value", any(config_handler))
        .fallback(request_handler)
        .layer(cors)
        .with_state(state)
}

/// Build the CORS layer
///
/// `*` origins or headers mean any. Credentials are only allowed with an
/// explicit origin list.
pub fn cors_layer(settings: &CorsSettings) -> CorsLayer {
    let any_origin = settings.allowed_origins.is_empty() || settings.allowed_origins.iter().any(|o| o == "*");
    let any_header = settings.allowed_headers.iter().any(|h| h == "*");

    let origins = if any_origin {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(
            settings
                .allowed_origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        )
    };

    let headers = if any_header {
        AllowHeaders::from(Any)
    } else {
        AllowHeaders::list(
            settings
                .allowed_headers
                .iter()
                .filter_map(|h| HeaderName::from_bytes(h.as_bytes()).ok()),
        )
    };

    let credentials = settings.allow_credentials && !any_origin && !any_header;
    if settings.allow_credentials && !credentials {
        warn!("Credentials can not be allowed with wildcard origins or headers, ignoring ALLOW_CREDENTIALS");
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_headers(headers)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ])
        .allow_credentials(credentials)
}

/// Catch-all handler running the orchestrator
async fn request_handler(State(state): State<AppState>, uri: Uri, headers: HeaderMap) -> Response {
    let forward = ForwardContext {
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers: headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
            .collect(),
    };

    let handled = state.orchestrator.handle(Inbound::http(uri.to_string(), forward)).await;

    match handled.response.to_json() {
        Ok(body) => (
            status_code(handled.response.code),
            [(CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Unable to serialize response");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

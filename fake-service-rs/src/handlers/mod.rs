//! Transport handlers
//!
//! HTTP routes served by axum and the gRPC service served by tonic. Both feed
//! the same [`RequestOrchestrator`](crate::orchestrator::RequestOrchestrator).

pub mod config;
pub mod grpc;
pub mod health;
pub mod http;
pub mod ready;

pub use grpc::FakeServer;
pub use health::Health;
pub use http::{cors_layer, create_router, AppState, CorsSettings};
pub use ready::Readiness;

use axum::http::StatusCode;

/// Map a numeric status to an HTTP status, falling back to 500
pub(crate) fn status_code(code: i32) -> StatusCode {
    u16::try_from(code)
        .ok()
        .and_then(|c| StatusCode::from_u16(c).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
